//! Unix-socket IPC between the daemon and its clients.
//!
//! The protocol is newline-delimited JSON: one request per line, one
//! response line back. Requests and responses are tagged enums, so unknown
//! message types fail to parse instead of being silently misread.

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};

/// Client-to-daemon request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Local data changed; sync soon.
    Notify,
    /// Report daemon state and per-remote queue depths.
    Status,
    /// Shut down gracefully.
    Stop,
}

/// Daemon-to-client response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ack,
    Status(StatusReply),
    Stopping,
    Error { message: String },
}

/// Per-remote slice of a status reply.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RemoteStatus {
    pub id: String,
    /// Queue entries waiting to be pushed.
    pub pending: i64,
    /// Queue entries in terminal failure, kept for operator visibility.
    pub failed: i64,
    /// Outcome of the last completed cycle, if any.
    pub last_result: Option<String>,
}

/// Full status snapshot returned for a `status` request.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatusReply {
    pub running: bool,
    pub pid: u32,
    /// Daemon loop state: "starting", "idle", "syncing" or "shutting_down".
    pub state: String,
    pub last_sync: Option<String>,
    /// Completed sync cycles since this daemon started.
    pub sync_count: u64,
    pub remotes: Vec<RemoteStatus>,
    pub heartbeat_healthy: bool,
}

/// Commands the IPC server forwards into the daemon loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcCommand {
    Notify,
    Stop,
}

/// Bind the daemon socket, replacing a stale socket file if the previous
/// owner is gone.
pub fn bind(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        // A connectable socket means another daemon is alive; refuse.
        match std::os::unix::net::UnixStream::connect(path) {
            Ok(_) => anyhow::bail!("Socket {} is already in use", path.display()),
            Err(_) => {
                debug!("Removing stale socket {}", path.display());
                std::fs::remove_file(path)?;
            }
        }
    }

    let listener = UnixListener::bind(path).with_context(|| format!("Failed to bind socket {}", path.display()))?;

    // The socket carries control of the user's daemon; keep it private.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(listener)
}

/// Accept loop. Each connection is served inline; requests are tiny and a
/// client sends exactly one, so per-connection tasks buy nothing.
pub async fn serve(
    listener: UnixListener,
    cmd_tx: mpsc::Sender<IpcCommand>,
    status_rx: watch::Receiver<StatusReply>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        if let Err(e) = handle_connection(stream, &cmd_tx, &status_rx).await {
                            warn!("IPC connection error: {e}");
                        }
                    }
                    Err(e) => {
                        warn!("IPC accept error: {e}");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    cmd_tx: &mpsc::Sender<IpcCommand>,
    status_rx: &watch::Receiver<StatusReply>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(());
    }

    let response = match serde_json::from_str::<Request>(line.trim()) {
        Ok(Request::Notify) => {
            // Latest-wins: a full channel already holds a pending wakeup.
            let _ = cmd_tx.try_send(IpcCommand::Notify);
            Response::Ack
        }
        Ok(Request::Status) => Response::Status(status_rx.borrow().clone()),
        Ok(Request::Stop) => {
            let _ = cmd_tx.try_send(IpcCommand::Stop);
            Response::Stopping
        }
        Err(e) => Response::Error { message: format!("Invalid request: {e}") },
    };

    let mut payload = serde_json::to_vec(&response)?;
    payload.push(b'\n');
    write_half.write_all(&payload).await?;
    write_half.flush().await?;

    Ok(())
}
