//! Client for the background daemon.
//!
//! The client keeps local mutations fast: `notify` either pokes a running
//! daemon over the Unix socket (bounded by a short timeout) or spawns a
//! detached daemon that will pick up the queued work itself. The caller
//! never waits for a sync to finish.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::constants::CLIENT_CONNECT_TIMEOUT_MS;
use crate::daemon::{lock, Request, Response, StatusReply};
use crate::paths;

/// How long to wait for a freshly-spawned daemon's socket to appear.
const SPAWN_WAIT: Duration = Duration::from_secs(5);
const SPAWN_POLL: Duration = Duration::from_millis(100);

pub struct DaemonClient {
    socket_path: PathBuf,
    lock_path: PathBuf,
    timeout: Duration,
}

impl DaemonClient {
    pub fn new() -> Result<Self> {
        Ok(Self {
            socket_path: paths::socket_path()?,
            lock_path: paths::lock_path()?,
            timeout: Duration::from_millis(CLIENT_CONNECT_TIMEOUT_MS),
        })
    }

    /// Tell the daemon that local data changed, starting one if needed.
    ///
    /// Returns once the notification is acknowledged or the daemon is
    /// spawned; the sync itself happens in the background.
    pub async fn notify(&self) -> Result<()> {
        match self.request(&Request::Notify).await {
            Ok(Response::Ack) => {
                debug!("Daemon acknowledged notification");
                return Ok(());
            }
            Ok(other) => {
                warn!("Unexpected response to notify: {other:?}");
                return Ok(());
            }
            Err(e) => {
                debug!("Could not reach daemon: {e}");
            }
        }

        // No daemon answered. A live lock holder means one is mid-startup
        // or wedged; spawning another would just lose the lock race.
        if let Ok(meta) = lock::read_meta(&self.lock_path) {
            if lock::pid_alive(meta.pid) {
                info!("Daemon (pid {}) holds the lock but is not answering yet", meta.pid);
                return Ok(());
            }
        }

        self.spawn_daemon()?;

        // Best effort: the new daemon syncs on startup anyway, so a missed
        // notification here is not a lost update.
        let deadline = tokio::time::Instant::now() + SPAWN_WAIT;
        while tokio::time::Instant::now() < deadline {
            if let Ok(Response::Ack) = self.request(&Request::Notify).await {
                return Ok(());
            }
            tokio::time::sleep(SPAWN_POLL).await;
        }
        debug!("Spawned daemon did not answer within {SPAWN_WAIT:?}; it will sync on startup");
        Ok(())
    }

    /// Fetch the daemon's status. Returns a `running: false` reply when no
    /// daemon is reachable.
    pub async fn status(&self) -> Result<StatusReply> {
        match self.request(&Request::Status).await {
            Ok(Response::Status(reply)) => Ok(reply),
            Ok(other) => anyhow::bail!("Unexpected response to status: {other:?}"),
            Err(_) => Ok(StatusReply::default()),
        }
    }

    /// Ask the daemon to shut down. Returns `false` when none was running.
    pub async fn stop(&self) -> Result<bool> {
        match self.request(&Request::Stop).await {
            Ok(Response::Stopping) => Ok(true),
            Ok(other) => anyhow::bail!("Unexpected response to stop: {other:?}"),
            Err(_) => Ok(false),
        }
    }

    /// One request/response round trip, bounded by the connect timeout.
    async fn request(&self, request: &Request) -> Result<Response> {
        let stream = tokio::time::timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .context("Timed out connecting to daemon")??;

        let (read_half, mut write_half) = stream.into_split();

        let mut payload = serde_json::to_vec(request)?;
        payload.push(b'\n');
        write_half.write_all(&payload).await?;
        write_half.flush().await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        tokio::time::timeout(self.timeout, reader.read_line(&mut line))
            .await
            .context("Timed out waiting for daemon response")??;

        Ok(serde_json::from_str(line.trim())?)
    }

    /// Spawn a detached daemon process running `tasknest daemon`.
    fn spawn_daemon(&self) -> Result<()> {
        use std::os::unix::process::CommandExt;

        let exe = std::env::current_exe().context("Could not locate own executable")?;
        info!("Spawning background daemon: {} daemon", exe.display());

        std::process::Command::new(exe)
            .arg("daemon")
            .process_group(0)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .context("Failed to spawn daemon process")?;

        Ok(())
    }
}
