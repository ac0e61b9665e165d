//! Background sync daemon.
//!
//! A single instance per data directory (enforced by the lock file) owns the
//! Unix socket, the heartbeat file and one [`SyncService`] per enabled
//! remote. The main loop multiplexes IPC commands, periodic sync schedules,
//! finished cycles and termination signals; remotes sync concurrently but a
//! remote never overlaps with itself.

pub mod heartbeat;
pub mod ipc;
pub mod lock;

pub use ipc::{IpcCommand, RemoteStatus, Request, Response, StatusReply};
pub use lock::{LockError, LockFile, LockMeta};

use anyhow::Result;
use log::{error, info, warn};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::config::Config;
use crate::paths;
use crate::remote::factory;
use crate::storage::LocalStorage;
use crate::sync::{SyncService, SyncStatus};
use heartbeat::HeartbeatStatus;

/// Daemon loop state, surfaced through `status` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Starting,
    Idle,
    Syncing,
    ShuttingDown,
}

impl DaemonState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonState::Starting => "starting",
            DaemonState::Idle => "idle",
            DaemonState::Syncing => "syncing",
            DaemonState::ShuttingDown => "shutting_down",
        }
    }
}

/// One managed remote: its sync service, periodic schedule and last outcome.
struct RemoteSlot {
    service: SyncService,
    interval: Option<Duration>,
    next_due: Option<Instant>,
    last_result: Option<String>,
    busy: bool,
}

/// Run the daemon until idle timeout, a stop request, a termination signal
/// or the consecutive-failure ceiling.
///
/// Returns `Ok(())` without doing anything when another instance already
/// holds the lock.
pub async fn run(config: Config) -> Result<()> {
    paths::ensure_data_dirs()?;
    let lock_path = paths::lock_path()?;
    let socket_path = paths::socket_path()?;

    let lock = match LockFile::acquire(&lock_path, &socket_path) {
        Ok(lock) => lock,
        Err(LockError::Held { pid }) => {
            info!("Daemon already running (pid {pid}), nothing to do");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    info!("🚀 Daemon starting (pid {})", std::process::id());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut slots = Vec::new();
    for (remote_id, instance) in &config.remotes.instances {
        if !instance.enabled {
            continue;
        }
        let remote = match factory::create_remote(remote_id, instance) {
            Ok(remote) => remote,
            Err(e) => {
                warn!("Skipping remote '{remote_id}': {e}");
                continue;
            }
        };
        let storage = LocalStorage::open(paths::remote_db_path(remote_id)?).await?;
        let service = SyncService::new(
            remote_id.clone(),
            remote,
            storage,
            instance.conflict_resolution,
            config.queue.clone(),
            config.daemon.op_timeout(),
            shutdown_rx.clone(),
        );
        slots.push(RemoteSlot {
            service,
            interval: instance.effective_interval(&config.sync),
            next_due: None,
            last_result: None,
            busy: false,
        });
    }
    if slots.is_empty() {
        warn!("No enabled remotes configured; daemon will only answer status requests");
    }

    let listener = ipc::bind(&socket_path)?;
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (status_tx, status_rx) = watch::channel(StatusReply::default());
    let (hb_status_tx, hb_status_rx) = watch::channel(HeartbeatStatus::Idle);

    let heartbeat_handle = heartbeat::spawn_writer(
        paths::heartbeat_path()?,
        config.daemon.heartbeat_interval(),
        hb_status_rx,
        shutdown_rx.clone(),
    );
    let ipc_handle = tokio::spawn(ipc::serve(listener, cmd_tx, status_rx, shutdown_rx.clone()));

    let result = main_loop(&config, &mut slots, cmd_rx, &status_tx, &hb_status_tx, &shutdown_tx).await;

    // Signal shutdown to the helper tasks, then clean up runtime files.
    let _ = shutdown_tx.send(true);
    let _ = heartbeat_handle.await;
    let _ = ipc_handle.await;
    if let Err(e) = std::fs::remove_file(&socket_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove socket file: {e}");
        }
    }
    drop(lock);

    info!("👋 Daemon stopped");
    result
}

async fn main_loop(
    config: &Config,
    slots: &mut [RemoteSlot],
    mut cmd_rx: mpsc::Receiver<IpcCommand>,
    status_tx: &watch::Sender<StatusReply>,
    hb_status_tx: &watch::Sender<HeartbeatStatus>,
    shutdown_tx: &watch::Sender<bool>,
) -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    let idle_timeout = config.daemon.idle_timeout();
    // With a periodic schedule the daemon stays resident; the idle timeout
    // only governs the notification-driven mode.
    let periodic = slots.iter().any(|s| s.interval.is_some());

    let mut cycles: JoinSet<(usize, Result<SyncStatus>)> = JoinSet::new();
    let mut last_activity = Instant::now();
    let mut consecutive_failures: u32 = 0;
    let mut stopping = false;
    let mut last_sync: Option<String> = None;
    let mut sync_count: u64 = 0;

    // The daemon is spawned because something changed, so sync right away.
    let mut state = DaemonState::Starting;
    for idx in 0..slots.len() {
        start_cycle(slots, idx, &mut cycles);
    }
    publish_status(slots, status_tx, state, config, last_sync.as_deref(), sync_count).await;

    loop {
        if stopping && cycles.is_empty() {
            break;
        }

        state = if !cycles.is_empty() {
            DaemonState::Syncing
        } else if stopping {
            DaemonState::ShuttingDown
        } else {
            DaemonState::Idle
        };
        let _ = hb_status_tx.send(match state {
            DaemonState::Syncing => HeartbeatStatus::Processing,
            _ if consecutive_failures > 0 => HeartbeatStatus::Error,
            _ => HeartbeatStatus::Idle,
        });
        publish_status(slots, status_tx, state, config, last_sync.as_deref(), sync_count).await;

        let idle_deadline = last_activity + idle_timeout;
        let next_due = slots
            .iter()
            .filter(|s| !s.busy)
            .filter_map(|s| s.next_due)
            .min();
        let far_future = Instant::now() + Duration::from_secs(86_400);

        tokio::select! {
            _ = tokio::time::sleep_until(idle_deadline), if cycles.is_empty() && !periodic && !stopping => {
                // The idle timer doubles as the retry trigger: leftover
                // queued work (backed off or deferred) keeps the daemon
                // alive, an empty queue ends it.
                let mut queued = 0;
                let now = Instant::now();
                for idx in 0..slots.len() {
                    let pending = slots[idx]
                        .service
                        .storage()
                        .queue_depth()
                        .await
                        .map(|d| d.pending)
                        .unwrap_or(0);
                    queued += pending;
                    if pending > 0 && !slots[idx].busy && slots[idx].next_due.map_or(true, |due| due <= now) {
                        start_cycle(slots, idx, &mut cycles);
                    }
                }
                if queued == 0 {
                    info!("Idle for {}s with no work, exiting", idle_timeout.as_secs());
                    break;
                }
                last_activity = now;
            }

            _ = tokio::time::sleep_until(next_due.unwrap_or(far_future)), if next_due.is_some() && !stopping => {
                let now = Instant::now();
                for idx in 0..slots.len() {
                    if !slots[idx].busy && slots[idx].next_due.is_some_and(|due| due <= now) {
                        start_cycle(slots, idx, &mut cycles);
                    }
                }
            }

            cmd = cmd_rx.recv() => match cmd {
                Some(IpcCommand::Notify) => {
                    last_activity = Instant::now();
                    info!("🔔 Notification received, syncing all remotes");
                    for idx in 0..slots.len() {
                        if !slots[idx].busy {
                            start_cycle(slots, idx, &mut cycles);
                        }
                    }
                }
                Some(IpcCommand::Stop) => {
                    info!("Stop requested over IPC");
                    stopping = true;
                    let _ = shutdown_tx.send(true);
                }
                None => {
                    stopping = true;
                }
            },

            Some(joined) = cycles.join_next(), if !cycles.is_empty() => {
                last_activity = Instant::now();
                match joined {
                    Ok((idx, outcome)) => {
                        let slot = &mut slots[idx];
                        slot.busy = false;
                        let mut failed = false;
                        match outcome {
                            Ok(SyncStatus::Success { report }) => {
                                consecutive_failures = 0;
                                sync_count += 1;
                                last_sync = Some(chrono::Utc::now().to_rfc3339());
                                slot.last_result = Some(format!(
                                    "ok: {} pulled, {} pushed, {} conflicts",
                                    report.pulled, report.pushed, report.conflicts
                                ));
                            }
                            Ok(SyncStatus::Error { message }) => {
                                consecutive_failures += 1;
                                failed = true;
                                slot.last_result = Some(format!("error: {message}"));
                            }
                            Ok(_) => {}
                            Err(e) => {
                                consecutive_failures += 1;
                                failed = true;
                                slot.last_result = Some(format!("error: {e}"));
                                error!("[{}] Cycle crashed: {e}", slot.service.remote_id());
                            }
                        }
                        slot.next_due = if failed {
                            // Space out retries as the failure count grows
                            Some(Instant::now() + failure_backoff(consecutive_failures))
                        } else {
                            slot.interval.map(|interval| Instant::now() + interval)
                        };
                        if consecutive_failures >= config.daemon.max_consecutive_failures {
                            error!(
                                "💥 {consecutive_failures} consecutive failed cycles, giving up"
                            );
                            let _ = shutdown_tx.send(true);
                            anyhow::bail!("{consecutive_failures} consecutive failed sync cycles");
                        }
                    }
                    Err(e) => {
                        // The panicking task's slot index is lost and its
                        // in-progress guard may be wedged; bail out rather
                        // than run with a half-broken schedule.
                        error!("Sync task panicked: {e}");
                        let _ = shutdown_tx.send(true);
                        anyhow::bail!("sync task panicked: {e}");
                    }
                }
            },

            _ = sigterm.recv() => {
                if stopping {
                    warn!("Second SIGTERM, exiting without waiting for cycles");
                    break;
                }
                info!("Received SIGTERM, shutting down");
                stopping = true;
                let _ = shutdown_tx.send(true);
            }

            _ = sigint.recv() => {
                if stopping {
                    warn!("Second SIGINT, exiting without waiting for cycles");
                    break;
                }
                info!("Received SIGINT, shutting down");
                stopping = true;
                let _ = shutdown_tx.send(true);
            }
        }
    }

    publish_status(slots, status_tx, DaemonState::ShuttingDown, config, last_sync.as_deref(), sync_count).await;
    Ok(())
}

/// Delay before the next cycle after `failures` consecutive failed ones.
fn failure_backoff(failures: u32) -> Duration {
    Duration::from_secs((1u64 << failures.min(8)).min(300))
}

fn start_cycle(slots: &mut [RemoteSlot], idx: usize, cycles: &mut JoinSet<(usize, Result<SyncStatus>)>) {
    let slot = &mut slots[idx];
    slot.busy = true;
    slot.next_due = None;
    let service = slot.service.clone();
    cycles.spawn(async move { (idx, service.sync().await) });
}

/// Rebuild the status snapshot served to IPC clients.
async fn publish_status(
    slots: &[RemoteSlot],
    status_tx: &watch::Sender<StatusReply>,
    state: DaemonState,
    config: &Config,
    last_sync: Option<&str>,
    sync_count: u64,
) {
    let mut remotes = Vec::with_capacity(slots.len());
    for slot in slots {
        let depth = slot.service.storage().queue_depth().await.unwrap_or_default();
        remotes.push(RemoteStatus {
            id: slot.service.remote_id().to_string(),
            pending: depth.pending,
            failed: depth.failed,
            last_result: slot.last_result.clone(),
        });
    }

    let heartbeat_healthy = paths::heartbeat_path()
        .map(|path| heartbeat::healthy(&path, config.daemon.heartbeat_interval()))
        .unwrap_or(false);

    let _ = status_tx.send(StatusReply {
        running: true,
        pid: std::process::id(),
        state: state.as_str().to_string(),
        last_sync: last_sync.map(String::from),
        sync_count,
        remotes,
        heartbeat_healthy,
    });
}
