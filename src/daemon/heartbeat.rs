//! Daemon heartbeat file.
//!
//! The daemon rewrites a small JSON file on a fixed cadence so external
//! tooling can tell a live daemon from a crashed one without talking to the
//! socket. A heartbeat older than twice the cadence counts as stale.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;

/// Coarse daemon activity indicator carried in the heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatStatus {
    Idle,
    Processing,
    Error,
}

/// One heartbeat record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp: DateTime<Utc>,
    pub status: HeartbeatStatus,
    pub pid: u32,
}

impl Heartbeat {
    pub fn now(status: HeartbeatStatus) -> Self {
        Self {
            timestamp: Utc::now(),
            status,
            pid: std::process::id(),
        }
    }

    /// A heartbeat is stale once it is older than twice the write cadence.
    pub fn is_stale(&self, interval: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.timestamp);
        age.num_milliseconds() > (interval.as_millis() * 2) as i64
    }
}

/// Write a heartbeat record, replacing any previous one.
pub fn write(path: &Path, status: HeartbeatStatus) -> std::io::Result<()> {
    let beat = Heartbeat::now(status);
    let json = serde_json::to_string(&beat).map_err(std::io::Error::other)?;
    std::fs::write(path, json)
}

/// Read the current heartbeat, if one exists and parses.
pub fn read(path: &Path) -> Option<Heartbeat> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Whether the heartbeat at `path` exists, parses and is fresh for the
/// given write cadence. This is what `status` replies report.
pub fn healthy(path: &Path, interval: Duration) -> bool {
    read(path).map(|beat| !beat.is_stale(interval)).unwrap_or(false)
}

/// Remove the heartbeat file (daemon shutdown).
pub fn remove(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("Failed to remove heartbeat file: {e}");
        }
    }
}

/// Spawn the background writer. It refreshes the file every `interval`,
/// mirroring the daemon's activity from `status_rx`, until `shutdown` flips.
pub fn spawn_writer(
    path: PathBuf,
    interval: Duration,
    status_rx: watch::Receiver<HeartbeatStatus>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let status = *status_rx.borrow();
                    if let Err(e) = write(&path, status) {
                        log::warn!("Failed to write heartbeat: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        remove(&path);
    })
}
