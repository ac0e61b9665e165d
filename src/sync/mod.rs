//! Synchronization engine.
//!
//! This module provides the [`SyncService`] struct which runs one
//! bidirectional sync cycle for one remote: pull remote changes, diff them
//! against local sync metadata, resolve conflicts where both sides changed,
//! then drain the operation queue against the remote in hierarchical order.
//!
//! A cycle never partially commits a single task's change token; the token
//! write is the last action for that task. Failures abort the remaining
//! steps for this remote only and already-applied pull results are kept.

pub mod conflict;
mod pull;
mod push;

use anyhow::Result;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

use crate::config::QueueConfig;
use crate::remote::RemoteStore;
use crate::storage::LocalStorage;
use conflict::ConflictStrategy;

/// Represents the current status of a synchronization cycle.
#[derive(Debug, Clone)]
pub enum SyncStatus {
    /// No cycle has run yet
    Idle,
    /// A sync cycle is currently in progress
    InProgress,
    /// The last cycle completed
    Success { report: SyncReport },
    /// The last cycle failed
    Error {
        /// Human-readable error message describing what went wrong
        message: String,
    },
}

/// Counters from one completed cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncReport {
    /// Tasks inserted or overwritten from the remote
    pub pulled: usize,
    /// Local tasks removed because the remote deleted them
    pub removed: usize,
    /// Queue entries confirmed by the remote
    pub pushed: usize,
    /// Conflicts routed through the resolver
    pub conflicts: usize,
    /// Entries moved to terminal failure this cycle
    pub terminal_failures: usize,
}

/// Service that runs sync cycles for a single remote.
///
/// One instance exists per configured remote; the daemon never runs two
/// concurrent cycles for the same remote, while different remotes may sync
/// concurrently. The in-progress guard makes a second `sync()` call return
/// [`SyncStatus::InProgress`] instead of overlapping.
#[derive(Clone)]
pub struct SyncService {
    remote_id: String,
    remote: Arc<dyn RemoteStore>,
    storage: LocalStorage,
    strategy: ConflictStrategy,
    queue_config: QueueConfig,
    op_timeout: Duration,
    sync_in_progress: Arc<Mutex<bool>>,
    shutdown: watch::Receiver<bool>,
}

impl SyncService {
    /// Creates a new `SyncService` for one remote.
    ///
    /// `shutdown` lets the daemon interrupt a push between task-level
    /// operations; pass the receiving side of a `watch` channel that flips
    /// to `true` on shutdown.
    pub fn new(
        remote_id: impl Into<String>,
        remote: Arc<dyn RemoteStore>,
        storage: LocalStorage,
        strategy: ConflictStrategy,
        queue_config: QueueConfig,
        op_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            remote_id: remote_id.into(),
            remote,
            storage,
            strategy,
            queue_config,
            op_timeout,
            sync_in_progress: Arc::new(Mutex::new(false)),
            shutdown,
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn storage(&self) -> &LocalStorage {
        &self.storage
    }

    /// Checks if a synchronization cycle is currently in progress.
    pub async fn is_syncing(&self) -> bool {
        *self.sync_in_progress.lock().await
    }

    /// Run one full sync cycle: pull, diff/resolve, push, commit.
    ///
    /// Returns `SyncStatus::InProgress` without doing anything if a cycle
    /// is already running for this remote.
    pub async fn sync(&self) -> Result<SyncStatus> {
        // Check if sync is already in progress and acquire the guard
        let mut sync_guard = self.sync_in_progress.lock().await;
        if *sync_guard {
            return Ok(SyncStatus::InProgress);
        }
        *sync_guard = true;

        // Release the lock before performing sync to avoid holding it during the long operation
        drop(sync_guard);

        let result = self.perform_sync().await;

        // Release sync guard
        {
            let mut sync_guard = self.sync_in_progress.lock().await;
            *sync_guard = false;
        }

        result
    }

    /// Internal sync implementation
    async fn perform_sync(&self) -> Result<SyncStatus> {
        info!("🔄 [{}] Starting sync cycle...", self.remote_id);

        match self.pull_and_push().await {
            Ok(report) => {
                info!(
                    "✅ [{}] Cycle complete: {} pulled, {} removed, {} pushed, {} conflicts, {} terminal failures",
                    self.remote_id,
                    report.pulled,
                    report.removed,
                    report.pushed,
                    report.conflicts,
                    report.terminal_failures
                );
                Ok(SyncStatus::Success { report })
            }
            Err(e) => {
                error!("❌ [{}] Sync cycle failed: {e}", self.remote_id);
                Ok(SyncStatus::Error { message: e.to_string() })
            }
        }
    }

    async fn pull_and_push(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        let lists = self
            .remote
            .fetch_lists()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to fetch lists: {e}"))?;

        for list in &lists {
            let stats = pull::pull_list(self, list).await?;
            report.pulled += stats.pulled;
            report.removed += stats.removed;
            report.conflicts += stats.conflicts;
        }

        let stats = push::push_queue(self).await?;
        report.pushed += stats.pushed;
        report.conflicts += stats.conflicts;
        report.terminal_failures += stats.terminal;

        Ok(report)
    }
}
