//! Push phase: drain the operation queue against the remote.
//!
//! Entries come pre-ordered from the queue (parents before children for
//! creates/updates, children before parents for deletes). Each entry runs
//! under the operation timeout; transient failures schedule a retry with
//! backoff and stop the drain, permanent failures go terminal, and stale
//! token rejections route into the conflict resolver.

use anyhow::Result;
use log::{debug, info, warn};

use super::{pull, SyncService};
use crate::remote::RemoteError;
use crate::storage::{OpKind, QueueEntry, QueueState};

#[derive(Debug, Default, Clone, Copy)]
pub(super) struct PushStats {
    pub pushed: usize,
    pub conflicts: usize,
    pub terminal: usize,
    pub retried: usize,
}

enum EntryOutcome {
    /// The remote confirmed the operation.
    Pushed,
    /// A stale token was resolved; the entry's disposition depends on the
    /// resolution (cleared, or left pending with an advanced token).
    Conflicted,
    /// Nothing to do (task gone, or a parent has no remote identity yet).
    Skipped,
}

enum PushFailure {
    /// Retried with backoff; also stops the drain since the remote is
    /// likely unreachable.
    Transient(String),
    /// Moves the entry to terminal failure.
    Permanent(String),
    /// Aborts the whole cycle; the entry stays pending untouched.
    Auth(String),
    Storage(anyhow::Error),
}

impl From<anyhow::Error> for PushFailure {
    fn from(e: anyhow::Error) -> Self {
        PushFailure::Storage(e)
    }
}

fn classify(e: RemoteError) -> PushFailure {
    match e {
        RemoteError::Auth(msg) => PushFailure::Auth(msg),
        RemoteError::NotFound(msg) | RemoteError::InvalidData(msg) => PushFailure::Permanent(msg),
        other if other.is_transient() => PushFailure::Transient(other.to_string()),
        other => PushFailure::Permanent(other.to_string()),
    }
}

/// Drain the eligible queue entries. Stops early on shutdown or when the
/// remote looks unreachable.
pub(super) async fn push_queue(svc: &SyncService) -> Result<PushStats> {
    let mut stats = PushStats::default();
    let batch = svc.storage.next_batch().await?;

    if batch.is_empty() {
        return Ok(stats);
    }
    debug!("[{}] Pushing {} queued operations", svc.remote_id, batch.len());

    for entry in batch {
        if *svc.shutdown.borrow() {
            info!("[{}] Shutdown requested, stopping push", svc.remote_id);
            break;
        }

        let attempt = tokio::time::timeout(svc.op_timeout, push_entry(svc, &entry)).await;

        match attempt {
            Err(_) => {
                warn!(
                    "[{}] Operation timed out for task {} ({})",
                    svc.remote_id,
                    entry.task_uuid,
                    entry.kind.as_str()
                );
                match svc.storage.mark_failed(&entry, "operation timed out", &svc.queue_config).await? {
                    QueueState::Failed => stats.terminal += 1,
                    QueueState::Pending => stats.retried += 1,
                }
            }
            Ok(Ok(EntryOutcome::Pushed)) => stats.pushed += 1,
            Ok(Ok(EntryOutcome::Conflicted)) => stats.conflicts += 1,
            Ok(Ok(EntryOutcome::Skipped)) => {}
            Ok(Err(PushFailure::Transient(msg))) => {
                warn!(
                    "[{}] Push failed for task {} ({}): {msg}",
                    svc.remote_id,
                    entry.task_uuid,
                    entry.kind.as_str()
                );
                match svc.storage.mark_failed(&entry, &msg, &svc.queue_config).await? {
                    QueueState::Failed => stats.terminal += 1,
                    QueueState::Pending => stats.retried += 1,
                }
                // The remote is unreachable; retrying the rest of the batch
                // now would only burn their retry budgets.
                break;
            }
            Ok(Err(PushFailure::Permanent(msg))) => {
                warn!(
                    "[{}] Permanent failure for task {} ({}): {msg}",
                    svc.remote_id,
                    entry.task_uuid,
                    entry.kind.as_str()
                );
                svc.storage.mark_terminal(&entry, &msg).await?;
                stats.terminal += 1;
            }
            Ok(Err(PushFailure::Auth(msg))) => {
                anyhow::bail!("Authentication failed during push: {msg}");
            }
            Ok(Err(PushFailure::Storage(e))) => return Err(e),
        }
    }

    Ok(stats)
}

/// Where a task's parent stands on the remote.
enum ParentRef {
    /// Root task, or the parent row vanished; push without a parent.
    Root,
    Remote(String),
    /// The parent's own push is still queued; the child must wait.
    Pending,
    /// The parent's push failed terminally, so the child can never land.
    /// Without this the child would be deferred on every cycle, keeping
    /// the queue depth nonzero and the daemon alive forever.
    Failed,
}

async fn parent_ref(svc: &SyncService, parent_uuid: Option<&str>) -> Result<ParentRef> {
    let Some(parent_uuid) = parent_uuid else {
        return Ok(ParentRef::Root);
    };
    match svc.storage.get_task(parent_uuid).await? {
        Some(parent) => match parent.remote_id {
            Some(rid) => Ok(ParentRef::Remote(rid)),
            // No remote identity and no pending entry means the parent's
            // create went terminal.
            None => {
                if svc.storage.pending_entry_for_task(parent_uuid).await?.is_some() {
                    Ok(ParentRef::Pending)
                } else {
                    Ok(ParentRef::Failed)
                }
            }
        },
        // Parent row vanished; push as a root task.
        None => Ok(ParentRef::Root),
    }
}

async fn push_entry(svc: &SyncService, entry: &QueueEntry) -> Result<EntryOutcome, PushFailure> {
    let task = svc.storage.get_task(&entry.task_uuid).await?;

    match entry.kind {
        OpKind::Create => {
            let Some(task) = task else {
                svc.storage.complete_entry(entry.id).await?;
                return Ok(EntryOutcome::Skipped);
            };

            let parent = match parent_ref(svc, task.parent_uuid.as_deref()).await? {
                ParentRef::Root => None,
                ParentRef::Remote(rid) => Some(rid),
                ParentRef::Pending => {
                    debug!(
                        "[{}] Deferring create for task {}: parent not pushed yet",
                        svc.remote_id, task.uuid
                    );
                    return Ok(EntryOutcome::Skipped);
                }
                ParentRef::Failed => {
                    return Err(PushFailure::Permanent(format!(
                        "parent of task {} permanently failed to push",
                        task.uuid
                    )));
                }
            };

            let (remote_id, token) = svc
                .remote
                .create_task(&task.list_id, &task.fields, parent.as_deref())
                .await
                .map_err(classify)?;

            svc.storage.mark_pushed_create(&task.uuid, &remote_id, &token).await?;
            svc.storage.complete_entry(entry.id).await?;
            Ok(EntryOutcome::Pushed)
        }
        OpKind::Update => {
            let Some(task) = task else {
                svc.storage.complete_entry(entry.id).await?;
                return Ok(EntryOutcome::Skipped);
            };
            let Some(remote_id) = task.remote_id.clone() else {
                // The pending create covers the current fields.
                svc.storage.complete_entry(entry.id).await?;
                return Ok(EntryOutcome::Skipped);
            };

            let parent = match parent_ref(svc, task.parent_uuid.as_deref()).await? {
                ParentRef::Root => None,
                ParentRef::Remote(rid) => Some(rid),
                ParentRef::Pending => {
                    debug!(
                        "[{}] Deferring update for task {}: parent not pushed yet",
                        svc.remote_id, task.uuid
                    );
                    return Ok(EntryOutcome::Skipped);
                }
                ParentRef::Failed => {
                    return Err(PushFailure::Permanent(format!(
                        "parent of task {} permanently failed to push",
                        task.uuid
                    )));
                }
            };

            let expected = task.remote_token.clone().unwrap_or_default();
            match svc
                .remote
                .update_task(&remote_id, &task.fields, parent.as_deref(), &expected)
                .await
            {
                Ok(token) => {
                    svc.storage.mark_pushed_update(&task.uuid, &token).await?;
                    svc.storage.complete_entry(entry.id).await?;
                    Ok(EntryOutcome::Pushed)
                }
                Err(RemoteError::Conflict { current, .. }) => {
                    // The remote moved underneath us since the pull.
                    pull::apply_conflict(svc, &task, &current).await?;
                    Ok(EntryOutcome::Conflicted)
                }
                Err(e) => Err(classify(e)),
            }
        }
        OpKind::Delete => {
            let Some(task) = task else {
                svc.storage.complete_entry(entry.id).await?;
                return Ok(EntryOutcome::Skipped);
            };

            let remote_id = entry.remote_id.clone().or_else(|| task.remote_id.clone());
            let Some(remote_id) = remote_id else {
                // Never reached the remote; nothing to delete there.
                svc.storage.finish_delete(&task.uuid).await?;
                svc.storage.complete_entry(entry.id).await?;
                return Ok(EntryOutcome::Pushed);
            };

            match svc.remote.delete_task(&remote_id).await {
                // Already gone on the remote counts as success.
                Ok(()) | Err(RemoteError::NotFound(_)) => {
                    svc.storage.finish_delete(&task.uuid).await?;
                    svc.storage.complete_entry(entry.id).await?;
                    Ok(EntryOutcome::Pushed)
                }
                Err(e) => Err(classify(e)),
            }
        }
    }
}
