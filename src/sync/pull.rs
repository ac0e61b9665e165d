//! Pull phase: apply remote state to the local cache.
//!
//! For each list the remote's tasks are diffed against the local cache using
//! per-task change tokens. Clean local tasks follow the remote; dirty ones
//! with a changed token go through the conflict resolver.

use anyhow::Result;
use log::{debug, info, warn};
use std::collections::HashSet;

use super::conflict::{self, Resolution};
use super::SyncService;
use crate::remote::{RemoteList, RemoteTask};
use crate::storage::{LocalTask, OpKind};

#[derive(Debug, Default, Clone, Copy)]
pub(super) struct PullStats {
    pub pulled: usize,
    pub removed: usize,
    pub conflicts: usize,
}

/// Pull one list: insert new remote tasks, refresh changed ones, resolve
/// conflicts, and drop tasks deleted on the remote. Commits the list-level
/// change token last.
pub(super) async fn pull_list(svc: &SyncService, list: &RemoteList) -> Result<PullStats> {
    let mut stats = PullStats::default();

    let remote_token = svc.remote.fetch_list_change_token(&list.list_id).await?;
    let stored_token = svc.storage.get_list_token(&list.list_id).await?;
    if let (Some(remote), Some(stored)) = (&remote_token, &stored_token) {
        if remote == stored {
            debug!("[{}] List '{}' unchanged, skipping fetch", svc.remote_id, list.name);
            return Ok(stats);
        }
    }

    let remote_tasks = svc.remote.fetch_tasks(&list.list_id).await?;
    debug!(
        "[{}] Pulled {} tasks from list '{}'",
        svc.remote_id,
        remote_tasks.len(),
        list.name
    );

    let mut seen: HashSet<&str> = HashSet::with_capacity(remote_tasks.len());
    // Parents may arrive after children, so parent links are fixed up in a
    // second pass once every task has a local row.
    let mut parent_fixups: Vec<(String, Option<String>)> = Vec::new();

    for remote_task in &remote_tasks {
        seen.insert(remote_task.remote_id.as_str());

        match svc.storage.get_task_by_remote_id(&remote_task.remote_id).await? {
            None => {
                let uuid = svc.storage.insert_remote_task(remote_task, None).await?;
                stats.pulled += 1;
                parent_fixups.push((uuid, remote_task.parent_remote_id.clone()));
            }
            Some(local) => {
                // A local delete is already queued; the push phase decides.
                if local.pending_delete {
                    continue;
                }
                // Token unchanged means nothing new on the remote side.
                if local.remote_token.as_deref() == Some(remote_task.change_token.as_str()) {
                    continue;
                }
                if local.dirty {
                    apply_conflict(svc, &local, remote_task).await?;
                    stats.conflicts += 1;
                } else {
                    svc.storage.overwrite_from_remote(&local.uuid, remote_task).await?;
                    stats.pulled += 1;
                }
                parent_fixups.push((local.uuid.clone(), remote_task.parent_remote_id.clone()));
            }
        }
    }

    for (uuid, parent_remote_id) in parent_fixups {
        let parent_uuid = match parent_remote_id {
            Some(rid) => svc.storage.get_task_by_remote_id(&rid).await?.map(|t| t.uuid),
            None => None,
        };
        svc.storage.set_parent_link(&uuid, parent_uuid.as_deref()).await?;
    }

    // Remote-side deletions: known tasks missing from the fetch. Dirty or
    // pending-delete tasks are left alone; the push phase settles them.
    for local in svc.storage.list_tasks(&list.list_id).await? {
        if let Some(rid) = &local.remote_id {
            if !seen.contains(rid.as_str()) && !local.dirty && !local.pending_delete {
                debug!("[{}] Task {} deleted on remote, removing locally", svc.remote_id, local.uuid);
                svc.storage.remove_local(&local.uuid).await?;
                stats.removed += 1;
            }
        }
    }

    svc.storage.set_list_token(&list.list_id, remote_token.as_deref()).await?;

    Ok(stats)
}

/// Route one dual-change conflict through the resolver and apply the
/// outcome. Also used by the push phase when the remote rejects a stale
/// token.
pub(super) async fn apply_conflict(svc: &SyncService, local: &LocalTask, remote: &RemoteTask) -> Result<()> {
    let resolution = conflict::resolve(
        svc.strategy,
        &local.fields,
        &remote.fields,
        local.synced_state.as_ref(),
    );

    info!(
        "[{}] Conflict on task {} ('{}'), strategy {:?}",
        svc.remote_id, local.uuid, local.fields.content, svc.strategy
    );

    match resolution {
        Resolution::TakeRemote => {
            svc.storage.overwrite_from_remote(&local.uuid, remote).await?;
        }
        Resolution::KeepLocal => {
            // Fields stay; advancing the token makes the next push pass the
            // optimistic-concurrency check. The task is already dirty, so
            // enqueue either coalesces or restores a missing entry.
            svc.storage.set_remote_token(&local.uuid, &remote.change_token).await?;
            svc.storage
                .enqueue(&local.uuid, OpKind::Update, Some(remote.remote_id.as_str()))
                .await?;
        }
        Resolution::Merged(fields) => {
            svc.storage
                .apply_resolved_fields(&local.uuid, &fields, &remote.change_token, &remote.fields)
                .await?;
        }
        Resolution::KeepBoth { duplicate } => {
            svc.storage.overwrite_from_remote(&local.uuid, remote).await?;
            let copy = svc
                .storage
                .create_task(&local.list_id, &duplicate, local.parent_uuid.as_deref())
                .await?;
            warn!(
                "[{}] Kept both versions of task {}; local copy is {}",
                svc.remote_id, local.uuid, copy.uuid
            );
        }
    }

    Ok(())
}
