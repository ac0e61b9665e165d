//! Durable operation queue.
//!
//! Every local mutation that must reach the remote becomes a queue entry.
//! Entries survive daemon crashes (they live in the same SQLite database as
//! the task cache), are coalesced on enqueue, drained in hierarchical order,
//! and retried with jittered exponential backoff up to a retry ceiling.

use anyhow::Result;
use rand::Rng;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::collections::HashMap;

use super::LocalStorage;
use crate::config::QueueConfig;
use crate::constants::QUEUE_BACKOFF_JITTER;

/// Kind of pending mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Create => "create",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(OpKind::Create),
            "update" => Some(OpKind::Update),
            "delete" => Some(OpKind::Delete),
            _ => None,
        }
    }
}

/// Queue entry lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Waiting to be pushed (possibly backing off after failures).
    Pending,
    /// Terminal failure; kept for operator visibility, never retried.
    Failed,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Pending => "pending",
            QueueState::Failed => "failed",
        }
    }
}

/// One pending mutation against the remote.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: i64,
    pub task_uuid: String,
    pub kind: OpKind,
    pub remote_id: Option<String>,
    pub retry_count: i64,
    pub next_attempt_at: Option<i64>,
    pub last_attempt_at: Option<i64>,
    pub last_error: Option<String>,
    pub state: QueueState,
    pub created_at: i64,
}

/// Result of an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new entry was appended.
    Queued,
    /// An existing entry for the same task absorbed this mutation.
    Coalesced,
}

/// Pending and terminally-failed entry counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueDepth {
    pub pending: i64,
    pub failed: i64,
}

/// Exponential backoff delay for a retry count: `min(max, base * 2^retries)`.
pub fn backoff_delay_ms(retry_count: u32, base_ms: u64, max_ms: u64) -> u64 {
    let shift = retry_count.min(20);
    base_ms.saturating_mul(1u64 << shift).min(max_ms)
}

/// Apply ±20% random jitter so recovering remotes don't see a retry storm.
fn jittered(delay_ms: u64) -> u64 {
    let factor = rand::thread_rng().gen_range(-QUEUE_BACKOFF_JITTER..=QUEUE_BACKOFF_JITTER);
    let adjusted = delay_ms as f64 * (1.0 + factor);
    adjusted.max(0.0) as u64
}

/// Compute each task's depth in the parent tree (roots are depth 0).
/// Cycles are tolerated by capping the walk; the storage layer rejects them
/// on write, so a cap only guards against corrupted data.
pub(crate) fn parent_depths(links: &[(String, Option<String>)]) -> HashMap<String, u32> {
    let parent_of: HashMap<&str, Option<&str>> = links
        .iter()
        .map(|(uuid, parent)| (uuid.as_str(), parent.as_deref()))
        .collect();

    let mut depths = HashMap::new();
    for (uuid, _) in links {
        let mut depth = 0u32;
        let mut cursor = uuid.as_str();
        while let Some(Some(parent)) = parent_of.get(cursor) {
            depth += 1;
            cursor = parent;
            if depth as usize > links.len() {
                break;
            }
        }
        depths.insert(uuid.clone(), depth);
    }
    depths
}

/// Order a batch for pushing: creates/updates parents-first, then deletes
/// children-first, so the remote never sees a child referencing a missing
/// parent or a parent deleted out from under its children.
pub(crate) fn order_batch(entries: Vec<QueueEntry>, depths: &HashMap<String, u32>) -> Vec<QueueEntry> {
    let depth = |entry: &QueueEntry| depths.get(&entry.task_uuid).copied().unwrap_or(0);

    let (deletes, mut upserts): (Vec<QueueEntry>, Vec<QueueEntry>) =
        entries.into_iter().partition(|e| e.kind == OpKind::Delete);

    upserts.sort_by(|a, b| depth(a).cmp(&depth(b)).then(a.id.cmp(&b.id)));

    let mut deletes = deletes;
    deletes.sort_by(|a, b| depth(b).cmp(&depth(a)).then(a.id.cmp(&b.id)));

    upserts.extend(deletes);
    upserts
}

fn row_to_entry(row: &SqliteRow) -> Result<QueueEntry> {
    let kind_str: String = row.get("kind");
    let state_str: String = row.get("state");
    Ok(QueueEntry {
        id: row.get("id"),
        task_uuid: row.get("task_uuid"),
        kind: OpKind::parse(&kind_str)
            .ok_or_else(|| anyhow::anyhow!("Unknown queue entry kind: {kind_str}"))?,
        remote_id: row.get("remote_id"),
        retry_count: row.get("retry_count"),
        next_attempt_at: row.get("next_attempt_at"),
        last_attempt_at: row.get("last_attempt_at"),
        last_error: row.get("last_error"),
        state: match state_str.as_str() {
            "pending" => QueueState::Pending,
            "failed" => QueueState::Failed,
            other => anyhow::bail!("Unknown queue entry state: {other}"),
        },
        created_at: row.get("created_at"),
    })
}

/// Append or coalesce a queue entry on an open connection. Called from the
/// mutation handlers inside the same transaction that flips `dirty`.
pub(crate) async fn enqueue_on(
    conn: &mut SqliteConnection,
    task_uuid: &str,
    kind: OpKind,
    remote_id: Option<&str>,
    now_ms: i64,
) -> Result<EnqueueOutcome> {
    let existing = sqlx::query("SELECT * FROM queue WHERE task_uuid = ? AND state = 'pending' LIMIT 1")
        .bind(task_uuid)
        .fetch_optional(&mut *conn)
        .await?;

    if let Some(row) = existing {
        let entry = row_to_entry(&row)?;
        match (entry.kind, kind) {
            // Two consecutive updates collapse; an update behind a pending
            // create is covered by the create, which pushes current fields.
            (OpKind::Create, OpKind::Update) | (OpKind::Update, OpKind::Update) => {
                return Ok(EnqueueOutcome::Coalesced);
            }
            // An update superseded by a delete becomes the delete.
            (OpKind::Update, OpKind::Delete) => {
                sqlx::query("UPDATE queue SET kind = 'delete', remote_id = ? WHERE id = ?")
                    .bind(remote_id)
                    .bind(entry.id)
                    .execute(&mut *conn)
                    .await?;
                return Ok(EnqueueOutcome::Coalesced);
            }
            // A delete behind an unpushed create cancels both. When the
            // create already reached the remote (identity assigned, entry
            // not yet completed) the delete must still go out, so fall
            // through and append it.
            (OpKind::Create, OpKind::Delete) => {
                sqlx::query("DELETE FROM queue WHERE id = ?")
                    .bind(entry.id)
                    .execute(&mut *conn)
                    .await?;
                if remote_id.is_none() {
                    return Ok(EnqueueOutcome::Coalesced);
                }
            }
            // A pending delete supersedes anything else for the task;
            // duplicate creates cannot happen but fold away regardless.
            _ => return Ok(EnqueueOutcome::Coalesced),
        }
    }

    sqlx::query(
        r"
        INSERT INTO queue (task_uuid, kind, remote_id, created_at)
        VALUES (?, ?, ?, ?)
        ",
    )
    .bind(task_uuid)
    .bind(kind.as_str())
    .bind(remote_id)
    .bind(now_ms)
    .execute(&mut *conn)
    .await?;

    Ok(EnqueueOutcome::Queued)
}

/// Drop all pending entries for one task (used when the resolver discards
/// the local version).
pub(crate) async fn clear_for_task_on(conn: &mut SqliteConnection, task_uuid: &str) -> Result<()> {
    sqlx::query("DELETE FROM queue WHERE task_uuid = ? AND state = 'pending'")
        .bind(task_uuid)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

impl LocalStorage {
    /// Append a queue entry, coalescing with any pending entry for the task.
    pub async fn enqueue(&self, task_uuid: &str, kind: OpKind, remote_id: Option<&str>) -> Result<EnqueueOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = enqueue_on(&mut tx, task_uuid, kind, remote_id, chrono::Utc::now().timestamp_millis()).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Pending entries eligible for push right now, in hierarchical order.
    pub async fn next_batch(&self) -> Result<Vec<QueueEntry>> {
        let now_ms = chrono::Utc::now().timestamp_millis();

        let rows = sqlx::query(
            r"
            SELECT * FROM queue
            WHERE state = 'pending' AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
            ORDER BY id ASC
            ",
        )
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            entries.push(row_to_entry(row)?);
        }

        let links: Vec<(String, Option<String>)> = sqlx::query("SELECT uuid, parent_uuid FROM tasks")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| (row.get("uuid"), row.get("parent_uuid")))
            .collect();

        Ok(order_batch(entries, &parent_depths(&links)))
    }

    /// Remove a confirmed-successful entry.
    pub async fn complete_entry(&self, entry_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM queue WHERE id = ?")
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a transient failure: bump the retry count, schedule the next
    /// attempt with jittered backoff, or move the entry to terminal failure
    /// once the ceiling is exceeded. Returns the entry's new state.
    pub async fn mark_failed(&self, entry: &QueueEntry, error: &str, config: &QueueConfig) -> Result<QueueState> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let retries = entry.retry_count + 1;

        if retries > i64::from(config.retry_ceiling) {
            sqlx::query(
                "UPDATE queue SET state = 'failed', retry_count = ?, last_attempt_at = ?, last_error = ? WHERE id = ?",
            )
            .bind(retries)
            .bind(now_ms)
            .bind(error)
            .bind(entry.id)
            .execute(&self.pool)
            .await?;
            return Ok(QueueState::Failed);
        }

        let delay = jittered(backoff_delay_ms(retries as u32, config.backoff_base_ms, config.backoff_max_ms));
        sqlx::query(
            r"
            UPDATE queue
            SET retry_count = ?, last_attempt_at = ?, next_attempt_at = ?, last_error = ?
            WHERE id = ?
            ",
        )
        .bind(retries)
        .bind(now_ms)
        .bind(now_ms + delay as i64)
        .bind(error)
        .bind(entry.id)
        .execute(&self.pool)
        .await?;

        Ok(QueueState::Pending)
    }

    /// Move an entry straight to terminal failure (permanent errors).
    pub async fn mark_terminal(&self, entry: &QueueEntry, error: &str) -> Result<()> {
        sqlx::query("UPDATE queue SET state = 'failed', last_attempt_at = ?, last_error = ? WHERE id = ?")
            .bind(chrono::Utc::now().timestamp_millis())
            .bind(error)
            .bind(entry.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The pending entry for one task, if any.
    pub async fn pending_entry_for_task(&self, task_uuid: &str) -> Result<Option<QueueEntry>> {
        let row = sqlx::query("SELECT * FROM queue WHERE task_uuid = ? AND state = 'pending' LIMIT 1")
            .bind(task_uuid)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_entry).transpose()
    }

    /// Drop all pending entries for one task.
    pub async fn clear_queue_for_task(&self, task_uuid: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        clear_for_task_on(&mut tx, task_uuid).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Pending / terminally-failed entry counts.
    pub async fn queue_depth(&self) -> Result<QueueDepth> {
        let pending: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue WHERE state = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        let failed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue WHERE state = 'failed'")
            .fetch_one(&self.pool)
            .await?;
        Ok(QueueDepth { pending, failed })
    }

    /// All entries, for status inspection and tests.
    pub async fn all_entries(&self) -> Result<Vec<QueueEntry>> {
        let rows = sqlx::query("SELECT * FROM queue ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64, task_uuid: &str, kind: OpKind) -> QueueEntry {
        QueueEntry {
            id,
            task_uuid: task_uuid.to_string(),
            kind,
            remote_id: None,
            retry_count: 0,
            next_attempt_at: None,
            last_attempt_at: None,
            last_error: None,
            state: QueueState::Pending,
            created_at: 0,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay_ms(0, 1_000, 300_000), 1_000);
        assert_eq!(backoff_delay_ms(1, 1_000, 300_000), 2_000);
        assert_eq!(backoff_delay_ms(5, 1_000, 300_000), 32_000);
        assert_eq!(backoff_delay_ms(12, 1_000, 300_000), 300_000);
        // Large retry counts must not overflow
        assert_eq!(backoff_delay_ms(200, 1_000, 300_000), 300_000);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..100 {
            let delay = jittered(10_000);
            assert!((8_000..=12_000).contains(&delay), "delay {delay} out of bounds");
        }
    }

    #[test]
    fn depths_follow_parent_chain() {
        let links = vec![
            ("a".to_string(), None),
            ("b".to_string(), Some("a".to_string())),
            ("c".to_string(), Some("b".to_string())),
        ];
        let depths = parent_depths(&links);
        assert_eq!(depths["a"], 0);
        assert_eq!(depths["b"], 1);
        assert_eq!(depths["c"], 2);
    }

    #[test]
    fn creates_go_parents_first_and_deletes_children_first() {
        let links = vec![
            ("parent".to_string(), None),
            ("child1".to_string(), Some("parent".to_string())),
            ("child2".to_string(), Some("parent".to_string())),
        ];
        let depths = parent_depths(&links);

        // Children enqueued before the parent, plus a delete for the parent
        let batch = vec![
            entry(1, "child1", OpKind::Create),
            entry(2, "child2", OpKind::Create),
            entry(3, "parent", OpKind::Create),
        ];
        let ordered = order_batch(batch, &depths);
        assert_eq!(ordered[0].task_uuid, "parent");
        assert_eq!(ordered[1].task_uuid, "child1");
        assert_eq!(ordered[2].task_uuid, "child2");

        let batch = vec![
            entry(1, "parent", OpKind::Delete),
            entry(2, "child1", OpKind::Delete),
            entry(3, "child2", OpKind::Delete),
        ];
        let ordered = order_batch(batch, &depths);
        assert_eq!(ordered[2].task_uuid, "parent");
    }

    #[test]
    fn deletes_come_after_upserts() {
        let links = vec![("a".to_string(), None), ("b".to_string(), None)];
        let depths = parent_depths(&links);

        let batch = vec![entry(1, "a", OpKind::Delete), entry(2, "b", OpKind::Update)];
        let ordered = order_batch(batch, &depths);
        assert_eq!(ordered[0].kind, OpKind::Update);
        assert_eq!(ordered[1].kind, OpKind::Delete);
    }
}
