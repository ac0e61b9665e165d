//! Task rows and the local mutation handlers.
//!
//! The mutation handlers are the only writers of the `dirty` flag besides
//! the sync engine; each one flips the flag and the queue entry in the same
//! transaction.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use super::queue::{clear_for_task_on, enqueue_on, OpKind};
use super::LocalStorage;
use crate::remote::{RemoteTask, TaskFields};

/// Local task representation with sync metadata.
#[derive(Debug, Clone)]
pub struct LocalTask {
    pub uuid: String,
    pub remote_id: Option<String>,
    pub list_id: String,
    pub fields: TaskFields,
    pub parent_uuid: Option<String>,
    pub remote_token: Option<String>,
    pub dirty: bool,
    pub pending_delete: bool,
    pub last_synced_at: Option<String>,
    /// Snapshot of the fields at the last successful sync; the merge base
    /// for three-way conflict resolution.
    pub synced_state: Option<TaskFields>,
    pub created_at: String,
}

/// What a local delete did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Task was never pushed; it and its queue entry are gone without ever
    /// contacting the remote.
    RemovedLocally,
    /// Task is known to the remote; marked pending-delete and queued.
    QueuedForRemote,
}

fn row_to_task(row: &SqliteRow) -> Result<LocalTask> {
    let labels_json: String = row.get("labels");
    let labels: Vec<String> = serde_json::from_str(&labels_json).unwrap_or_default();

    let synced_state: Option<TaskFields> = row
        .get::<Option<String>, _>("synced_state")
        .and_then(|json| serde_json::from_str(&json).ok());

    Ok(LocalTask {
        uuid: row.get("uuid"),
        remote_id: row.get("remote_id"),
        list_id: row.get("list_id"),
        fields: TaskFields {
            content: row.get("content"),
            description: row.get("description"),
            is_completed: row.get("is_completed"),
            priority: row.get("priority"),
            due_date: row.get("due_date"),
            start_date: row.get("start_date"),
            labels,
        },
        parent_uuid: row.get("parent_uuid"),
        remote_token: row.get("remote_token"),
        dirty: row.get("dirty"),
        pending_delete: row.get("pending_delete"),
        last_synced_at: row.get("last_synced_at"),
        synced_state,
        created_at: row.get("created_at"),
    })
}

impl LocalStorage {
    /// Create a task locally and queue its push. The parent, when given,
    /// must already exist in the same list.
    pub async fn create_task(
        &self,
        list_id: &str,
        fields: &TaskFields,
        parent_uuid: Option<&str>,
    ) -> Result<LocalTask> {
        let uuid = Uuid::new_v4().to_string();
        let now = chrono::Utc::now();

        let mut tx = self.pool.begin().await?;

        if let Some(parent) = parent_uuid {
            let parent_list: Option<String> = sqlx::query_scalar("SELECT list_id FROM tasks WHERE uuid = ?")
                .bind(parent)
                .fetch_optional(&mut *tx)
                .await?;
            match parent_list {
                Some(ref list) if list == list_id => {}
                Some(_) => anyhow::bail!("Parent task {parent} belongs to a different list"),
                None => anyhow::bail!("Parent task not found: {parent}"),
            }
        }

        sqlx::query(
            r"
            INSERT INTO tasks (uuid, list_id, content, description, is_completed, priority,
                               due_date, start_date, labels, parent_uuid, dirty, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
            ",
        )
        .bind(&uuid)
        .bind(list_id)
        .bind(&fields.content)
        .bind(&fields.description)
        .bind(fields.is_completed)
        .bind(fields.priority)
        .bind(&fields.due_date)
        .bind(&fields.start_date)
        .bind(serde_json::to_string(&fields.labels)?)
        .bind(parent_uuid)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        enqueue_on(&mut tx, &uuid, OpKind::Create, None, now.timestamp_millis()).await?;

        tx.commit().await?;

        Ok(LocalTask {
            uuid,
            remote_id: None,
            list_id: list_id.to_string(),
            fields: fields.clone(),
            parent_uuid: parent_uuid.map(String::from),
            remote_token: None,
            dirty: true,
            pending_delete: false,
            last_synced_at: None,
            synced_state: None,
            created_at: now.to_rfc3339(),
        })
    }

    /// Apply a local edit: write the fields, mark dirty, queue an update.
    pub async fn update_task(&self, uuid: &str, fields: &TaskFields) -> Result<()> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let remote_id: Option<String> = sqlx::query_scalar("SELECT remote_id FROM tasks WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Task not found: {uuid}"))?;

        sqlx::query(
            r"
            UPDATE tasks
            SET content = ?, description = ?, is_completed = ?, priority = ?,
                due_date = ?, start_date = ?, labels = ?, dirty = 1
            WHERE uuid = ?
            ",
        )
        .bind(&fields.content)
        .bind(&fields.description)
        .bind(fields.is_completed)
        .bind(fields.priority)
        .bind(&fields.due_date)
        .bind(&fields.start_date)
        .bind(serde_json::to_string(&fields.labels)?)
        .bind(uuid)
        .execute(&mut *tx)
        .await?;

        enqueue_on(&mut tx, uuid, OpKind::Update, remote_id.as_deref(), now_ms).await?;

        tx.commit().await?;
        Ok(())
    }

    /// Re-parent a task. Rejects cross-list parents and cycles.
    pub async fn set_parent(&self, uuid: &str, parent_uuid: Option<&str>) -> Result<()> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let task = sqlx::query("SELECT * FROM tasks WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Task not found: {uuid}"))?;
        let task = row_to_task(&task)?;

        if let Some(parent) = parent_uuid {
            // Walk the ancestor chain to reject cycles
            let mut cursor = Some(parent.to_string());
            while let Some(current) = cursor {
                if current == uuid {
                    anyhow::bail!("Parent assignment would create a cycle at task {uuid}");
                }
                let row = sqlx::query("SELECT list_id, parent_uuid FROM tasks WHERE uuid = ?")
                    .bind(&current)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("Parent task not found: {current}"))?;
                let list_id: String = row.get("list_id");
                if current == parent && list_id != task.list_id {
                    anyhow::bail!("Parent task {parent} belongs to a different list");
                }
                cursor = row.get("parent_uuid");
            }
        }

        sqlx::query("UPDATE tasks SET parent_uuid = ?, dirty = 1 WHERE uuid = ?")
            .bind(parent_uuid)
            .bind(uuid)
            .execute(&mut *tx)
            .await?;

        enqueue_on(&mut tx, uuid, OpKind::Update, task.remote_id.as_deref(), now_ms).await?;

        tx.commit().await?;
        Ok(())
    }

    /// Delete a task. A never-pushed task is removed outright together with
    /// its queue entry; a pushed task is marked pending-delete and a delete
    /// is queued.
    pub async fn delete_task(&self, uuid: &str) -> Result<DeleteOutcome> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let remote_id: Option<String> = sqlx::query_scalar("SELECT remote_id FROM tasks WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Task not found: {uuid}"))?;

        match remote_id {
            None => {
                // The remote never saw this task; drop it and its queue
                // entry instead of queueing a delete.
                clear_for_task_on(&mut tx, uuid).await?;
                sqlx::query("DELETE FROM tasks WHERE uuid = ?")
                    .bind(uuid)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(DeleteOutcome::RemovedLocally)
            }
            Some(remote_id) => {
                sqlx::query("UPDATE tasks SET pending_delete = 1 WHERE uuid = ?")
                    .bind(uuid)
                    .execute(&mut *tx)
                    .await?;
                enqueue_on(&mut tx, uuid, OpKind::Delete, Some(&remote_id), now_ms).await?;
                tx.commit().await?;
                Ok(DeleteOutcome::QueuedForRemote)
            }
        }
    }

    /// Get a single task by UUID.
    pub async fn get_task(&self, uuid: &str) -> Result<Option<LocalTask>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    /// Get a single task by remote identity.
    pub async fn get_task_by_remote_id(&self, remote_id: &str) -> Result<Option<LocalTask>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE remote_id = ?")
            .bind(remote_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    /// All tasks in one list.
    pub async fn list_tasks(&self, list_id: &str) -> Result<Vec<LocalTask>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE list_id = ? ORDER BY created_at ASC")
            .bind(list_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_task).collect()
    }

    /// All tasks across lists.
    pub async fn all_tasks(&self) -> Result<Vec<LocalTask>> {
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_task).collect()
    }

    /// Insert a task first seen on the remote, clean and fully synced.
    pub async fn insert_remote_task(&self, remote: &RemoteTask, parent_uuid: Option<&str>) -> Result<String> {
        let uuid = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();

        sqlx::query(
            r"
            INSERT INTO tasks (uuid, remote_id, list_id, content, description, is_completed,
                               priority, due_date, start_date, labels, parent_uuid,
                               remote_token, dirty, pending_delete, last_synced_at,
                               synced_state, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, ?, ?, ?)
            ",
        )
        .bind(&uuid)
        .bind(&remote.remote_id)
        .bind(&remote.list_id)
        .bind(&remote.fields.content)
        .bind(&remote.fields.description)
        .bind(remote.fields.is_completed)
        .bind(remote.fields.priority)
        .bind(&remote.fields.due_date)
        .bind(&remote.fields.start_date)
        .bind(serde_json::to_string(&remote.fields.labels)?)
        .bind(parent_uuid)
        .bind(&remote.change_token)
        .bind(&now)
        .bind(serde_json::to_string(&remote.fields)?)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(uuid)
    }

    /// Replace a task's fields with the remote version, clearing the dirty
    /// flag and any pending queue entries.
    pub async fn overwrite_from_remote(&self, uuid: &str, remote: &RemoteTask) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            UPDATE tasks
            SET content = ?, description = ?, is_completed = ?, priority = ?,
                due_date = ?, start_date = ?, labels = ?,
                remote_token = ?, dirty = 0, last_synced_at = ?, synced_state = ?
            WHERE uuid = ?
            ",
        )
        .bind(&remote.fields.content)
        .bind(&remote.fields.description)
        .bind(remote.fields.is_completed)
        .bind(remote.fields.priority)
        .bind(&remote.fields.due_date)
        .bind(&remote.fields.start_date)
        .bind(serde_json::to_string(&remote.fields.labels)?)
        .bind(&remote.change_token)
        .bind(&now)
        .bind(serde_json::to_string(&remote.fields)?)
        .bind(uuid)
        .execute(&mut *tx)
        .await?;

        clear_for_task_on(&mut tx, uuid).await?;

        tx.commit().await?;
        Ok(())
    }

    /// Write locally-decided fields (merge outcome) while keeping the task
    /// dirty for push. The remote token and merge base advance to what the
    /// remote currently holds.
    pub async fn apply_resolved_fields(
        &self,
        uuid: &str,
        fields: &TaskFields,
        remote_token: &str,
        base: &TaskFields,
    ) -> Result<()> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let remote_id: Option<String> = sqlx::query_scalar("SELECT remote_id FROM tasks WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Task not found: {uuid}"))?;

        sqlx::query(
            r"
            UPDATE tasks
            SET content = ?, description = ?, is_completed = ?, priority = ?,
                due_date = ?, start_date = ?, labels = ?,
                remote_token = ?, dirty = 1, synced_state = ?
            WHERE uuid = ?
            ",
        )
        .bind(&fields.content)
        .bind(&fields.description)
        .bind(fields.is_completed)
        .bind(fields.priority)
        .bind(&fields.due_date)
        .bind(&fields.start_date)
        .bind(serde_json::to_string(&fields.labels)?)
        .bind(remote_token)
        .bind(serde_json::to_string(base)?)
        .bind(uuid)
        .execute(&mut *tx)
        .await?;

        enqueue_on(&mut tx, uuid, OpKind::Update, remote_id.as_deref(), now_ms).await?;

        tx.commit().await?;
        Ok(())
    }

    /// Advance only the remote token (local_wins keeps the fields and the
    /// pending push).
    pub async fn set_remote_token(&self, uuid: &str, token: &str) -> Result<()> {
        sqlx::query("UPDATE tasks SET remote_token = ? WHERE uuid = ?")
            .bind(token)
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Hard-remove a task deleted on the remote side, with any queue rows.
    pub async fn remove_local(&self, uuid: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM queue WHERE task_uuid = ?")
            .bind(uuid)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM tasks WHERE uuid = ?")
            .bind(uuid)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Commit a successful create push: record the assigned remote identity
    /// and token, clear dirty, refresh the merge base. The token write is
    /// the last action for the task in the cycle.
    pub async fn mark_pushed_create(&self, uuid: &str, remote_id: &str, token: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM tasks WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Task not found: {uuid}"))?;
        let task = row_to_task(&row)?;

        sqlx::query(
            r"
            UPDATE tasks
            SET remote_id = ?, dirty = 0, last_synced_at = ?, synced_state = ?, remote_token = ?
            WHERE uuid = ?
            ",
        )
        .bind(remote_id)
        .bind(&now)
        .bind(serde_json::to_string(&task.fields)?)
        .bind(token)
        .bind(uuid)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Commit a successful update push.
    pub async fn mark_pushed_update(&self, uuid: &str, token: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM tasks WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Task not found: {uuid}"))?;
        let task = row_to_task(&row)?;

        sqlx::query(
            r"
            UPDATE tasks
            SET dirty = 0, last_synced_at = ?, synced_state = ?, remote_token = ?
            WHERE uuid = ?
            ",
        )
        .bind(&now)
        .bind(serde_json::to_string(&task.fields)?)
        .bind(token)
        .bind(uuid)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Commit a confirmed remote delete: drop the local row.
    pub async fn finish_delete(&self, uuid: &str) -> Result<()> {
        sqlx::query("DELETE FROM tasks WHERE uuid = ?")
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fix up a parent link after pull (parents may arrive after children).
    pub async fn set_parent_link(&self, uuid: &str, parent_uuid: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE tasks SET parent_uuid = ? WHERE uuid = ?")
            .bind(parent_uuid)
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
