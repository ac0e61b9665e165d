//! Local storage layer.
//!
//! One SQLite database per configured remote, holding the task cache with
//! its per-task sync metadata, the per-list change tokens and the durable
//! operation queue. All mutation handlers write the task row and the queue
//! entry in a single transaction so the `dirty` flag and the queue can never
//! disagree.

pub mod queue;
pub mod task;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;

pub use queue::{EnqueueOutcome, OpKind, QueueDepth, QueueEntry, QueueState};
pub use task::{DeleteOutcome, LocalTask};

/// Local storage manager for one remote's cached data.
#[derive(Clone)]
pub struct LocalStorage {
    pub(crate) pool: SqlitePool,
}

impl LocalStorage {
    /// Open (or create) the database file for one remote.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .connect_with(options)
            .await?;

        let storage = LocalStorage { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Initialize database schema
    async fn init_schema(&self) -> Result<()> {
        // Create tasks table with inline sync metadata
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS tasks (
                uuid TEXT PRIMARY KEY,
                remote_id TEXT UNIQUE,
                list_id TEXT NOT NULL,
                content TEXT NOT NULL,
                description TEXT,
                is_completed BOOLEAN NOT NULL DEFAULT 0,
                priority INTEGER NOT NULL DEFAULT 1,
                due_date TEXT,
                start_date TEXT,
                labels TEXT NOT NULL DEFAULT '[]',
                parent_uuid TEXT,
                remote_token TEXT,
                dirty BOOLEAN NOT NULL DEFAULT 0,
                pending_delete BOOLEAN NOT NULL DEFAULT 0,
                last_synced_at TEXT,
                synced_state TEXT,
                created_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        // Create list-level sync metadata table
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS list_sync (
                list_id TEXT PRIMARY KEY,
                change_token TEXT,
                last_synced_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        // Create operation queue table
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_uuid TEXT NOT NULL,
                kind TEXT NOT NULL,
                remote_id TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER,
                last_attempt_at INTEGER,
                last_error TEXT,
                state TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_queue_task ON queue(task_uuid)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_queue_state ON queue(state)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_list ON tasks(list_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Get the stored change token for a list.
    pub async fn get_list_token(&self, list_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT change_token FROM list_sync WHERE list_id = ?")
            .bind(list_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.and_then(|row| row.get::<Option<String>, _>("change_token")))
    }

    /// Persist the change token for a list.
    pub async fn set_list_token(&self, list_id: &str, token: Option<&str>) -> Result<()> {
        sqlx::query(
            r"
            INSERT OR REPLACE INTO list_sync (list_id, change_token, last_synced_at)
            VALUES (?, ?, ?)
            ",
        )
        .bind(list_id)
        .bind(token)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Last successful sync time for a list, if any.
    pub async fn get_list_last_synced(&self, list_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT last_synced_at FROM list_sync WHERE list_id = ?")
            .bind(list_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row.get("last_synced_at")))
    }
}
