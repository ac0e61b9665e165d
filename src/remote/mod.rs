//! Remote store abstraction layer for multi-backend support.
//!
//! This module defines the common interface that all remote task stores must
//! implement, along with common data types and error handling. The sync
//! engine is generic over [`RemoteStore`] and never branches on the concrete
//! backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod factory;

/// Error taxonomy for remote operations.
///
/// The sync engine distinguishes transient failures (retried with backoff),
/// conflicts (routed through the resolver) and permanent failures (surfaced
/// as terminal queue entries).
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Optimistic-concurrency rejection. Carries the remote's current
    /// version so the caller can route straight into conflict resolution
    /// without a second round trip.
    #[error("Change token conflict for remote task {remote_id}")]
    Conflict {
        remote_id: String,
        current: Box<RemoteTask>,
    },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Remote error: {0}")]
    Other(String),
}

impl RemoteError {
    /// Transient errors are retried with backoff; everything else is either
    /// a conflict or a permanent failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Network(_) | RemoteError::RateLimited { .. } | RemoteError::Other(_))
    }
}

/// The mutable fields of a task, shared between the local cache, the remote
/// representation and the conflict resolver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskFields {
    pub content: String,
    pub description: Option<String>,
    pub is_completed: bool,
    pub priority: i32,
    pub due_date: Option<String>,
    pub start_date: Option<String>,
    pub labels: Vec<String>,
}

impl TaskFields {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            description: None,
            is_completed: false,
            priority: 1,
            due_date: None,
            start_date: None,
            labels: Vec::new(),
        }
    }
}

/// Remote-side task representation with its change token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteTask {
    pub remote_id: String,
    pub list_id: String,
    pub parent_remote_id: Option<String>,
    /// Opaque version marker (e.g. an ETag); differs whenever the remote
    /// object changed.
    pub change_token: String,
    pub fields: TaskFields,
}

/// Remote-side task list / collection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteList {
    pub list_id: String,
    pub name: String,
}

/// RemoteStore trait that all task store backends must implement.
///
/// Implementations map these operations onto the concrete wire protocol
/// (CalDAV, REST task APIs, ...). The contract is deliberately narrow: fetch
/// and mutate tasks and lists, and report change tokens for optimistic
/// concurrency.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Returns the remote type identifier (e.g., "caldav", "todoist").
    fn remote_type(&self) -> &str;

    /// Fetch all task lists on this remote.
    async fn fetch_lists(&self) -> Result<Vec<RemoteList>, RemoteError>;

    /// Fetch the collection-level change token for one list. `None` means
    /// the backend does not support list-level tokens and a full fetch is
    /// always required.
    async fn fetch_list_change_token(&self, list_id: &str) -> Result<Option<String>, RemoteError>;

    /// Fetch all tasks in one list with their change tokens.
    async fn fetch_tasks(&self, list_id: &str) -> Result<Vec<RemoteTask>, RemoteError>;

    /// Create a task; returns the assigned remote identity and its token.
    async fn create_task(
        &self,
        list_id: &str,
        fields: &TaskFields,
        parent_remote_id: Option<&str>,
    ) -> Result<(String, String), RemoteError>;

    /// Update a task, supplying the last observed token for the
    /// optimistic-concurrency check. Returns the new token, or
    /// [`RemoteError::Conflict`] when the token is stale.
    async fn update_task(
        &self,
        remote_id: &str,
        fields: &TaskFields,
        parent_remote_id: Option<&str>,
        expected_token: &str,
    ) -> Result<String, RemoteError>;

    /// Delete a task by remote identity.
    async fn delete_task(&self, remote_id: &str) -> Result<(), RemoteError>;
}
