//! Integration tests for the durable operation queue: batch eligibility,
//! retry scheduling and the terminal-failure ceiling.

use tasknest::config::QueueConfig;
use tasknest::remote::TaskFields;
use tasknest::storage::{LocalStorage, OpKind, QueueState};
use tempfile::TempDir;

async fn open_storage() -> (TempDir, LocalStorage) {
    let dir = TempDir::new().expect("tempdir");
    let storage = LocalStorage::open(dir.path().join("test.db")).await.expect("open db");
    (dir, storage)
}

fn fast_queue_config() -> QueueConfig {
    QueueConfig {
        retry_ceiling: 2,
        backoff_base_ms: 60_000,
        backoff_max_ms: 300_000,
    }
}

#[tokio::test]
async fn next_batch_orders_parents_before_children() {
    let (_dir, storage) = open_storage().await;

    let parent = storage.create_task("inbox", &TaskFields::new("parent"), None).await.unwrap();
    let child = storage
        .create_task("inbox", &TaskFields::new("child"), Some(&parent.uuid))
        .await
        .unwrap();
    let grandchild = storage
        .create_task("inbox", &TaskFields::new("grandchild"), Some(&child.uuid))
        .await
        .unwrap();

    let batch = storage.next_batch().await.unwrap();
    let order: Vec<String> = batch.iter().map(|e| e.task_uuid.clone()).collect();
    assert_eq!(order, vec![parent.uuid.clone(), child.uuid.clone(), grandchild.uuid.clone()]);
}

#[tokio::test]
async fn backed_off_entries_are_not_eligible() {
    let (_dir, storage) = open_storage().await;

    let task = storage.create_task("inbox", &TaskFields::new("flaky"), None).await.unwrap();
    let entry = storage.pending_entry_for_task(&task.uuid).await.unwrap().unwrap();

    // First failure schedules the next attempt at least a minute out
    let state = storage
        .mark_failed(&entry, "connection refused", &fast_queue_config())
        .await
        .unwrap();
    assert_eq!(state, QueueState::Pending);

    assert!(storage.next_batch().await.unwrap().is_empty());

    let entry = storage.pending_entry_for_task(&task.uuid).await.unwrap().unwrap();
    assert_eq!(entry.retry_count, 1);
    assert_eq!(entry.last_error.as_deref(), Some("connection refused"));
    assert!(entry.next_attempt_at.unwrap() > chrono::Utc::now().timestamp_millis());
}

#[tokio::test]
async fn retries_past_the_ceiling_go_terminal() {
    let (_dir, storage) = open_storage().await;
    let config = fast_queue_config();

    let task = storage.create_task("inbox", &TaskFields::new("doomed"), None).await.unwrap();
    let mut entry = storage.pending_entry_for_task(&task.uuid).await.unwrap().unwrap();

    for attempt in 1..=config.retry_ceiling {
        let state = storage.mark_failed(&entry, "connection refused", &config).await.unwrap();
        assert_eq!(state, QueueState::Pending, "attempt {attempt} should still be retryable");
        entry = storage.pending_entry_for_task(&task.uuid).await.unwrap().unwrap();
    }

    let state = storage.mark_failed(&entry, "connection refused", &config).await.unwrap();
    assert_eq!(state, QueueState::Failed);

    // Terminal entries are kept for visibility but never eligible again
    assert!(storage.pending_entry_for_task(&task.uuid).await.unwrap().is_none());
    assert!(storage.next_batch().await.unwrap().is_empty());

    let depth = storage.queue_depth().await.unwrap();
    assert_eq!(depth.pending, 0);
    assert_eq!(depth.failed, 1);
}

#[tokio::test]
async fn completing_an_entry_removes_it() {
    let (_dir, storage) = open_storage().await;

    let task = storage.create_task("inbox", &TaskFields::new("done"), None).await.unwrap();
    let entry = storage.pending_entry_for_task(&task.uuid).await.unwrap().unwrap();

    storage.complete_entry(entry.id).await.unwrap();
    assert!(storage.all_entries().await.unwrap().is_empty());
}

#[tokio::test]
async fn enqueue_delete_cancels_unpushed_create() {
    let (_dir, storage) = open_storage().await;

    let task = storage.create_task("inbox", &TaskFields::new("draft"), None).await.unwrap();
    storage.enqueue(&task.uuid, OpKind::Delete, None).await.unwrap();

    // The create never reached the remote, so the pair removes both entries
    assert!(storage.all_entries().await.unwrap().is_empty());
}

#[tokio::test]
async fn enqueue_delete_behind_a_pushed_create_still_queues_the_delete() {
    let (_dir, storage) = open_storage().await;

    let task = storage.create_task("inbox", &TaskFields::new("tracked"), None).await.unwrap();
    // The create landed on the remote but its entry was not yet completed
    storage.mark_pushed_create(&task.uuid, "r7", "t1").await.unwrap();
    storage.enqueue(&task.uuid, OpKind::Delete, Some("r7")).await.unwrap();

    let entries = storage.all_entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, OpKind::Delete);
    assert_eq!(entries[0].remote_id.as_deref(), Some("r7"));
}

#[tokio::test]
async fn enqueue_delete_converts_pending_update() {
    let (_dir, storage) = open_storage().await;

    let remote = tasknest::remote::RemoteTask {
        remote_id: "r1".to_string(),
        list_id: "inbox".to_string(),
        parent_remote_id: None,
        change_token: "t1".to_string(),
        fields: TaskFields::new("tracked"),
    };
    let uuid = storage.insert_remote_task(&remote, None).await.unwrap();

    storage.enqueue(&uuid, OpKind::Update, Some("r1")).await.unwrap();
    storage.enqueue(&uuid, OpKind::Delete, Some("r1")).await.unwrap();

    let entries = storage.all_entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, OpKind::Delete);
}
