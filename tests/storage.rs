//! Integration tests for the local storage layer: mutation handlers, the
//! dirty-flag/queue invariant and delete semantics.

use tasknest::remote::{RemoteTask, TaskFields};
use tasknest::storage::{DeleteOutcome, LocalStorage, OpKind};
use tempfile::TempDir;

async fn open_storage() -> (TempDir, LocalStorage) {
    let dir = TempDir::new().expect("tempdir");
    let storage = LocalStorage::open(dir.path().join("test.db")).await.expect("open db");
    (dir, storage)
}

fn remote_task(remote_id: &str, list_id: &str, content: &str, token: &str) -> RemoteTask {
    RemoteTask {
        remote_id: remote_id.to_string(),
        list_id: list_id.to_string(),
        parent_remote_id: None,
        change_token: token.to_string(),
        fields: TaskFields::new(content),
    }
}

#[tokio::test]
async fn create_marks_dirty_and_queues_exactly_one_entry() {
    let (_dir, storage) = open_storage().await;

    let task = storage
        .create_task("inbox", &TaskFields::new("Buy milk"), None)
        .await
        .unwrap();

    assert!(task.dirty);
    assert!(task.remote_id.is_none());

    let entry = storage.pending_entry_for_task(&task.uuid).await.unwrap().unwrap();
    assert_eq!(entry.kind, OpKind::Create);
    assert_eq!(storage.all_entries().await.unwrap().len(), 1);
}

#[tokio::test]
async fn repeated_updates_keep_a_single_queue_entry() {
    let (_dir, storage) = open_storage().await;

    let task = storage
        .create_task("inbox", &TaskFields::new("Buy milk"), None)
        .await
        .unwrap();

    let mut fields = task.fields.clone();
    fields.content = "Buy oat milk".to_string();
    storage.update_task(&task.uuid, &fields).await.unwrap();
    fields.priority = 3;
    storage.update_task(&task.uuid, &fields).await.unwrap();

    // Both updates folded into the pending create
    let entry = storage.pending_entry_for_task(&task.uuid).await.unwrap().unwrap();
    assert_eq!(entry.kind, OpKind::Create);
    assert_eq!(storage.all_entries().await.unwrap().len(), 1);

    let stored = storage.get_task(&task.uuid).await.unwrap().unwrap();
    assert_eq!(stored.fields.content, "Buy oat milk");
    assert_eq!(stored.fields.priority, 3);
}

#[tokio::test]
async fn delete_supersedes_pending_update() {
    let (_dir, storage) = open_storage().await;

    // A task the remote already knows about
    let remote = remote_task("r1", "inbox", "Buy milk", "t1");
    let uuid = storage.insert_remote_task(&remote, None).await.unwrap();

    let mut fields = TaskFields::new("Buy oat milk");
    fields.priority = 2;
    storage.update_task(&uuid, &fields).await.unwrap();
    assert_eq!(storage.delete_task(&uuid).await.unwrap(), DeleteOutcome::QueuedForRemote);

    let entry = storage.pending_entry_for_task(&uuid).await.unwrap().unwrap();
    assert_eq!(entry.kind, OpKind::Delete);
    assert_eq!(entry.remote_id.as_deref(), Some("r1"));
    assert_eq!(storage.all_entries().await.unwrap().len(), 1);

    let stored = storage.get_task(&uuid).await.unwrap().unwrap();
    assert!(stored.pending_delete);
}

#[tokio::test]
async fn deleting_a_never_pushed_task_removes_it_outright() {
    let (_dir, storage) = open_storage().await;

    let task = storage
        .create_task("inbox", &TaskFields::new("Draft"), None)
        .await
        .unwrap();

    assert_eq!(storage.delete_task(&task.uuid).await.unwrap(), DeleteOutcome::RemovedLocally);

    assert!(storage.get_task(&task.uuid).await.unwrap().is_none());
    assert!(storage.all_entries().await.unwrap().is_empty());
}

#[tokio::test]
async fn overwrite_from_remote_clears_dirty_and_queue() {
    let (_dir, storage) = open_storage().await;

    let remote = remote_task("r1", "inbox", "Buy milk", "t1");
    let uuid = storage.insert_remote_task(&remote, None).await.unwrap();
    storage.update_task(&uuid, &TaskFields::new("Buy oat milk")).await.unwrap();

    let newer = remote_task("r1", "inbox", "Buy soy milk", "t2");
    storage.overwrite_from_remote(&uuid, &newer).await.unwrap();

    let stored = storage.get_task(&uuid).await.unwrap().unwrap();
    assert!(!stored.dirty);
    assert_eq!(stored.fields.content, "Buy soy milk");
    assert_eq!(stored.remote_token.as_deref(), Some("t2"));
    assert_eq!(stored.synced_state.as_ref().unwrap().content, "Buy soy milk");
    assert!(storage.pending_entry_for_task(&uuid).await.unwrap().is_none());
}

#[tokio::test]
async fn parent_must_share_the_list() {
    let (_dir, storage) = open_storage().await;

    let parent = storage
        .create_task("inbox", &TaskFields::new("Parent"), None)
        .await
        .unwrap();

    let err = storage
        .create_task("work", &TaskFields::new("Child"), Some(&parent.uuid))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("different list"), "got: {err}");
}

#[tokio::test]
async fn set_parent_rejects_cycles() {
    let (_dir, storage) = open_storage().await;

    let a = storage.create_task("inbox", &TaskFields::new("a"), None).await.unwrap();
    let b = storage
        .create_task("inbox", &TaskFields::new("b"), Some(&a.uuid))
        .await
        .unwrap();
    let c = storage
        .create_task("inbox", &TaskFields::new("c"), Some(&b.uuid))
        .await
        .unwrap();

    let err = storage.set_parent(&a.uuid, Some(&c.uuid)).await.unwrap_err();
    assert!(err.to_string().contains("cycle"), "got: {err}");
}

#[tokio::test]
async fn mark_pushed_create_records_remote_identity() {
    let (_dir, storage) = open_storage().await;

    let task = storage
        .create_task("inbox", &TaskFields::new("Buy milk"), None)
        .await
        .unwrap();

    storage.mark_pushed_create(&task.uuid, "r42", "t1").await.unwrap();

    let stored = storage.get_task(&task.uuid).await.unwrap().unwrap();
    assert_eq!(stored.remote_id.as_deref(), Some("r42"));
    assert_eq!(stored.remote_token.as_deref(), Some("t1"));
    assert!(!stored.dirty);
    // The merge base snapshots the pushed fields
    assert_eq!(stored.synced_state.as_ref().unwrap().content, "Buy milk");
}

#[tokio::test]
async fn list_tokens_round_trip() {
    let (_dir, storage) = open_storage().await;

    assert!(storage.get_list_token("inbox").await.unwrap().is_none());
    storage.set_list_token("inbox", Some("ct-1")).await.unwrap();
    assert_eq!(storage.get_list_token("inbox").await.unwrap().as_deref(), Some("ct-1"));
    assert!(storage.get_list_last_synced("inbox").await.unwrap().is_some());
}
