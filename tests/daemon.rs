//! Tests for the daemon's runtime files and IPC message shapes.

use std::time::Duration;
use tempfile::TempDir;

use tasknest::daemon::heartbeat::{self, Heartbeat, HeartbeatStatus};
use tasknest::daemon::{lock, LockError, LockFile, Request, Response};

#[test]
fn lock_is_exclusive_while_held() {
    let dir = TempDir::new().unwrap();
    let lock_path = dir.path().join("daemon.lock");
    let socket_path = dir.path().join("daemon.sock");

    let held = LockFile::acquire(&lock_path, &socket_path).expect("first acquire");

    // Our own pid is alive, so the second acquire must refuse
    match LockFile::acquire(&lock_path, &socket_path) {
        Err(LockError::Held { pid }) => assert_eq!(pid, std::process::id()),
        other => panic!("expected Held, got {other:?}"),
    }

    let meta = lock::read_meta(&lock_path).unwrap();
    assert_eq!(meta.pid, std::process::id());
    assert_eq!(meta.socket_path, socket_path);

    drop(held);
    assert!(!lock_path.exists(), "lock file removed on drop");
}

#[test]
fn stale_lock_from_a_dead_pid_is_reclaimed() {
    let dir = TempDir::new().unwrap();
    let lock_path = dir.path().join("daemon.lock");
    let socket_path = dir.path().join("daemon.sock");

    // Forge a lock held by a pid that cannot exist
    let stale = serde_json::json!({
        "pid": i32::MAX as u32,
        "socket_path": socket_path,
        "started_at": chrono::Utc::now(),
    });
    std::fs::write(&lock_path, serde_json::to_string(&stale).unwrap()).unwrap();

    let held = LockFile::acquire(&lock_path, &socket_path).expect("stale lock reclaimed");
    let meta = lock::read_meta(&lock_path).unwrap();
    assert_eq!(meta.pid, std::process::id());
    drop(held);
}

#[test]
fn own_pid_is_alive_and_absurd_pid_is_not() {
    assert!(lock::pid_alive(std::process::id()));
    assert!(!lock::pid_alive(i32::MAX as u32));
    assert!(!lock::pid_alive(0));
}

#[test]
fn heartbeat_round_trips_and_detects_staleness() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("heartbeat.json");

    heartbeat::write(&path, HeartbeatStatus::Processing).unwrap();
    let beat = heartbeat::read(&path).expect("heartbeat readable");
    assert_eq!(beat.status, HeartbeatStatus::Processing);
    assert_eq!(beat.pid, std::process::id());
    assert!(!beat.is_stale(Duration::from_secs(5)));

    // A beat from twenty seconds ago is stale at a 5s cadence
    let old = Heartbeat {
        timestamp: chrono::Utc::now() - chrono::Duration::seconds(20),
        status: HeartbeatStatus::Idle,
        pid: std::process::id(),
    };
    assert!(old.is_stale(Duration::from_secs(5)));
    assert!(!old.is_stale(Duration::from_secs(60)));

    heartbeat::remove(&path);
    assert!(heartbeat::read(&path).is_none());
}

#[test]
fn stale_heartbeat_file_reports_unhealthy() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("heartbeat.json");
    let interval = Duration::from_secs(5);

    // Missing file counts as unhealthy
    assert!(!heartbeat::healthy(&path, interval));

    heartbeat::write(&path, HeartbeatStatus::Idle).unwrap();
    assert!(heartbeat::healthy(&path, interval));

    // A file last written twenty seconds ago fails the 2x-cadence rule
    let old = Heartbeat {
        timestamp: chrono::Utc::now() - chrono::Duration::seconds(20),
        status: HeartbeatStatus::Idle,
        pid: std::process::id(),
    };
    std::fs::write(&path, serde_json::to_string(&old).unwrap()).unwrap();
    assert!(!heartbeat::healthy(&path, interval));
}

#[test]
fn requests_use_stable_wire_tags() {
    assert_eq!(serde_json::to_string(&Request::Notify).unwrap(), r#"{"type":"notify"}"#);
    assert_eq!(serde_json::to_string(&Request::Status).unwrap(), r#"{"type":"status"}"#);
    assert_eq!(serde_json::to_string(&Request::Stop).unwrap(), r#"{"type":"stop"}"#);

    let parsed: Request = serde_json::from_str(r#"{"type":"notify"}"#).unwrap();
    assert_eq!(parsed, Request::Notify);

    // Unknown message types must fail to parse, not be misread
    assert!(serde_json::from_str::<Request>(r#"{"type":"reboot"}"#).is_err());
}

#[test]
fn responses_parse_from_their_wire_form() {
    let ack: Response = serde_json::from_str(r#"{"type":"ack"}"#).unwrap();
    assert!(matches!(ack, Response::Ack));

    let status: Response = serde_json::from_str(
        r#"{"type":"status","running":true,"pid":42,"state":"idle","last_sync":null,"sync_count":3,"remotes":[],"heartbeat_healthy":true}"#,
    )
    .unwrap();
    match status {
        Response::Status(reply) => {
            assert!(reply.running);
            assert_eq!(reply.pid, 42);
            assert_eq!(reply.state, "idle");
            assert_eq!(reply.sync_count, 3);
            assert!(reply.heartbeat_healthy);
        }
        other => panic!("expected status reply, got {other:?}"),
    }
}
