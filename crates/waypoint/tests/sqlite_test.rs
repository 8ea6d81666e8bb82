//! Durable checkpoints: consumers over the SQLite ledger

use std::time::Duration;
use tempfile::TempDir;
use waypoint::prelude::*;

const WAIT: Duration = Duration::from_secs(5);

/// Helper to create a ledger database in a fresh directory
fn create_test_checkpoints() -> (Checkpoints, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let checkpoints = Checkpoints::open(temp_dir.path().join("ledger.db")).unwrap();
    (checkpoints, temp_dir)
}

fn reopen(temp_dir: &TempDir) -> Checkpoints {
    Checkpoints::open(temp_dir.path().join("ledger.db")).unwrap()
}

fn tick(log: &MemoryStreamStore, n: usize) {
    for _ in 0..n {
        log.append_json("clock", "Tick", &serde_json::json!({ "ok": true }))
            .unwrap();
    }
}

/// Handler that rejects messages whose payload says `"ok": false`
fn strict_handler(seen: Arc<parking_lot::Mutex<Vec<u64>>>) -> Arc<dyn MessageHandler> {
    Arc::new(handler_fn(move |message: Message| {
        let seen = seen.clone();
        async move {
            seen.lock().push(message.position.as_u64());
            let body: serde_json::Value = message.json_value()?;
            if body["ok"] == serde_json::Value::Bool(false) {
                return Err(HandlerError::rejected("payload flagged as bad"));
            }
            Ok(())
        }
    }))
}

#[tokio::test]
async fn test_checkpoint_survives_reopen() {
    let (checkpoints, temp_dir) = create_test_checkpoints();
    let log = Arc::new(MemoryStreamStore::default());
    tick(&log, 3);

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let handle = checkpoints
        .consumer(log.clone(), ConsumerConfig::new("clock"))
        .start_exclusive(strict_handler(seen.clone()))
        .await
        .unwrap();
    tokio::time::timeout(WAIT, handle.wait_for_commit(Position::new(3)))
        .await
        .unwrap()
        .unwrap();
    handle.stop().await.unwrap();
    drop(checkpoints);

    // A new process opens the same file and resumes after 3
    let checkpoints = reopen(&temp_dir);
    assert_eq!(
        checkpoints.position("clock").await.unwrap(),
        Some(Position::new(3))
    );
    tick(&log, 2);

    seen.lock().clear();
    let handle = checkpoints
        .consumer(log.clone(), ConsumerConfig::new("clock"))
        .start_exclusive(strict_handler(seen.clone()))
        .await
        .unwrap();
    tokio::time::timeout(WAIT, handle.wait_for_commit(Position::new(5)))
        .await
        .unwrap()
        .unwrap();
    handle.stop().await.unwrap();

    assert_eq!(*seen.lock(), vec![4, 5]);
    let entries = checkpoints.entries().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "clock");
    assert_eq!(entries[0].position, Position::new(5));
    assert!(entries[0].updated_at.is_some());
}

#[tokio::test]
async fn test_dead_letters_are_durable() {
    let (checkpoints, temp_dir) = create_test_checkpoints();
    let log = Arc::new(MemoryStreamStore::default());
    tick(&log, 1);
    log.append_json("clock", "Tick", &serde_json::json!({ "ok": false }))
        .unwrap();
    log.append("clock", "Tick", b"not json".to_vec()).unwrap();
    tick(&log, 1);

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let config = ConsumerConfig::new("clock").with_failure_policy(FailurePolicy::DeadLetter);
    let handle = checkpoints
        .consumer(log.clone(), config)
        .start_exclusive(strict_handler(seen.clone()))
        .await
        .unwrap();
    tokio::time::timeout(WAIT, handle.wait_for_commit(Position::new(4)))
        .await
        .unwrap()
        .unwrap();
    let stats = handle.stop().await.unwrap();
    assert_eq!(stats.dead_lettered, 2);
    drop(checkpoints);

    let checkpoints = reopen(&temp_dir);
    let dead_letters = checkpoints.dead_letters();
    assert_eq!(dead_letters.count().await.unwrap(), 2);

    let parked = dead_letters.for_checkpoint("clock").await.unwrap();
    assert_eq!(parked[0].position, Position::new(2));
    assert!(parked[0].error_message.contains("flagged"));
    assert_eq!(parked[1].position, Position::new(3));
    assert!(parked[1].error_message.contains("decode"));
    assert_eq!(parked[1].payload, b"not json".to_vec());

    dead_letters.remove(parked[0].id).await.unwrap();
    assert_eq!(dead_letters.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_lease_excludes_second_process() {
    let (first, temp_dir) = create_test_checkpoints();
    let second = reopen(&temp_dir);
    let log = Arc::new(MemoryStreamStore::default());

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let handle = first
        .consumer(log.clone(), ConsumerConfig::new("clock"))
        .start_exclusive(strict_handler(seen.clone()))
        .await
        .unwrap();

    let err = second
        .consumer(log.clone(), ConsumerConfig::new("clock"))
        .start_exclusive(strict_handler(seen.clone()))
        .await
        .err()
        .expect("second process started while the lease was held");
    assert!(matches!(err, WaypointError::LeaseHeld { .. }));

    // A different checkpoint name is unaffected
    let other = second
        .consumer(log.clone(), ConsumerConfig::new("audit"))
        .start_exclusive(strict_handler(seen.clone()))
        .await
        .unwrap();
    other.stop().await.unwrap();

    handle.stop().await.unwrap();
    let handle = second
        .consumer(log, ConsumerConfig::new("clock"))
        .start_exclusive(strict_handler(seen))
        .await
        .unwrap();
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn test_taken_over_consumer_cannot_commit() {
    let (first, temp_dir) = create_test_checkpoints();
    let second = reopen(&temp_dir);
    let log = Arc::new(MemoryStreamStore::default());

    let consumer = first.consumer(log.clone(), ConsumerConfig::new("clock"));
    let lease = consumer.acquire_lease(uuid::Uuid::new_v4()).await.unwrap();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let handle = consumer
        .start(strict_handler(seen.clone()), lease.clone())
        .await
        .unwrap();
    tokio::time::timeout(WAIT, handle.wait_for_state(ConsumerState::Live))
        .await
        .unwrap();

    // Another process takes the name well before the next renewal
    first.ledger().release(&lease).await.unwrap();
    let successor = second
        .ledger()
        .acquire("clock", uuid::Uuid::new_v4(), Duration::from_secs(30))
        .await
        .unwrap();
    tick(&log, 2);

    let err = tokio::time::timeout(WAIT, handle.join())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, WaypointError::Lease(_)));
    assert_eq!(*seen.lock(), vec![1]);
    assert_eq!(
        second.position("clock").await.unwrap(),
        Some(Position::START)
    );
    assert!(second.ledger().verify(&successor).await.unwrap());
}

#[tokio::test]
async fn test_operator_reset_rewinds_next_run() {
    let (checkpoints, _temp) = create_test_checkpoints();
    let log = Arc::new(MemoryStreamStore::default());
    tick(&log, 4);
    checkpoints.ledger().init("clock").await.unwrap();
    checkpoints
        .ledger()
        .commit("clock", Position::new(4))
        .await
        .unwrap();

    checkpoints
        .ledger()
        .reset("clock", Position::new(1))
        .await
        .unwrap();

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let handle = checkpoints
        .consumer(log, ConsumerConfig::new("clock"))
        .start_exclusive(strict_handler(seen.clone()))
        .await
        .unwrap();
    tokio::time::timeout(WAIT, handle.wait_for_commit(Position::new(4)))
        .await
        .unwrap()
        .unwrap();
    handle.stop().await.unwrap();
    assert_eq!(*seen.lock(), vec![2, 3, 4]);
}
