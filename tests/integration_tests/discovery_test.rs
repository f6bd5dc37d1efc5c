//! Discovery tests
//!
//! A master with a pool of workers on the in-memory bus: roster convergence,
//! duplicate delivery, stale responses and start-work acknowledgement.

use std::sync::Arc;
use std::time::Duration;

use kettle::bus::{MemoryBus, MessageBus};
use kettle::coordinator::{Role, WorkerStatus};
use kettle::lock::MemoryLock;
use kettle::protocol::{Channels, Response};

use crate::common::{coordinator, spawn_workers, stop_workers, wait_for_role, GROUP};

const POOL: [&str; 5] = ["w1", "w2", "w3", "w4", "w5"];

#[tokio::test]
async fn test_discovery_finds_every_worker() {
    let bus = MemoryBus::new();
    let workers = spawn_workers(&bus, &POOL).await;

    let master = coordinator("m", Arc::new(MemoryLock::new()), &bus);
    master.start();
    wait_for_role(&master, Role::Master, Duration::from_millis(200)).await;

    let roster = master.discover_workers(None).await.unwrap();
    assert_eq!(roster.names(), POOL.map(String::from).to_vec());
    for record in roster.iter() {
        assert_eq!(record.status, WorkerStatus::Reporting);
        assert_eq!(record.response_count, 1);
    }

    // A second round refreshes the same records
    let roster = master.discover_workers(None).await.unwrap();
    assert_eq!(roster.len(), POOL.len());
    assert!(roster.iter().all(|r| r.response_count == 2));

    master.stop().await;
    stop_workers(workers).await;
}

#[tokio::test]
async fn test_duplicate_delivery_yields_one_record_per_worker() {
    let bus = MemoryBus::with_duplicates();
    let workers = spawn_workers(&bus, &["w1", "w2", "w3"]).await;

    let master = coordinator("m", Arc::new(MemoryLock::new()), &bus);
    master.start();
    wait_for_role(&master, Role::Master, Duration::from_millis(200)).await;

    let roster = master.discover_workers(None).await.unwrap();
    assert_eq!(roster.names(), vec!["w1", "w2", "w3"]);
    assert!(roster.iter().all(|r| r.response_count == 1));

    master.stop().await;

    // Each worker saw the command twice and re-acked the duplicate
    for handle in workers {
        let stats = handle.stop().await.unwrap();
        assert_eq!(stats.commands_received, 2);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.responses_sent, 2);
    }
}

#[tokio::test]
async fn test_stale_responses_are_ignored() {
    let bus = MemoryBus::new();
    let workers = spawn_workers(&bus, &["w1"]).await;

    let master = Arc::new(coordinator("m", Arc::new(MemoryLock::new()), &bus));
    master.start();
    wait_for_role(&master, Role::Master, Duration::from_millis(200)).await;

    let discovering = {
        let master = Arc::clone(&master);
        tokio::spawn(async move { master.discover_workers(None).await })
    };

    // Answers to some earlier broadcast, plus garbage, arrive mid-window
    tokio::time::sleep(Duration::from_millis(50)).await;
    let channels = Channels::for_group(GROUP);
    let stale = Response {
        correlation_id: "an-old-broadcast".to_string(),
        worker_name: "ghost".to_string(),
        responded_at: chrono::Utc::now().timestamp_millis(),
    };
    bus.publish(&channels.responses, stale.encode().unwrap())
        .await
        .unwrap();
    bus.publish(&channels.responses, bytes::Bytes::from_static(b"{not json"))
        .await
        .unwrap();

    let roster = discovering.await.unwrap().unwrap();
    assert_eq!(roster.names(), vec!["w1"]);
    assert!(!roster.contains("ghost"));

    master.stop().await;
    stop_workers(workers).await;
}

#[tokio::test]
async fn test_start_work_acknowledged_and_marks_active() {
    let bus = MemoryBus::new();
    let workers = spawn_workers(&bus, &["w1", "w2"]).await;

    let master = coordinator("m", Arc::new(MemoryLock::new()), &bus);
    master.start();
    wait_for_role(&master, Role::Master, Duration::from_millis(200)).await;

    master.discover_workers(None).await.unwrap();
    let acknowledged = master
        .start_work(b"batch-7".to_vec(), Some(Duration::from_millis(200)))
        .await
        .unwrap();
    assert_eq!(acknowledged, vec!["w1", "w2"]);

    let stats = master.registry_stats().await;
    assert_eq!(stats.total_workers, 2);
    assert_eq!(stats.active, 2);
    assert_eq!(stats.reporting, 0);

    // A later name report does not demote an active worker
    let roster = master.discover_workers(None).await.unwrap();
    assert!(roster.iter().all(|r| r.status == WorkerStatus::Active));

    master.stop().await;
    for handle in workers {
        let stats = handle.stop().await.unwrap();
        assert_eq!(stats.work_started, 1);
    }
}

#[tokio::test]
async fn test_workers_joining_later_appear_in_next_round() {
    let bus = MemoryBus::new();
    let mut workers = spawn_workers(&bus, &["early"]).await;

    let master = coordinator("m", Arc::new(MemoryLock::new()), &bus);
    master.start();
    wait_for_role(&master, Role::Master, Duration::from_millis(200)).await;

    let roster = master.discover_workers(None).await.unwrap();
    assert_eq!(roster.names(), vec!["early"]);

    workers.extend(spawn_workers(&bus, &["late"]).await);
    let roster = master.discover_workers(None).await.unwrap();
    assert_eq!(roster.names(), vec!["early", "late"]);

    master.stop().await;
    stop_workers(workers).await;
}
