//! Failure tests
//!
//! Demotion on renewal failure, cancellation by shutdown, and workers
//! fencing off a superseded master.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kettle::bus::{MemoryBus, MessageBus};
use kettle::coordinator::{ElectionState, Role, WorkerStatus};
use kettle::lock::MemoryLock;
use kettle::protocol::{Channels, Command, CommandKind};
use kettle::worker::{WorkHandler, WorkerConfig, WorkerNode};
use kettle::Error;

use crate::common::{coordinator, spawn_workers, stop_workers, wait_for_role, FlakyLock, GROUP};

// ============================================================================
// Demotion
// ============================================================================

#[tokio::test]
async fn test_renewal_failure_demotes_within_one_cycle() {
    let bus = MemoryBus::new();
    let flaky = FlakyLock::new(MemoryLock::new());

    let node = coordinator("m", Arc::new(flaky.clone()), &bus);
    node.start();
    wait_for_role(&node, Role::Master, Duration::from_millis(200)).await;
    let first_token = node.fencing_token().unwrap();

    flaky.fail_renewals(true);
    wait_for_role(&node, Role::Candidate, Duration::from_millis(200)).await;

    // Its own lease is still on the lock, so it cannot win straight back
    assert_eq!(node.election_state(), ElectionState::Candidate);
    assert!(matches!(
        node.start_work(Vec::new(), None).await,
        Err(Error::NotMaster)
    ));
    assert!(matches!(
        node.discover_workers(None).await,
        Err(Error::NotMaster)
    ));

    // Once the lease lapses it contends again like anyone else
    flaky.fail_renewals(false);
    wait_for_role(&node, Role::Master, Duration::from_millis(700)).await;
    assert!(node.fencing_token().unwrap() > first_token);

    node.stop().await;
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_stop_cancels_in_flight_discovery() {
    let bus = MemoryBus::new();
    let workers = spawn_workers(&bus, &["w1"]).await;

    let master = Arc::new(coordinator("m", Arc::new(MemoryLock::new()), &bus));
    master.start();
    wait_for_role(&master, Role::Master, Duration::from_millis(200)).await;

    let discovering = {
        let master = Arc::clone(&master);
        tokio::spawn(async move { master.discover_workers(Some(Duration::from_secs(30))).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    master.stop().await;

    let result = tokio::time::timeout(Duration::from_secs(1), discovering)
        .await
        .expect("discovery should end promptly after stop")
        .unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));

    // Nothing from the cancelled round reached the roster
    assert!(master.current_roster().await.is_empty());

    stop_workers(workers).await;
}

#[tokio::test]
async fn test_broadcast_after_stop_is_refused() {
    let bus = MemoryBus::new();
    let master = coordinator("m", Arc::new(MemoryLock::new()), &bus);
    master.start();
    wait_for_role(&master, Role::Master, Duration::from_millis(200)).await;

    master.stop().await;
    assert!(master.discover_workers(None).await.is_err());
}

// ============================================================================
// Fencing
// ============================================================================

#[tokio::test]
async fn test_workers_ignore_superseded_master() {
    let bus = MemoryBus::new();
    let workers = spawn_workers(&bus, &["w1", "w2"]).await;
    let channels = Channels::for_group(GROUP);

    let send = |issuer: &str, fence: u64| {
        Command::new(CommandKind::StartWork, issuer, fence, Vec::new())
            .encode()
            .unwrap()
    };

    // The newer master is heard first, then a stale one resurfaces
    bus.publish(&channels.commands, send("new", 7)).await.unwrap();
    bus.publish(&channels.commands, send("old", 3)).await.unwrap();
    // An unfenced command is still accepted
    bus.publish(&channels.commands, send("tool", 0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    for handle in workers {
        let stats = handle.stop().await.unwrap();
        assert_eq!(stats.commands_received, 3);
        assert_eq!(stats.superseded, 1);
        assert_eq!(stats.work_started, 2);
        assert_eq!(stats.responses_sent, 2);
    }
}

#[tokio::test]
async fn test_failover_master_reaches_workers() {
    let lock = MemoryLock::new();
    let bus = MemoryBus::new();
    let workers = spawn_workers(&bus, &["w1", "w2"]).await;

    let first = coordinator("first", Arc::new(lock.clone()), &bus);
    first.start();
    wait_for_role(&first, Role::Master, Duration::from_millis(200)).await;
    assert_eq!(first.discover_workers(None).await.unwrap().len(), 2);
    first.stop().await;

    // The successor holds a higher fence, so workers keep answering
    let second = coordinator("second", Arc::new(lock.clone()), &bus);
    second.start();
    wait_for_role(&second, Role::Master, Duration::from_millis(200)).await;
    let acknowledged = second.start_work(Vec::new(), None).await.unwrap();
    assert_eq!(acknowledged, vec!["w1", "w2"]);

    second.stop().await;
    for handle in workers {
        let stats = handle.stop().await.unwrap();
        assert_eq!(stats.superseded, 0);
    }
}

// ============================================================================
// Handler Failure
// ============================================================================

struct RefusingHandler;

#[async_trait]
impl WorkHandler for RefusingHandler {
    async fn start_work(&self, _command: &Command) -> kettle::Result<()> {
        Err(Error::other("no capacity"))
    }
}

#[tokio::test]
async fn test_failed_work_is_not_acknowledged_under_redelivery() {
    let bus = MemoryBus::with_duplicates();
    let refusing = WorkerNode::new(
        WorkerConfig::new(GROUP).worker_name("w1"),
        Arc::new(bus.clone()),
        Arc::new(RefusingHandler),
    )
    .unwrap()
    .spawn()
    .await
    .unwrap();

    let master = coordinator("m", Arc::new(MemoryLock::new()), &bus);
    master.start();
    wait_for_role(&master, Role::Master, Duration::from_millis(200)).await;

    let roster = master.discover_workers(None).await.unwrap();
    assert_eq!(roster.names(), vec!["w1"]);

    let acknowledged = master.start_work(b"job".to_vec(), None).await.unwrap();
    assert!(acknowledged.is_empty());

    let roster = master.current_roster().await;
    assert_eq!(roster.get("w1").unwrap().status, WorkerStatus::Reporting);

    master.stop().await;
    let stats = refusing.stop().await.unwrap();
    assert_eq!(stats.work_started, 0);
    assert_eq!(stats.failed, 1);
}
