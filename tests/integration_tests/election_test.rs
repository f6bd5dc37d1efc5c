//! Election tests
//!
//! Tests leadership between coordinators sharing one lock:
//! 1. Mutual exclusion among simultaneous contenders
//! 2. Failover after a clean stop
//! 3. Failover after the master stops renewing

use std::sync::Arc;
use std::time::Duration;

use kettle::bus::MemoryBus;
use kettle::coordinator::{Coordinator, Role};
use kettle::lock::MemoryLock;

use crate::common::{coordinator, wait_for_role, FlakyLock, RESOURCE};

fn masters(coordinators: &[Coordinator]) -> Vec<String> {
    coordinators
        .iter()
        .filter(|c| c.current_role() == Role::Master)
        .map(|c| c.identity().instance_id)
        .collect()
}

async fn wait_for_any_master(coordinators: &[Coordinator], within: Duration) -> String {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let current = masters(coordinators);
        if current.len() == 1 {
            return current[0].clone();
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no single master within {within:?}: {current:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Mutual Exclusion Tests
// ============================================================================

#[tokio::test]
async fn test_three_contenders_elect_exactly_one_master() {
    let lock = MemoryLock::new();
    let bus = MemoryBus::new();
    let coordinators: Vec<Coordinator> = ["a", "b", "c"]
        .iter()
        .map(|id| coordinator(id, Arc::new(lock.clone()), &bus))
        .collect();

    for c in &coordinators {
        c.start();
    }

    // First cycles run immediately, so one renewal interval is plenty
    let master = wait_for_any_master(&coordinators, Duration::from_millis(200)).await;
    assert_eq!(lock.holder(RESOURCE).await.as_deref(), Some(master.as_str()));

    // Never more than one master across several renewal cycles
    for _ in 0..50 {
        assert!(masters(&coordinators).len() <= 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let candidates = coordinators
        .iter()
        .filter(|c| c.current_role() == Role::Candidate)
        .count();
    assert_eq!(candidates, 2);

    for c in &coordinators {
        c.stop().await;
    }
}

#[tokio::test]
async fn test_master_is_stable_while_renewing() {
    let lock = MemoryLock::new();
    let bus = MemoryBus::new();
    let coordinators: Vec<Coordinator> = ["a", "b"]
        .iter()
        .map(|id| coordinator(id, Arc::new(lock.clone()), &bus))
        .collect();

    for c in &coordinators {
        c.start();
    }
    let first = wait_for_any_master(&coordinators, Duration::from_millis(200)).await;

    // Several TTLs pass without a takeover
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(masters(&coordinators), vec![first]);

    for c in &coordinators {
        c.stop().await;
    }
}

#[tokio::test]
async fn test_renewal_continues_during_long_broadcast() {
    let bus = MemoryBus::new();
    let master = coordinator("a", Arc::new(MemoryLock::new()), &bus);
    master.start();
    wait_for_role(&master, Role::Master, Duration::from_millis(200)).await;
    let token = master.fencing_token();

    // The window spans several TTLs; renewals must keep firing meanwhile
    let roster = master
        .discover_workers(Some(Duration::from_millis(1500)))
        .await
        .unwrap();
    assert!(roster.is_empty());

    assert_eq!(master.current_role(), Role::Master);
    assert_eq!(master.fencing_token(), token);

    master.stop().await;
}

// ============================================================================
// Failover Tests
// ============================================================================

#[tokio::test]
async fn test_failover_after_master_stops() {
    let lock = MemoryLock::new();
    let bus = MemoryBus::new();
    let coordinators: Vec<Coordinator> = ["a", "b", "c"]
        .iter()
        .map(|id| coordinator(id, Arc::new(lock.clone()), &bus))
        .collect();

    for c in &coordinators {
        c.start();
    }
    let first = wait_for_any_master(&coordinators, Duration::from_millis(200)).await;
    let old = coordinators
        .iter()
        .find(|c| c.identity().instance_id == first)
        .unwrap();
    let old_token = old.fencing_token().unwrap();

    old.stop().await;
    assert_eq!(old.current_role(), Role::Candidate);

    // Released on stop, so a survivor takes over on its next cycle
    let second = wait_for_any_master(&coordinators, Duration::from_millis(300)).await;
    assert_ne!(second, first);

    let new = coordinators
        .iter()
        .find(|c| c.identity().instance_id == second)
        .unwrap();
    assert!(new.fencing_token().unwrap() > old_token);

    for c in &coordinators {
        c.stop().await;
    }
}

#[tokio::test]
async fn test_failover_after_master_cannot_renew() {
    let lock = MemoryLock::new();
    let bus = MemoryBus::new();
    let flaky = FlakyLock::new(lock.clone());

    // Only the flaky contender starts at first, so it is the master
    let failing = coordinator("failing", Arc::new(flaky.clone()), &bus);
    failing.start();
    wait_for_role(&failing, Role::Master, Duration::from_millis(200)).await;

    let survivor = coordinator("survivor", Arc::new(lock.clone()), &bus);
    survivor.start();

    // The failing master can neither renew nor release
    flaky.crash();
    failing.stop().await;
    assert_eq!(lock.holder(RESOURCE).await.as_deref(), Some("failing"));

    // Its lock lapses after the TTL, then the survivor acquires within a cycle
    wait_for_role(&survivor, Role::Master, Duration::from_millis(400 + 100 + 200)).await;
    assert_eq!(lock.holder(RESOURCE).await.as_deref(), Some("survivor"));

    survivor.stop().await;
}
