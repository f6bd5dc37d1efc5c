//! Common test utilities

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kettle::bus::MemoryBus;
use kettle::coordinator::{Coordinator, CoordinatorConfig, Role};
use kettle::lock::{DistLock, LockError, LockHandle, MemoryLock};
use kettle::worker::{LoggingHandler, WorkerConfig, WorkerHandle, WorkerNode};

/// Group name used by the integration tests
pub const GROUP: &str = "itest";

/// Lock resource for [`GROUP`]
pub const RESOURCE: &str = "itest-distlocker";

/// Config with timings scaled down to milliseconds
pub fn fast_config(instance_id: &str) -> CoordinatorConfig {
    CoordinatorConfig::builder()
        .name(GROUP)
        .instance_id(instance_id)
        .lock_timing(Duration::from_millis(500), Duration::from_millis(400))
        .renewal_interval(Duration::from_millis(100))
        .lock_op_timeout(Duration::from_millis(50))
        .collect_window(Duration::from_millis(300))
        .build()
        .expect("valid test config")
}

pub fn coordinator(instance_id: &str, lock: Arc<dyn DistLock>, bus: &MemoryBus) -> Coordinator {
    Coordinator::with_dependencies(fast_config(instance_id), lock, Arc::new(bus.clone()))
        .expect("coordinator")
}

/// Wait until `coordinator` reports `role`
pub async fn wait_for_role(coordinator: &Coordinator, role: Role, within: Duration) {
    let mut rx = coordinator.subscribe_role();
    tokio::time::timeout(within, rx.wait_for(|r| *r == role))
        .await
        .unwrap_or_else(|_| panic!("{} never became {role}", coordinator.identity().instance_id))
        .expect("role channel closed");
}

/// Start one worker per name on `bus`
pub async fn spawn_workers(bus: &MemoryBus, names: &[&str]) -> Vec<WorkerHandle> {
    let mut handles = Vec::with_capacity(names.len());
    for name in names {
        let node = WorkerNode::new(
            WorkerConfig::new(GROUP).worker_name(*name),
            Arc::new(bus.clone()),
            Arc::new(LoggingHandler),
        )
        .expect("worker");
        handles.push(node.spawn().await.expect("worker subscribed"));
    }
    handles
}

pub async fn stop_workers(handles: Vec<WorkerHandle>) {
    for handle in handles {
        handle.stop().await.expect("worker stopped cleanly");
    }
}

// ============================================================================
// Flaky Lock
// ============================================================================

/// Memory lock whose renewals and releases can be made to fail on demand
#[derive(Clone, Default)]
pub struct FlakyLock {
    inner: MemoryLock,
    fail_renew: Arc<AtomicBool>,
    fail_release: Arc<AtomicBool>,
}

impl FlakyLock {
    pub fn new(inner: MemoryLock) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    pub fn fail_renewals(&self, fail: bool) {
        self.fail_renew.store(fail, Ordering::SeqCst);
    }

    /// Fail renew and release, as if the owner had vanished
    pub fn crash(&self) {
        self.fail_renew.store(true, Ordering::SeqCst);
        self.fail_release.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DistLock for FlakyLock {
    async fn acquire(
        &self,
        resource: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<LockHandle, LockError> {
        self.inner.acquire(resource, owner, ttl).await
    }

    async fn renew(&self, handle: &LockHandle) -> Result<LockHandle, LockError> {
        if self.fail_renew.load(Ordering::SeqCst) {
            return Err(LockError::Transport("injected renewal failure".to_string()));
        }
        self.inner.renew(handle).await
    }

    async fn release(&self, handle: &LockHandle) -> Result<(), LockError> {
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(LockError::Transport("injected release failure".to_string()));
        }
        self.inner.release(handle).await
    }
}
