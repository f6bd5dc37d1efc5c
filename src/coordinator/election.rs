//! Master election over a distributed lock
//!
//! One [`ElectionLoop`] runs per coordinator. Every `renewal_interval` it
//! either tries to take the group lock (while Candidate) or extends it (while
//! Master). Any failure on the master side demotes immediately; a candidate
//! that fails simply tries again on the next cycle.
//!
//! ```text
//!   Idle --start--> Candidate --acquire ok--> Master
//!                      ^                        |
//!                      +--- renew failed -------+
//!                                               |
//!                   Relinquishing <----stop-----+
//! ```

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::lock::{DistLock, LockError, LockHandle};
use crate::metrics;

use super::config::CoordinatorConfig;

// ============================================================================
// Role / State
// ============================================================================

/// Role of a process within its group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Contending for the lock
    Candidate,

    /// Holds the lock and may broadcast
    Master,

    /// Worker process; never contends
    Worker,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Candidate => "candidate",
            Self::Master => "master",
            Self::Worker => "worker",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Internal state of the election loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElectionState {
    Idle,
    Candidate,
    Master,
    Relinquishing,
}

/// Timing parameters of the election loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionTiming {
    pub ttl: Duration,
    pub safety_margin: Duration,
    pub renewal_interval: Duration,
    pub lock_op_timeout: Duration,
}

impl ElectionTiming {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            ttl: config.lock_ttl(),
            safety_margin: config.safety_margin(),
            renewal_interval: config.renewal_interval(),
            lock_op_timeout: config.lock_op_timeout(),
        }
    }
}

// ============================================================================
// Shared State
// ============================================================================

#[derive(Debug)]
struct ElectionInner {
    state: ElectionState,
    handle: Option<LockHandle>,
}

struct Shared {
    lock: Arc<dyn DistLock>,
    resource: String,
    owner: String,
    timing: ElectionTiming,
    inner: Mutex<ElectionInner>,
    role_tx: watch::Sender<Role>,
}

struct RunHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

// ============================================================================
// Election Loop
// ============================================================================

/// Periodic acquire/renew state machine
///
/// Dropping the loop without calling [`stop`](Self::stop) closes the shutdown
/// channel; the background task notices, releases a held lock and exits.
pub struct ElectionLoop {
    shared: Arc<Shared>,
    run: Mutex<Option<RunHandle>>,
}

impl ElectionLoop {
    /// Create a loop contending for `resource` as `owner`
    pub fn new(
        lock: Arc<dyn DistLock>,
        resource: impl Into<String>,
        owner: impl Into<String>,
        timing: ElectionTiming,
    ) -> Self {
        let (role_tx, _) = watch::channel(Role::Candidate);

        Self {
            shared: Arc::new(Shared {
                lock,
                resource: resource.into(),
                owner: owner.into(),
                timing,
                inner: Mutex::new(ElectionInner {
                    state: ElectionState::Idle,
                    handle: None,
                }),
                role_tx,
            }),
            run: Mutex::new(None),
        }
    }

    /// Begin contending; a no-op while already running
    ///
    /// The first cycle runs immediately.
    pub fn start(&self) {
        let mut run = lock_unpoisoned(&self.run);
        if run.is_some() {
            return;
        }

        self.shared.set_state(ElectionState::Candidate);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(shared.run(shutdown_rx));

        tracing::info!(
            resource = %self.shared.resource,
            owner = %self.shared.owner,
            interval_ms = self.shared.timing.renewal_interval.as_millis() as u64,
            "Election loop started"
        );

        *run = Some(RunHandle { shutdown_tx, task });
    }

    /// Stop contending and release the lock if held
    ///
    /// Idempotent; returns once the lock has been released.
    pub async fn stop(&self) {
        let running = lock_unpoisoned(&self.run).take();
        let Some(RunHandle { shutdown_tx, task }) = running else {
            return;
        };

        let _ = shutdown_tx.send(true);
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Election task ended abnormally");
        }
    }

    /// Whether the background task is running
    pub fn is_running(&self) -> bool {
        lock_unpoisoned(&self.run).is_some()
    }

    /// Current role as last published
    pub fn role(&self) -> Role {
        *self.shared.role_tx.borrow()
    }

    pub fn state(&self) -> ElectionState {
        lock_unpoisoned(&self.shared.inner).state
    }

    /// Master with a lease that has not run into its safety margin
    ///
    /// Stricter than `role() == Role::Master`: a master whose renewal is
    /// stuck stops answering true before its lock can expire.
    pub fn is_master(&self) -> bool {
        let inner = lock_unpoisoned(&self.shared.inner);
        inner.state == ElectionState::Master
            && inner
                .handle
                .as_ref()
                .is_some_and(|h| !self.shared.lease_exhausted(h))
    }

    /// Fencing token of the held lock
    pub fn fencing_token(&self) -> Option<u64> {
        lock_unpoisoned(&self.shared.inner)
            .handle
            .as_ref()
            .map(|h| h.fencing_token)
    }

    /// Watch role changes
    pub fn subscribe(&self) -> watch::Receiver<Role> {
        self.shared.role_tx.subscribe()
    }
}

impl Shared {
    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.timing.renewal_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.cycle().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.relinquish().await;
    }

    async fn cycle(&self) {
        let held = lock_unpoisoned(&self.inner).handle.clone();

        match held {
            None => self.try_acquire().await,
            Some(handle) if self.lease_exhausted(&handle) => {
                self.demote("lease_expired", None);
            }
            Some(handle) => self.try_renew(handle).await,
        }
    }

    async fn try_acquire(&self) {
        let result = {
            let _timer = metrics::start_lock_timer("acquire");
            self.bounded(self.lock.acquire(&self.resource, &self.owner, self.timing.ttl))
                .await
        };

        match result {
            Ok(handle) => self.promote(handle),
            Err(LockError::Contended { .. }) => {
                tracing::trace!(resource = %self.resource, "Lock held elsewhere, staying candidate");
            }
            Err(e) => {
                metrics::record_lock_failure("acquire");
                tracing::debug!(resource = %self.resource, error = %e, "Acquire failed");
            }
        }
    }

    async fn try_renew(&self, handle: LockHandle) {
        let result = {
            let _timer = metrics::start_lock_timer("renew");
            self.bounded(self.lock.renew(&handle)).await
        };

        match result {
            Ok(renewed) => {
                let mut inner = lock_unpoisoned(&self.inner);
                if inner.state == ElectionState::Master {
                    inner.handle = Some(renewed);
                }
            }
            Err(e) => {
                metrics::record_lock_failure("renew");
                self.demote("renew_failed", Some(&e));
            }
        }
    }

    async fn relinquish(&self) {
        let handle = {
            let mut inner = lock_unpoisoned(&self.inner);
            inner.state = ElectionState::Relinquishing;
            inner.handle.take()
        };
        self.publish_role(Role::Candidate);

        if let Some(handle) = handle {
            let result = {
                let _timer = metrics::start_lock_timer("release");
                self.bounded(self.lock.release(&handle)).await
            };

            match result {
                Ok(()) => tracing::info!(resource = %self.resource, "Lock released"),
                Err(e) => {
                    metrics::record_lock_failure("release");
                    tracing::warn!(resource = %self.resource, error = %e, "Release failed, lock will expire");
                }
            }
        }

        tracing::info!(owner = %self.owner, "Election loop stopped");
    }

    fn promote(&self, handle: LockHandle) {
        let fencing_token = handle.fencing_token;
        {
            let mut inner = lock_unpoisoned(&self.inner);
            inner.state = ElectionState::Master;
            inner.handle = Some(handle);
        }

        metrics::record_election_won();
        self.publish_role(Role::Master);
        tracing::info!(
            resource = %self.resource,
            owner = %self.owner,
            fencing_token,
            "Became master"
        );
    }

    fn demote(&self, reason: &'static str, error: Option<&LockError>) {
        {
            let mut inner = lock_unpoisoned(&self.inner);
            inner.state = ElectionState::Candidate;
            inner.handle = None;
        }

        metrics::record_leadership_lost(reason);
        self.publish_role(Role::Candidate);
        match error {
            Some(e) => tracing::warn!(resource = %self.resource, reason, error = %e, "Lost leadership"),
            None => tracing::warn!(resource = %self.resource, reason, "Lost leadership"),
        }
    }

    fn set_state(&self, state: ElectionState) {
        lock_unpoisoned(&self.inner).state = state;
    }

    fn publish_role(&self, role: Role) {
        self.role_tx.send_if_modified(|current| {
            if *current == role {
                false
            } else {
                *current = role;
                true
            }
        });
        metrics::set_master(role == Role::Master);
    }

    fn lease_exhausted(&self, handle: &LockHandle) -> bool {
        Instant::now() + self.timing.safety_margin >= handle.expires_at
    }

    async fn bounded<T>(
        &self,
        op: impl std::future::Future<Output = Result<T, LockError>>,
    ) -> Result<T, LockError> {
        match tokio::time::timeout(self.timing.lock_op_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(LockError::Timeout),
        }
    }
}

/// Lock a std mutex, recovering the data if a holder panicked
fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Tests
// ============================================================================
