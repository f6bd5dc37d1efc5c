//! Coordinator: master election plus worker discovery and dispatch
//!
//! Every coordinator process of a group contends for the same lock. The one
//! holding it is the master and is the only one allowed to broadcast
//! commands; the rest stay candidates and take over when the master's lock
//! lapses.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │              Coordinator              │
//! │                                       │
//! │  ┌─────────────────────────────────┐  │
//! │  │         Election Loop           │  │──── DistLock
//! │  │  - acquire / renew / release    │  │     "{name}-distlocker"
//! │  │  - role watch channel           │  │
//! │  └─────────────────────────────────┘  │
//! │                                       │
//! │  ┌─────────────────────────────────┐  │
//! │  │       Command Protocol          │  │──── MessageBus
//! │  │  - broadcast, then collect      │  │     "{name}-commands"
//! │  │  - correlation filtering        │  │     "{name}-responses"
//! │  └─────────────────────────────────┘  │
//! │                                       │
//! │  ┌─────────────────────────────────┐  │
//! │  │        Worker Registry          │  │
//! │  │  - roster of responders         │  │
//! │  │  - staleness pruning            │  │
//! │  └─────────────────────────────────┘  │
//! └───────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use kettle::coordinator::{Coordinator, CoordinatorConfig, CoordinatorOptions};
//!
//! let config = CoordinatorConfig::builder().name("ingest").build()?;
//! let coordinator = Coordinator::new(CoordinatorOptions::new(config)).await?;
//! coordinator.start();
//!
//! let mut role = coordinator.subscribe_role();
//! role.wait_for(|r| *r == Role::Master).await?;
//! let roster = coordinator.discover_workers(None).await?;
//! ```

pub mod api;
pub mod config;
pub mod election;
pub mod registry;
pub mod server;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backend::RedisBackend;
use crate::bus::MessageBus;
use crate::error::{Error, Result};
use crate::lock::DistLock;
use crate::protocol::{BroadcastOutcome, CommandKind, CommandProtocol};
use crate::utils::from_millis;
use crate::utils::retry::RetryConfig;

// Re-export main types
pub use config::{ConfigError, CoordinatorConfig};
pub use election::{ElectionLoop, ElectionState, ElectionTiming, Role};
pub use registry::{RegistryStats, Roster, WorkerRecord, WorkerRegistry, WorkerStatus};
pub use server::{AppState, CoordinatorServer, ServerConfig, ServerError};

// ============================================================================
// Identity
// ============================================================================

/// Who a process is within its group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub name: String,
    pub instance_id: String,
    pub role: Role,
}

// ============================================================================
// Options
// ============================================================================

/// Construction options for a [`Coordinator`]
///
/// A missing lock or bus is built from `config.redis_url`.
#[derive(Clone)]
pub struct CoordinatorOptions {
    pub config: CoordinatorConfig,
    pub lock: Option<Arc<dyn DistLock>>,
    pub bus: Option<Arc<dyn MessageBus>>,
    pub connect_retry: RetryConfig,
}

impl CoordinatorOptions {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            lock: None,
            bus: None,
            connect_retry: RetryConfig::default(),
        }
    }

    /// Use `lock` instead of the Redis lock
    pub fn with_lock(mut self, lock: Arc<dyn DistLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Use `bus` instead of Redis pub/sub
    pub fn with_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Retry policy for the initial Redis connection
    pub fn with_connect_retry(mut self, retry: RetryConfig) -> Self {
        self.connect_retry = retry;
        self
    }
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self::new(CoordinatorConfig::default())
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Elects a master and lets it discover and dispatch to workers
pub struct Coordinator {
    name: String,
    instance_id: String,
    config: CoordinatorConfig,
    election: ElectionLoop,
    protocol: CommandProtocol,
    registry: Arc<WorkerRegistry>,
    shutdown_tx: watch::Sender<bool>,
    pruner: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Resolve dependencies and build a coordinator
    ///
    /// Fails with [`Error::Config`] when the config is invalid or Redis
    /// cannot be reached.
    pub async fn new(options: CoordinatorOptions) -> Result<Self> {
        let CoordinatorOptions {
            config,
            lock,
            bus,
            connect_retry,
        } = options;
        config.validate()?;

        let (lock, bus) = match (lock, bus) {
            (Some(lock), Some(bus)) => (lock, bus),
            (lock, bus) => {
                let backend = RedisBackend::connect(&config.redis_url, &connect_retry).await?;
                (
                    lock.unwrap_or_else(|| backend.lock()),
                    bus.unwrap_or_else(|| backend.bus()),
                )
            }
        };

        Self::with_dependencies(config, lock, bus)
    }

    /// Build a coordinator on explicit dependencies
    pub fn with_dependencies(
        config: CoordinatorConfig,
        lock: Arc<dyn DistLock>,
        bus: Arc<dyn MessageBus>,
    ) -> Result<Self> {
        config.validate()?;

        let instance_id = config.resolve_instance_id();
        let election = ElectionLoop::new(
            lock,
            config.lock_resource(),
            instance_id.clone(),
            ElectionTiming::from_config(&config),
        );
        let protocol = CommandProtocol::new(bus, config.channels(), instance_id.clone());
        let (shutdown_tx, _) = watch::channel(false);

        tracing::debug!(
            name = %config.name,
            instance_id = %instance_id,
            resource = %config.lock_resource(),
            "Coordinator created"
        );

        Ok(Self {
            name: config.name.clone(),
            instance_id,
            config,
            election,
            protocol,
            registry: Arc::new(WorkerRegistry::new()),
            shutdown_tx,
            pruner: Mutex::new(None),
        })
    }

    /// Start the election loop and the roster pruner
    ///
    /// Becoming master does not broadcast anything by itself.
    pub fn start(&self) {
        let mut pruner = self.pruner.lock().unwrap_or_else(|p| p.into_inner());
        if pruner.is_some() {
            return;
        }

        self.shutdown_tx.send_replace(false);
        *pruner = Some(Arc::clone(&self.registry).start_pruner(
            self.config.prune_interval(),
            self.config.staleness_window(),
            self.shutdown_tx.subscribe(),
        ));

        self.election.start();

        tracing::info!(
            name = %self.name,
            instance_id = %self.instance_id,
            "Coordinator started"
        );
    }

    /// Cancel in-flight broadcasts, stop pruning and give up the lock
    ///
    /// Idempotent.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);

        let pruner = self.pruner.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = pruner {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Roster pruner ended abnormally");
            }
        }

        let was_running = self.election.is_running();
        self.election.stop().await;

        if was_running {
            tracing::info!(instance_id = %self.instance_id, "Coordinator stopped");
        }
    }

    /// Ask every worker for its name and return the updated roster
    ///
    /// Collects for `timeout`, or the configured collect window.
    pub async fn discover_workers(&self, timeout: Option<Duration>) -> Result<Roster> {
        let outcome = self
            .broadcast(CommandKind::ReportWorkerName, Vec::new(), timeout)
            .await?;
        self.fold(&outcome, WorkerStatus::Reporting).await;

        let roster = self.registry.snapshot().await;
        tracing::info!(
            correlation_id = %outcome.correlation_id,
            responders = outcome.responses.len(),
            roster = roster.len(),
            "Worker discovery finished"
        );
        Ok(roster)
    }

    /// Tell every worker to begin processing `payload`
    ///
    /// Returns the names of the workers that acknowledged within the window.
    pub async fn start_work(&self, payload: Vec<u8>, timeout: Option<Duration>) -> Result<Vec<String>> {
        let outcome = self
            .broadcast(CommandKind::StartWork, payload, timeout)
            .await?;
        self.fold(&outcome, WorkerStatus::Active).await;

        let acknowledged = outcome.worker_names();
        tracing::info!(
            correlation_id = %outcome.correlation_id,
            acknowledged = acknowledged.len(),
            "Start work dispatched"
        );
        Ok(acknowledged)
    }

    async fn broadcast(
        &self,
        kind: CommandKind,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<BroadcastOutcome> {
        let fencing_token = self.require_master()?;
        let window = timeout.unwrap_or_else(|| self.config.collect_window());

        self.protocol
            .broadcast(kind, payload, fencing_token, window, self.shutdown_tx.subscribe())
            .await
    }

    fn require_master(&self) -> Result<u64> {
        if !self.election.is_master() {
            return Err(Error::NotMaster);
        }
        self.election.fencing_token().ok_or(Error::NotMaster)
    }

    /// Fold a broadcast's responses into the registry
    ///
    /// Records are stamped with this process's receive time; the pruner
    /// compares them against the same clock.
    async fn fold(&self, outcome: &BroadcastOutcome, status: WorkerStatus) {
        let received_at = Utc::now();
        for response in &outcome.responses {
            let skew = from_millis(response.responded_at) - received_at;
            if skew.num_milliseconds().unsigned_abs() > self.config.collect_window_ms {
                tracing::debug!(
                    worker = %response.worker_name,
                    skew_ms = skew.num_milliseconds(),
                    "Worker clock skewed beyond the collect window"
                );
            }
            self.registry
                .record_response(&response.worker_name, received_at, status)
                .await;
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn current_role(&self) -> Role {
        if self.election.is_master() {
            Role::Master
        } else {
            Role::Candidate
        }
    }

    pub async fn current_roster(&self) -> Roster {
        self.registry.snapshot().await
    }

    pub async fn registry_stats(&self) -> RegistryStats {
        self.registry.stats().await
    }

    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity {
            name: self.name.clone(),
            instance_id: self.instance_id.clone(),
            role: self.current_role(),
        }
    }

    /// Watch role transitions
    pub fn subscribe_role(&self) -> watch::Receiver<Role> {
        self.election.subscribe()
    }

    /// Fencing token of the held lock, when master
    pub fn fencing_token(&self) -> Option<u64> {
        self.election.fencing_token()
    }

    pub fn election_state(&self) -> ElectionState {
        self.election.state()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }
}
