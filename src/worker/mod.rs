//! Worker side of the command protocol
//!
//! A [`WorkerNode`] listens on the group's command channel and answers every
//! command with its name. `StartWork` commands are also handed to a
//! [`WorkHandler`], at most once per correlation id, since the bus may
//! deliver the same command more than once. A command whose work failed is
//! never acknowledged, not even on redelivery.
//!
//! Commands carry the issuing master's fencing token. A worker remembers the
//! highest token it has seen and ignores commands from lower ones, so a
//! master that lost its lock without noticing cannot start work behind its
//! successor's back. A token of 0 means the issuer sent none and is always
//! accepted.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bus::{BusStream, MessageBus, PublishError};
use crate::coordinator::config::{ConfigError, DEFAULT_NAME};
use crate::coordinator::{NodeIdentity, Role};
use crate::error::Result;
use crate::protocol::{Channels, Command, CommandKind, Response};
use crate::utils::short_id;

// ============================================================================
// Config
// ============================================================================

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Group name; must match the coordinators'
    pub name: String,

    /// Name reported to the master; generated when absent
    pub worker_name: Option<String>,

    /// Number of recent correlation ids remembered for deduplication
    pub dedup_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            worker_name: None,
            dedup_capacity: 1024,
        }
    }
}

impl WorkerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the reported worker name
    pub fn worker_name(mut self, worker_name: impl Into<String>) -> Self {
        self.worker_name = Some(worker_name.into());
        self
    }

    /// Set how many correlation ids are remembered
    pub fn dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity = capacity;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "name".to_string(),
                reason: "Group name must not be empty".to_string(),
            });
        }

        if matches!(&self.worker_name, Some(n) if n.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "worker_name".to_string(),
                reason: "Worker name must not be empty".to_string(),
            });
        }

        if self.dedup_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "dedup_capacity".to_string(),
                reason: "Must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    /// Worker name, generating `{name}-worker-{random}` when none was configured
    pub fn resolve_worker_name(&self) -> String {
        self.worker_name
            .clone()
            .unwrap_or_else(|| format!("{}-worker-{}", self.name, short_id()))
    }
}

// ============================================================================
// Work Handler
// ============================================================================

/// Application hook invoked when the master starts work
///
/// Called on the worker's receive loop; long-running work should be spawned
/// rather than awaited here.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn start_work(&self, command: &Command) -> Result<()>;
}

/// Handler that only logs the request
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

#[async_trait]
impl WorkHandler for LoggingHandler {
    async fn start_work(&self, command: &Command) -> Result<()> {
        tracing::info!(
            correlation_id = %command.correlation_id,
            issuer = %command.issuer_instance_id,
            payload_bytes = command.payload.len(),
            "Start work requested"
        );
        Ok(())
    }
}

// ============================================================================
// Command Filter
// ============================================================================

/// How a received command should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// First delivery from a current master
    Fresh,

    /// Already accepted this correlation id
    Duplicate,

    /// Already seen this correlation id, and its work failed
    Failed,

    /// Issued under a lower fencing token than one already seen
    Superseded,
}

/// Fencing and deduplication state of one worker
#[derive(Debug)]
pub struct CommandFilter {
    highest_fence: u64,
    /// Correlation id -> whether the command was accepted
    seen: HashMap<String, bool>,
    order: VecDeque<String>,
    capacity: usize,
}

impl CommandFilter {
    pub fn new(capacity: usize) -> Self {
        Self {
            highest_fence: 0,
            seen: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn check(&mut self, command: &Command) -> Verdict {
        if command.fencing_token != 0 {
            if command.fencing_token < self.highest_fence {
                return Verdict::Superseded;
            }
            self.highest_fence = command.fencing_token;
        }

        match self.seen.get(&command.correlation_id) {
            Some(true) => return Verdict::Duplicate,
            Some(false) => return Verdict::Failed,
            None => {}
        }

        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(command.correlation_id.clone(), true);
        self.order.push_back(command.correlation_id.clone());

        Verdict::Fresh
    }

    /// Mark a fresh command as failed so redeliveries stay unanswered
    pub fn reject(&mut self, correlation_id: &str) {
        if let Some(accepted) = self.seen.get_mut(correlation_id) {
            *accepted = false;
        }
    }

    pub fn highest_fence(&self) -> u64 {
        self.highest_fence
    }
}

// ============================================================================
// Worker Node
// ============================================================================

/// Counters kept by a running worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub commands_received: u64,
    pub responses_sent: u64,
    pub work_started: u64,
    pub duplicates: u64,
    pub superseded: u64,
    pub failed: u64,
    pub malformed: u64,
}

/// Answers commands from the group's master
pub struct WorkerNode {
    config: WorkerConfig,
    worker_name: String,
    channels: Channels,
    bus: Arc<dyn MessageBus>,
    handler: Arc<dyn WorkHandler>,
}

impl WorkerNode {
    pub fn new(
        config: WorkerConfig,
        bus: Arc<dyn MessageBus>,
        handler: Arc<dyn WorkHandler>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            worker_name: config.resolve_worker_name(),
            channels: Channels::for_group(&config.name),
            config,
            bus,
            handler,
        })
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity {
            name: self.config.name.clone(),
            instance_id: self.worker_name.clone(),
            role: Role::Worker,
        }
    }

    /// Answer commands until `shutdown` flips to `true`
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<WorkerStats> {
        let commands = self.subscribe().await?;
        self.serve(commands, shutdown).await
    }

    /// Subscribe, then answer commands on a background task
    ///
    /// The subscription is in place when this returns.
    pub async fn spawn(self) -> Result<WorkerHandle> {
        let commands = self.subscribe().await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker_name = self.worker_name.clone();

        let task = tokio::spawn(async move { self.serve(commands, shutdown_rx).await });

        Ok(WorkerHandle {
            worker_name,
            shutdown_tx,
            task,
        })
    }

    async fn subscribe(&self) -> Result<BusStream> {
        let commands = self.bus.subscribe(&self.channels.commands).await?;
        tracing::info!(
            worker = %self.worker_name,
            channel = %self.channels.commands,
            "Worker listening for commands"
        );
        Ok(commands)
    }

    async fn serve(
        &self,
        mut commands: BusStream,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<WorkerStats> {
        let mut filter = CommandFilter::new(self.config.dedup_capacity);
        let mut stats = WorkerStats::default();

        if *shutdown.borrow() {
            return Ok(stats);
        }

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = commands.next() => {
                    let Some(bytes) = next else {
                        tracing::warn!(worker = %self.worker_name, "Command channel closed");
                        return Err(PublishError::Closed.into());
                    };
                    self.handle(&bytes, &mut filter, &mut stats).await;
                }
            }
        }

        tracing::info!(worker = %self.worker_name, ?stats, "Worker stopped");
        Ok(stats)
    }

    async fn handle(&self, bytes: &[u8], filter: &mut CommandFilter, stats: &mut WorkerStats) {
        let command = match Command::decode(bytes) {
            Ok(command) => command,
            Err(e) => {
                stats.malformed += 1;
                tracing::debug!(worker = %self.worker_name, error = %e, "Dropped command");
                return;
            }
        };
        stats.commands_received += 1;

        match filter.check(&command) {
            Verdict::Superseded => {
                stats.superseded += 1;
                tracing::warn!(
                    worker = %self.worker_name,
                    issuer = %command.issuer_instance_id,
                    fencing_token = command.fencing_token,
                    highest = filter.highest_fence(),
                    "Ignoring command from superseded master"
                );
                return;
            }
            Verdict::Duplicate => {
                stats.duplicates += 1;
                tracing::debug!(
                    worker = %self.worker_name,
                    correlation_id = %command.correlation_id,
                    "Duplicate delivery"
                );
            }
            Verdict::Failed => {
                stats.duplicates += 1;
                tracing::debug!(
                    worker = %self.worker_name,
                    correlation_id = %command.correlation_id,
                    "Redelivery of failed command, not acknowledging"
                );
                return;
            }
            Verdict::Fresh => {
                if command.kind == CommandKind::StartWork {
                    if let Err(e) = self.handler.start_work(&command).await {
                        filter.reject(&command.correlation_id);
                        stats.failed += 1;
                        tracing::warn!(
                            worker = %self.worker_name,
                            correlation_id = %command.correlation_id,
                            error = %e,
                            "Work handler failed, not acknowledging"
                        );
                        return;
                    }
                    stats.work_started += 1;
                }
            }
        }

        self.respond(&command, stats).await;
    }

    async fn respond(&self, command: &Command, stats: &mut WorkerStats) {
        let payload = match Response::answering(command, self.worker_name.clone()).encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(worker = %self.worker_name, error = %e, "Failed to encode response");
                return;
            }
        };

        match self.bus.publish(&self.channels.responses, payload).await {
            Ok(()) => {
                stats.responses_sent += 1;
                tracing::debug!(
                    worker = %self.worker_name,
                    kind = %command.kind,
                    correlation_id = %command.correlation_id,
                    "Responded"
                );
            }
            Err(e) => {
                tracing::warn!(worker = %self.worker_name, error = %e, "Failed to publish response");
            }
        }
    }
}

/// Handle to a worker running on a background task
pub struct WorkerHandle {
    worker_name: String,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<Result<WorkerStats>>,
}

impl WorkerHandle {
    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    /// Stop the worker and return its counters
    pub async fn stop(self) -> Result<WorkerStats> {
        let _ = self.shutdown_tx.send(true);
        self.task
            .await
            .map_err(|e| crate::error::Error::with_source("Worker task failed", e))?
    }
}

// ============================================================================
// Tests
// ============================================================================
