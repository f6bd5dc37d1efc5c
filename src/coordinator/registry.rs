//! Worker registry for tracking responding workers
//!
//! The master folds every correlated response into the registry. Records are
//! keyed by worker name, so a response delivered twice never creates a second
//! record. Workers that stop answering are removed by the pruner once they
//! have been silent for longer than the staleness window.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

use crate::metrics;

// ============================================================================
// Worker Status
// ============================================================================

/// What the master last learned about a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Answered a name report
    Reporting,

    /// Acknowledged a start-work command
    Active,
}

impl WorkerStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Reporting => "reporting",
            Self::Active => "active",
        }
    }
}

// ============================================================================
// Worker Record
// ============================================================================

/// Registry entry for one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_name: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub status: WorkerStatus,
    /// Correlated responses folded into this record
    pub response_count: u64,
}

impl WorkerRecord {
    fn new(worker_name: String, seen_at: DateTime<Utc>, status: WorkerStatus) -> Self {
        Self {
            worker_name,
            first_seen_at: seen_at,
            last_seen_at: seen_at,
            status,
            response_count: 1,
        }
    }

    /// Fold another response into the record
    ///
    /// Timestamps only move forward and `Active` is never downgraded.
    fn observe(&mut self, seen_at: DateTime<Utc>, status: WorkerStatus) {
        self.last_seen_at = self.last_seen_at.max(seen_at);
        self.status = self.status.max(status);
        self.response_count += 1;
    }

    /// Check if the worker has been silent since before `cutoff`
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_seen_at < cutoff
    }
}

// ============================================================================
// Roster
// ============================================================================

/// Immutable snapshot of the registry, ordered by worker name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    workers: BTreeMap<String, WorkerRecord>,
}

impl Roster {
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn get(&self, worker_name: &str) -> Option<&WorkerRecord> {
        self.workers.get(worker_name)
    }

    pub fn contains(&self, worker_name: &str) -> bool {
        self.workers.contains_key(worker_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values()
    }

    /// Worker names in sorted order
    pub fn names(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }
}

// ============================================================================
// Registry Stats
// ============================================================================

/// Registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_workers: usize,
    pub reporting: usize,
    pub active: usize,
    pub total_responses: u64,
}

// ============================================================================
// Worker Registry
// ============================================================================

/// Registry of the workers that have answered this master
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerRecord>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert the record for `worker_name`
    pub async fn record_response(
        &self,
        worker_name: &str,
        seen_at: DateTime<Utc>,
        status: WorkerStatus,
    ) {
        let mut workers = self.workers.write().await;

        match workers.get_mut(worker_name) {
            Some(record) => record.observe(seen_at, status),
            None => {
                tracing::info!(worker = %worker_name, status = status.label(), "Worker joined roster");
                workers.insert(
                    worker_name.to_string(),
                    WorkerRecord::new(worker_name.to_string(), seen_at, status),
                );
            }
        }

        metrics::set_roster_size(workers.len());
    }

    /// Copy the current records
    pub async fn snapshot(&self) -> Roster {
        let workers = self.workers.read().await;
        Roster {
            workers: workers
                .iter()
                .map(|(name, record)| (name.clone(), record.clone()))
                .collect(),
        }
    }

    /// Remove every worker last seen before `older_than`
    ///
    /// Returns the removed names, sorted.
    pub async fn prune_stale(&self, older_than: DateTime<Utc>) -> Vec<String> {
        let mut workers = self.workers.write().await;

        let mut removed: Vec<String> = workers
            .values()
            .filter(|record| record.is_stale(older_than))
            .map(|record| record.worker_name.clone())
            .collect();
        removed.sort();

        for name in &removed {
            workers.remove(name);
        }

        metrics::set_roster_size(workers.len());
        metrics::record_pruned(removed.len());

        if !removed.is_empty() {
            tracing::info!(workers = ?removed, remaining = workers.len(), "Pruned stale workers");
        }

        removed
    }

    /// Get registry statistics
    pub async fn stats(&self) -> RegistryStats {
        let workers = self.workers.read().await;

        let mut stats = RegistryStats {
            total_workers: workers.len(),
            ..Default::default()
        };

        for record in workers.values() {
            match record.status {
                WorkerStatus::Reporting => stats.reporting += 1,
                WorkerStatus::Active => stats.active += 1,
            }
            stats.total_responses += record.response_count;
        }

        stats
    }

    /// Start background task that prunes workers silent for `staleness`
    ///
    /// The task exits when `shutdown` flips to `true` or its sender is dropped.
    pub fn start_pruner(
        self: Arc<Self>,
        interval: Duration,
        staleness: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let staleness = ChronoDuration::from_std(staleness).unwrap_or(ChronoDuration::MAX);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; nothing can be stale yet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let cutoff = Utc::now()
                            .checked_sub_signed(staleness)
                            .unwrap_or(DateTime::<Utc>::MIN_UTC);
                        self.prune_stale(cutoff).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::debug!("Roster pruner stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
