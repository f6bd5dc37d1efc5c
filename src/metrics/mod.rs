//! Prometheus metrics for election and worker coordination
//!
//! This module provides metrics tracking for:
//! - Election: current role, elections won, leadership lost, lock failures and latency
//! - Protocol: broadcasts, accepted responses, dropped messages, roster size
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, or it is never called, metrics operations are no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for election metrics
struct ElectionMetrics {
    is_master: Gauge,
    elections_won: Counter,
    leadership_lost: CounterVec,
    lock_failures: CounterVec,
    lock_duration: HistogramVec,
}

/// Container for command protocol metrics
struct ProtocolMetrics {
    broadcasts: CounterVec,
    responses: CounterVec,
    dropped: CounterVec,
    roster_size: Gauge,
    pruned: Counter,
}

static ELECTION_METRICS: OnceLock<ElectionMetrics> = OnceLock::new();

static PROTOCOL_METRICS: OnceLock<ProtocolMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics in the default registry
///
/// Safe to call more than once; only the first call registers anything.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let election = ElectionMetrics {
        is_master: register_gauge!(
            "kettle_election_is_master",
            "Whether this process currently holds the master lock (1 = yes, 0 = no)"
        )?,
        elections_won: register_counter!(
            "kettle_election_won_total",
            "Number of times this process acquired the master lock"
        )?,
        leadership_lost: register_counter_vec!(
            "kettle_election_leadership_lost_total",
            "Number of demotions from master by reason",
            &["reason"]
        )?,
        lock_failures: register_counter_vec!(
            "kettle_lock_failures_total",
            "Failed lock operations by operation",
            &["op"]
        )?,
        lock_duration: register_histogram_vec!(
            "kettle_lock_operation_duration_seconds",
            "Lock operation latency in seconds",
            &["op"],
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
        )?,
    };

    let protocol = ProtocolMetrics {
        broadcasts: register_counter_vec!(
            "kettle_protocol_broadcasts_total",
            "Commands broadcast by kind",
            &["kind"]
        )?,
        responses: register_counter_vec!(
            "kettle_protocol_responses_total",
            "Correlated responses accepted by command kind",
            &["kind"]
        )?,
        dropped: register_counter_vec!(
            "kettle_protocol_dropped_total",
            "Messages dropped by reason",
            &["reason"]
        )?,
        roster_size: register_gauge!(
            "kettle_roster_size",
            "Number of workers currently in the roster"
        )?,
        pruned: register_counter!(
            "kettle_roster_pruned_total",
            "Workers removed from the roster for staleness"
        )?,
    };

    ELECTION_METRICS
        .set(election)
        .map_err(|_| "Election metrics already initialized")?;
    PROTOCOL_METRICS
        .set(protocol)
        .map_err(|_| "Protocol metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    ELECTION_METRICS.get().is_some() && PROTOCOL_METRICS.get().is_some()
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// ============================================================================
// Election
// ============================================================================

/// Publish the current role
pub fn set_master(is_master: bool) {
    if let Some(m) = ELECTION_METRICS.get() {
        m.is_master.set(if is_master { 1.0 } else { 0.0 });
    }
}

/// Record a successful acquire
pub fn record_election_won() {
    if let Some(m) = ELECTION_METRICS.get() {
        m.elections_won.inc();
    }
}

/// Record a demotion from master
pub fn record_leadership_lost(reason: &str) {
    if let Some(m) = ELECTION_METRICS.get() {
        m.leadership_lost.with_label_values(&[reason]).inc();
    }
}

/// Record a failed lock operation (`acquire`, `renew`, `release`)
pub fn record_lock_failure(op: &str) {
    if let Some(m) = ELECTION_METRICS.get() {
        m.lock_failures.with_label_values(&[op]).inc();
    }
}

/// Histogram timer guard that records duration on drop
pub struct MetricsTimer {
    timer: Option<prometheus::HistogramTimer>,
}

impl MetricsTimer {
    fn new(timer: prometheus::HistogramTimer) -> Self {
        Self { timer: Some(timer) }
    }

    /// Create a no-op timer when metrics are not initialized
    fn noop() -> Self {
        Self { timer: None }
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_record();
        }
    }
}

/// Start timing a lock operation
pub fn start_lock_timer(op: &str) -> MetricsTimer {
    match ELECTION_METRICS.get() {
        Some(m) => MetricsTimer::new(m.lock_duration.with_label_values(&[op]).start_timer()),
        None => MetricsTimer::noop(),
    }
}

// ============================================================================
// Protocol
// ============================================================================

/// Record a broadcast
pub fn record_broadcast(kind: &str) {
    if let Some(m) = PROTOCOL_METRICS.get() {
        m.broadcasts.with_label_values(&[kind]).inc();
    }
}

/// Record the responses accepted at the end of a collection window
pub fn record_responses(kind: &str, count: usize) {
    let Some(m) = PROTOCOL_METRICS.get() else {
        return;
    };

    if count > 0 {
        m.responses.with_label_values(&[kind]).inc_by(count as f64);
    }
}

/// Record a discarded message
pub fn record_dropped(reason: &str) {
    if let Some(m) = PROTOCOL_METRICS.get() {
        m.dropped.with_label_values(&[reason]).inc();
    }
}

/// Publish the roster size
pub fn set_roster_size(size: usize) {
    if let Some(m) = PROTOCOL_METRICS.get() {
        m.roster_size.set(size as f64);
    }
}

/// Record workers pruned for staleness
pub fn record_pruned(count: usize) {
    let Some(m) = PROTOCOL_METRICS.get() else {
        return;
    };

    if count > 0 {
        m.pruned.inc_by(count as f64);
    }
}

// ============================================================================
// Tests
// ============================================================================
