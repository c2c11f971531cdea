//! Prometheus metrics for the reconciliation mothership
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports:
//! - `mothership_clusters_enqueued_total` (counter): clusters pushed onto the work queue.
//! - `mothership_inventory_query_failures_total` (counter): failed discovery ticks.
//! - `mothership_stale_snapshots_skipped_total` (counter): queued clusters dropped by the
//!   dispatcher because a newer status entry or configuration exists.
//! - `mothership_operation_transitions_total` (counter): operation transitions labeled by state.
//! - `mothership_cluster_reconciliations_total` (counter): finished runs labeled by result.
//! - `mothership_cluster_reconciliation_duration_seconds` (histogram): run duration by result.
//! - `mothership_progress_watches_total` (counter): progress watches labeled by outcome.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    /// Target state of the transition, e.g. "running", "success"
    pub state: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconciliationLabels {
    /// Cluster status written at the end of the run
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProgressLabels {
    /// "converged", "cancelled" or "deadline_exceeded"
    pub outcome: String,
}

pub static CLUSTERS_ENQUEUED_TOTAL: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);

pub static INVENTORY_QUERY_FAILURES_TOTAL: Lazy<Counter<u64, AtomicU64>> =
    Lazy::new(Counter::default);

pub static STALE_SNAPSHOTS_SKIPPED_TOTAL: Lazy<Counter<u64, AtomicU64>> =
    Lazy::new(Counter::default);

pub static OPERATION_TRANSITIONS_TOTAL: Lazy<Family<OperationLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static CLUSTER_RECONCILIATIONS_TOTAL: Lazy<
    Family<ReconciliationLabels, Counter<u64, AtomicU64>>,
> = Lazy::new(Family::default);

/// Histogram tracking how long one cluster run took (seconds)
pub static CLUSTER_RECONCILIATION_DURATION_SECONDS: Lazy<Family<ReconciliationLabels, Histogram>> =
    Lazy::new(|| {
        fn run_histogram() -> Histogram {
            // 100ms .. ~55min across 16 buckets
            Histogram::new(exponential_buckets(0.1, 2.0, 16))
        }
        Family::new_with_constructor(run_histogram)
    });

pub static PROGRESS_WATCHES_TOTAL: Lazy<Family<ProgressLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "mothership_clusters_enqueued",
        "Clusters pushed onto the reconciliation queue",
        CLUSTERS_ENQUEUED_TOTAL.clone(),
    );
    registry.register(
        "mothership_inventory_query_failures",
        "Discovery ticks whose inventory query failed",
        INVENTORY_QUERY_FAILURES_TOTAL.clone(),
    );
    registry.register(
        "mothership_stale_snapshots_skipped",
        "Queued clusters skipped because their snapshot was superseded",
        STALE_SNAPSHOTS_SKIPPED_TOTAL.clone(),
    );
    registry.register(
        "mothership_operation_transitions",
        "Operation state transitions",
        OPERATION_TRANSITIONS_TOTAL.clone(),
    );
    registry.register(
        "mothership_cluster_reconciliations",
        "Finished cluster reconciliation runs",
        CLUSTER_RECONCILIATIONS_TOTAL.clone(),
    );
    registry.register(
        "mothership_cluster_reconciliation_duration_seconds",
        "Duration of cluster reconciliation runs in seconds",
        CLUSTER_RECONCILIATION_DURATION_SECONDS.clone(),
    );
    registry.register(
        "mothership_progress_watches",
        "Progress tracker watches by outcome",
        PROGRESS_WATCHES_TOTAL.clone(),
    );

    registry
});

pub fn inc_clusters_enqueued() {
    CLUSTERS_ENQUEUED_TOTAL.inc();
}

pub fn inc_inventory_query_failures() {
    INVENTORY_QUERY_FAILURES_TOTAL.inc();
}

pub fn inc_stale_snapshots_skipped() {
    STALE_SNAPSHOTS_SKIPPED_TOTAL.inc();
}

pub fn inc_operation_transition(state: &str) {
    let labels = OperationLabels {
        state: state.to_string(),
    };
    OPERATION_TRANSITIONS_TOTAL.get_or_create(&labels).inc();
}

/// Count a finished cluster run and record its duration
pub fn observe_cluster_reconciliation(result: &str, seconds: f64) {
    let labels = ReconciliationLabels {
        result: result.to_string(),
    };
    CLUSTER_RECONCILIATIONS_TOTAL.get_or_create(&labels).inc();
    CLUSTER_RECONCILIATION_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

pub fn inc_progress_watch(outcome: &str) {
    let labels = ProgressLabels {
        outcome: outcome.to_string(),
    };
    PROGRESS_WATCHES_TOTAL.get_or_create(&labels).inc();
}
