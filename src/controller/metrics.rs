//! Prometheus metrics for the Talos bootstrap operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `talos_bootstrap_attempts_total` (counter): bootstrap RPC attempts labeled by node.
//! - `talos_bootstrap_outcomes_total` (counter): finished create calls labeled by node and outcome.
//! - `talos_bootstrap_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `talos_bootstrap_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for per-node bootstrap attempts
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NodeLabels {
    pub node: String,
}

/// Labels for bootstrap outcomes
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub node: String,
    /// "success" or an error kind such as "timeout" or "config"
    pub outcome: String,
}

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "machinebootstrap"
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Controller name, e.g. "machinebootstrap"
    pub controller: String,
    /// Error kind/category, e.g. "kube", "timeout", "config"
    pub kind: String,
}

/// Counter tracking individual bootstrap RPC attempts
pub static BOOTSTRAP_ATTEMPTS_TOTAL: Lazy<Family<NodeLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Counter tracking how create calls ended
pub static BOOTSTRAP_OUTCOMES_TOTAL: Lazy<Family<OutcomeLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 10ms .. ~40min across 18 buckets; a create may run for the whole timeout
        Histogram::new(exponential_buckets(0.01, 2.0, 18))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "talos_bootstrap_attempts",
        "Bootstrap RPC attempts issued against a node",
        BOOTSTRAP_ATTEMPTS_TOTAL.clone(),
    );
    registry.register(
        "talos_bootstrap_outcomes",
        "Finished bootstrap creates by outcome",
        BOOTSTRAP_OUTCOMES_TOTAL.clone(),
    );

    registry.register(
        "talos_bootstrap_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "talos_bootstrap_reconcile_errors",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );

    registry
});

/// Count one bootstrap RPC attempt.
pub fn inc_bootstrap_attempt(node: &str) {
    let labels = NodeLabels {
        node: node.to_string(),
    };
    BOOTSTRAP_ATTEMPTS_TOTAL.get_or_create(&labels).inc();
}

/// Record how a create call ended.
pub fn inc_bootstrap_outcome(node: &str, outcome: &str) {
    let labels = OutcomeLabels {
        node: node.to_string(),
        outcome: outcome.to_string(),
    };
    BOOTSTRAP_OUTCOMES_TOTAL.get_or_create(&labels).inc();
}

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}
