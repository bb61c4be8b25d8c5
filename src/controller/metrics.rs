//! Prometheus metrics for the Cassandra operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `cassandra_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `cassandra_reconcile_outcomes_total` (counter): pass outcomes labeled by controller and outcome.
//! - `cassandra_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `cassandra_decommissions_started_total` / `cassandra_decommissions_completed_total` (counter): labeled by namespace/datacenter/rack.
//! - `cassandra_emm_actions_total` (counter): EMM actions labeled by namespace/datacenter/action.
//! - `cassandra_node_replacements_total` (counter): node replacements started, labeled by namespace/datacenter.

use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "cassandradatacenter"
    pub controller: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub controller: String,
    /// "done", "requeue" or "error"
    pub outcome: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RackLabels {
    pub namespace: String,
    pub datacenter: String,
    pub rack: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EmmLabels {
    pub namespace: String,
    pub datacenter: String,
    pub action: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DatacenterLabels {
    pub namespace: String,
    pub datacenter: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static RECONCILE_OUTCOMES_TOTAL: Lazy<Family<OutcomeLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static DECOMMISSIONS_STARTED_TOTAL: Lazy<Family<RackLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static DECOMMISSIONS_COMPLETED_TOTAL: Lazy<Family<RackLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static EMM_ACTIONS_TOTAL: Lazy<Family<EmmLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static NODE_REPLACEMENTS_TOTAL: Lazy<Family<DatacenterLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "cassandra_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "cassandra_reconcile_outcomes",
        "Reconcile passes by outcome",
        RECONCILE_OUTCOMES_TOTAL.clone(),
    );
    registry.register(
        "cassandra_reconcile_errors",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "cassandra_decommissions_started",
        "Node decommissions started",
        DECOMMISSIONS_STARTED_TOTAL.clone(),
    );
    registry.register(
        "cassandra_decommissions_completed",
        "Node decommissions confirmed and cleaned up",
        DECOMMISSIONS_COMPLETED_TOTAL.clone(),
    );
    registry.register(
        "cassandra_emm_actions",
        "Actions taken in response to host maintenance taints",
        EMM_ACTIONS_TOTAL.clone(),
    );
    registry.register(
        "cassandra_node_replacements",
        "Node replacements started",
        NODE_REPLACEMENTS_TOTAL.clone(),
    );

    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

pub fn inc_reconcile_outcome(controller: &str, outcome: &str) {
    let labels = OutcomeLabels {
        controller: controller.to_string(),
        outcome: outcome.to_string(),
    };
    RECONCILE_OUTCOMES_TOTAL.get_or_create(&labels).inc();
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

fn rack_labels(namespace: &str, datacenter: &str, rack: &str) -> RackLabels {
    RackLabels {
        namespace: namespace.to_string(),
        datacenter: datacenter.to_string(),
        rack: rack.to_string(),
    }
}

pub fn inc_decommission_started(namespace: &str, datacenter: &str, rack: &str) {
    DECOMMISSIONS_STARTED_TOTAL
        .get_or_create(&rack_labels(namespace, datacenter, rack))
        .inc();
}

pub fn inc_decommission_completed(namespace: &str, datacenter: &str, rack: &str) {
    DECOMMISSIONS_COMPLETED_TOTAL
        .get_or_create(&rack_labels(namespace, datacenter, rack))
        .inc();
}

pub fn inc_emm_action(namespace: &str, datacenter: &str, action: &str) {
    let labels = EmmLabels {
        namespace: namespace.to_string(),
        datacenter: datacenter.to_string(),
        action: action.to_string(),
    };
    EMM_ACTIONS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_node_replacement(namespace: &str, datacenter: &str) {
    let labels = DatacenterLabels {
        namespace: namespace.to_string(),
        datacenter: datacenter.to_string(),
    };
    NODE_REPLACEMENTS_TOTAL.get_or_create(&labels).inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_registry_exports_decommission_counters() {
        inc_decommission_started("db", "dc1", "r1");
        inc_decommission_completed("db", "dc1", "r1");

        let mut buffer = String::new();
        encode(&mut buffer, &REGISTRY).unwrap();
        assert!(buffer.contains("cassandra_decommissions_started_total"));
        assert!(buffer.contains("rack=\"r1\""));
    }
}
