//! Prometheus metrics for the machine health operator

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicI64;

/// Labels identifying a MachineHealthCheck and its cluster
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HealthCheckLabels {
    pub namespace: String,
    pub name: String,
    pub cluster: String,
}

/// Labels identifying a MachineHealthCheck
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ObjectLabels {
    pub namespace: String,
    pub name: String,
}

/// Gauge tracking the number of machines selected per health check
pub static EXPECTED_MACHINES: Lazy<Family<HealthCheckLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Gauge tracking the number of healthy machines per health check
pub static CURRENT_HEALTHY: Lazy<Family<HealthCheckLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Machines marked unhealthy
pub static REMEDIATIONS: Lazy<Family<HealthCheckLabels, Counter>> = Lazy::new(Family::default);

/// Failed reconciliation passes
pub static RECONCILE_ERRORS: Lazy<Family<ObjectLabels, Counter>> = Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();
    registry.register(
        "machine_health_check_expected_machines",
        "Number of machines selected by the MachineHealthCheck",
        EXPECTED_MACHINES.clone(),
    );
    registry.register(
        "machine_health_check_current_healthy",
        "Number of healthy machines selected by the MachineHealthCheck",
        CURRENT_HEALTHY.clone(),
    );
    // Counters get the `_total` suffix on export
    registry.register(
        "machine_health_check_remediations",
        "Machines marked unhealthy by the MachineHealthCheck",
        REMEDIATIONS.clone(),
    );
    registry.register(
        "machine_health_check_reconcile_errors",
        "Failed reconciliations of the MachineHealthCheck",
        RECONCILE_ERRORS.clone(),
    );
    registry
});

fn labels(namespace: &str, name: &str, cluster: &str) -> HealthCheckLabels {
    HealthCheckLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
        cluster: cluster.to_string(),
    }
}

/// Record the outcome of a reconciliation pass
pub fn set_machine_counts(
    namespace: &str,
    name: &str,
    cluster: &str,
    expected: usize,
    healthy: usize,
) {
    let labels = labels(namespace, name, cluster);
    EXPECTED_MACHINES
        .get_or_create(&labels)
        .set(i64::try_from(expected).unwrap_or(i64::MAX));
    CURRENT_HEALTHY
        .get_or_create(&labels)
        .set(i64::try_from(healthy).unwrap_or(i64::MAX));
}

pub fn inc_remediations(namespace: &str, name: &str, cluster: &str) {
    REMEDIATIONS
        .get_or_create(&labels(namespace, name, cluster))
        .inc();
}

pub fn inc_reconcile_errors(namespace: &str, name: &str) {
    RECONCILE_ERRORS
        .get_or_create(&ObjectLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
        .inc();
}

/// Drop every series of a deleted MachineHealthCheck
pub fn remove_health_check(namespace: &str, name: &str, cluster: &str) {
    let labels = labels(namespace, name, cluster);
    EXPECTED_MACHINES.remove(&labels);
    CURRENT_HEALTHY.remove(&labels);
    REMEDIATIONS.remove(&labels);
    RECONCILE_ERRORS.remove(&ObjectLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
    });
}
