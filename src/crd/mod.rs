//! Custom Resource Definitions for the machine health operator
//!
//! This module defines the MachineHealthCheck CRD owned by the operator and
//! the Cluster and Machine resources it reads.

mod cluster;
pub mod duration;
mod machine_health_check;

use kube::{Resource, ResourceExt};

pub use cluster::{Cluster, ClusterSpec, Machine, MachineSpec, MachineStatus};
pub use duration::Duration;
pub use machine_health_check::{
    MachineHealthCheck, MachineHealthCheckSpec, MachineHealthCheckStatus, UnhealthyCondition,
    DEFAULT_NODE_STARTUP_TIMEOUT, MIN_NODE_STARTUP_TIMEOUT,
};

/// Label carrying the name of the cluster an object belongs to
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Annotation pausing reconciliation of the annotated object
pub const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";

/// Whether an object carries the paused annotation
pub fn has_paused_annotation<K: Resource>(obj: &K) -> bool {
    obj.annotations().contains_key(PAUSED_ANNOTATION)
}

/// Whether reconciliation of `obj` is paused by itself or by its cluster
pub fn is_paused<K: Resource>(cluster: &Cluster, obj: &K) -> bool {
    cluster.spec.paused || has_paused_annotation(cluster) || has_paused_annotation(obj)
}
