//! Mapping of watched objects to the MachineHealthChecks they affect
//!
//! Clusters, Machines and workload-cluster Nodes are not owned by a
//! MachineHealthCheck, so their changes are translated into reconcile
//! requests through the secondary indexes. Routing never fails: malformed
//! objects and ambiguous lookups are logged and produce no requests.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use tracing::{debug, warn};

use super::cluster_watch::ClusterKey;
use super::index::IndexManager;
use super::targets::has_matching_labels;
use crate::crd::{Cluster, Machine, MachineHealthCheck};

/// An object whose change may affect MachineHealthChecks
#[derive(Clone, Copy, Debug)]
pub enum WatchedObject<'a> {
    Cluster(&'a Cluster),
    Machine(&'a Machine),
    /// A node of the workload cluster `cluster`
    Node {
        cluster: &'a ClusterKey,
        node: &'a Node,
    },
}

/// Translates object changes into reconcile requests
pub struct EventRouter {
    index: Arc<IndexManager>,
}

impl EventRouter {
    pub fn new(index: Arc<IndexManager>) -> Self {
        Self { index }
    }

    pub fn route(&self, obj: WatchedObject<'_>) -> Vec<ObjectRef<MachineHealthCheck>> {
        match obj {
            WatchedObject::Cluster(cluster) => self.cluster_to_health_checks(cluster),
            WatchedObject::Machine(machine) => self.machine_to_health_checks(machine),
            WatchedObject::Node { cluster, node } => self.node_to_health_checks(cluster, node),
        }
    }

    /// All MachineHealthChecks of the cluster
    pub fn cluster_to_health_checks(&self, cluster: &Cluster) -> Vec<ObjectRef<MachineHealthCheck>> {
        let (Some(namespace), Some(name)) = (cluster.namespace(), cluster.meta().name.as_deref())
        else {
            warn!("Ignoring Cluster without namespace or name");
            return Vec::new();
        };

        self.index
            .health_checks_for_cluster(&namespace, name)
            .iter()
            .map(|mhc| ObjectRef::from_obj(mhc.as_ref()))
            .collect()
    }

    /// MachineHealthChecks of the machine's cluster whose selector matches it
    pub fn machine_to_health_checks(&self, machine: &Machine) -> Vec<ObjectRef<MachineHealthCheck>> {
        let (Some(namespace), Some(_)) = (machine.namespace(), machine.meta().name.as_deref())
        else {
            warn!("Ignoring Machine without namespace or name");
            return Vec::new();
        };

        self.index
            .health_checks_for_cluster(&namespace, &machine.spec.cluster_name)
            .iter()
            .filter(|mhc| has_matching_labels(mhc, machine))
            .map(|mhc| ObjectRef::from_obj(mhc.as_ref()))
            .collect()
    }

    /// MachineHealthChecks covering the machine that became `node`.
    ///
    /// Exactly one machine of `cluster` must reference the node.
    pub fn node_to_health_checks(
        &self,
        cluster: &ClusterKey,
        node: &Node,
    ) -> Vec<ObjectRef<MachineHealthCheck>> {
        let Some(node_name) = node.meta().name.as_deref() else {
            warn!("Ignoring Node without name in cluster {}", cluster);
            return Vec::new();
        };

        let machines: Vec<_> = self
            .index
            .machines_for_node(node_name)
            .into_iter()
            .filter(|m| {
                m.namespace().as_deref() == Some(cluster.namespace.as_str())
                    && m.spec.cluster_name == cluster.name
            })
            .collect();

        match machines.as_slice() {
            [machine] => self.machine_to_health_checks(machine),
            [] => {
                debug!("No machine found for node {} in cluster {}", node_name, cluster);
                Vec::new()
            }
            _ => {
                warn!(
                    "Node {} in cluster {} is referenced by {} machines, ignoring",
                    node_name,
                    cluster,
                    machines.len()
                );
                Vec::new()
            }
        }
    }
}
