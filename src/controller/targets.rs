//! Target resolution for MachineHealthChecks
//!
//! A target is one machine selected by a health check, paired with the
//! node it became in the workload cluster (if any).

use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use kube::core::{Selector, SelectorExt};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;
use tracing::debug;

use crate::crd::{Machine, MachineHealthCheck};

/// A machine governed by a MachineHealthCheck, with its node
#[derive(Clone, Debug)]
pub struct Target {
    /// `namespace/name` of the governing MachineHealthCheck
    pub health_check: String,
    pub machine: Arc<Machine>,
    pub node: Option<Arc<Node>>,
    /// The machine references a node the workload cluster does not have
    pub node_missing: bool,
}

impl Target {
    pub fn machine_name(&self) -> String {
        self.machine.name_any()
    }

    pub fn node_name(&self) -> Option<&str> {
        self.machine.node_name()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.health_check,
            self.machine.name_any(),
            self.node_name().unwrap_or("")
        )
    }
}

/// Whether the health check's selector matches the machine's labels.
///
/// An empty or unparseable selector matches nothing.
pub fn has_matching_labels(mhc: &MachineHealthCheck, machine: &Machine) -> bool {
    let selector = match Selector::try_from(mhc.spec.selector.clone()) {
        Ok(selector) => selector,
        Err(e) => {
            debug!(
                "Selector of MachineHealthCheck {} cannot be parsed: {}",
                mhc.name_any(),
                e
            );
            return false;
        }
    };
    if selector.selects_all() {
        return false;
    }
    selector.matches(machine.labels())
}

/// Compute the targets of a MachineHealthCheck from cached machines and
/// the workload cluster's cached nodes. Sorted by machine name.
pub fn resolve_targets(
    machines: &Store<Machine>,
    nodes: &Store<Node>,
    mhc: &MachineHealthCheck,
) -> Vec<Target> {
    let namespace = mhc.namespace().unwrap_or_default();
    let health_check = format!("{}/{}", namespace, mhc.name_any());

    let mut selected: Vec<Arc<Machine>> = machines
        .state()
        .into_iter()
        .filter(|m| m.namespace().as_deref() == Some(namespace.as_str()))
        .filter(|m| has_matching_labels(mhc, m))
        .collect();
    selected.sort_by_key(|m| m.name_any());

    selected
        .into_iter()
        .map(|machine| {
            let node = machine
                .node_name()
                .and_then(|name| nodes.get(&ObjectRef::new(name)));
            let node_missing = machine.node_name().is_some() && node.is_none();
            Target {
                health_check: health_check.clone(),
                machine,
                node,
                node_missing,
            }
        })
        .collect()
}
