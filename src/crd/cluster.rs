//! Cluster and Machine resources read by the health check controller
//!
//! Only the fields the controller reads are modelled; everything else the
//! cluster lifecycle controllers keep on these objects is ignored.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A workload cluster managed from this management cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1alpha3",
    kind = "Cluster",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Pause reconciliation of the cluster and everything that belongs to it
    #[serde(default)]
    pub paused: bool,
}

/// A machine of a workload cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1alpha3",
    kind = "Machine",
    namespaced,
    status = "MachineStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Name of the Cluster this machine belongs to
    pub cluster_name: String,
}

/// Observed state of a Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Node of the workload cluster this machine became
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub node_ref: Option<ObjectReference>,

    /// Terminal failure reported by the infrastructure provider
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Human-readable detail of a terminal failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

impl Machine {
    /// Name of the node this machine became, once provisioned
    pub fn node_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.node_ref.as_ref())
            .and_then(|r| r.name.as_deref())
    }

    /// Terminal failure of the machine, if any
    pub fn failure(&self) -> Option<String> {
        let status = self.status.as_ref()?;
        match (&status.failure_reason, &status.failure_message) {
            (Some(reason), Some(message)) => Some(format!("{}: {}", reason, message)),
            (Some(reason), None) => Some(reason.clone()),
            (None, Some(message)) => Some(message.clone()),
            (None, None) => None,
        }
    }
}
