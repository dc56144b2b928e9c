//! MachineHealthCheck Custom Resource Definition
//!
//! A MachineHealthCheck selects machines of one cluster by label and
//! declares when their nodes count as unhealthy.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::duration::Duration;

/// Node startup timeout applied when the spec leaves it unset
pub const DEFAULT_NODE_STARTUP_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Lower bound accepted for `nodeStartupTimeout`
pub const MIN_NODE_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// The MachineHealthCheck CRD declares health criteria for the machines of a cluster.
///
/// # Example
///
/// ```yaml
/// apiVersion: cluster.x-k8s.io/v1alpha3
/// kind: MachineHealthCheck
/// metadata:
///   name: workers
///   namespace: default
/// spec:
///   clusterName: prod
///   selector:
///     matchLabels:
///       nodepool: workers
///   nodeStartupTimeout: 10m
///   unhealthyConditions:
///     - type: Ready
///       status: Unknown
///       timeout: 300s
///     - type: Ready
///       status: "False"
///       timeout: 300s
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1alpha3",
    kind = "MachineHealthCheck",
    namespaced,
    status = "MachineHealthCheckStatus",
    shortname = "mhc",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"Expected","type":"integer","jsonPath":".status.expectedMachines"}"#,
    printcolumn = r#"{"name":"Healthy","type":"integer","jsonPath":".status.currentHealthy"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineHealthCheckSpec {
    /// Name of the Cluster this health check belongs to
    pub cluster_name: String,

    /// Label selector matching the machines to watch
    #[serde(default)]
    #[schemars(with = "serde_json::Value")]
    pub selector: LabelSelector,

    /// Conditions that, when held by a node for longer than their timeout,
    /// mark the node's machine unhealthy. Evaluated in order.
    #[serde(default)]
    pub unhealthy_conditions: Vec<UnhealthyCondition>,

    /// Maximum time a machine may take to get a node (default: 10m)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_startup_timeout: Option<Duration>,
}

/// A node condition type/status pair that counts as unhealthy after a timeout
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UnhealthyCondition {
    /// Node condition type (e.g., "Ready")
    #[serde(rename = "type")]
    pub type_: String,

    /// Node condition status: "True", "False", or "Unknown"
    pub status: String,

    /// How long the condition may hold before the machine is unhealthy
    pub timeout: Duration,
}

impl MachineHealthCheckSpec {
    /// Effective node startup timeout
    pub fn node_startup_timeout(&self) -> std::time::Duration {
        self.node_startup_timeout
            .unwrap_or(DEFAULT_NODE_STARTUP_TIMEOUT)
            .as_std()
    }

    /// Validate the spec
    pub fn validate(&self) -> Result<(), String> {
        if self.cluster_name.trim().is_empty() {
            return Err("clusterName must not be empty".to_string());
        }

        let selector_empty = self
            .selector
            .match_labels
            .as_ref()
            .map_or(true, BTreeMap::is_empty)
            && self
                .selector
                .match_expressions
                .as_ref()
                .map_or(true, Vec::is_empty);
        if selector_empty {
            return Err("selector must not be empty".to_string());
        }

        if self.unhealthy_conditions.is_empty() {
            return Err("unhealthyConditions must contain at least one condition".to_string());
        }

        for (i, condition) in self.unhealthy_conditions.iter().enumerate() {
            if condition.type_.trim().is_empty() {
                return Err(format!("unhealthyConditions[{}].type must not be empty", i));
            }
            if !matches!(condition.status.as_str(), "True" | "False" | "Unknown") {
                return Err(format!(
                    "unhealthyConditions[{}].status must be True, False or Unknown",
                    i
                ));
            }
        }

        if let Some(timeout) = self.node_startup_timeout {
            if timeout < MIN_NODE_STARTUP_TIMEOUT {
                return Err(format!(
                    "nodeStartupTimeout must be at least {}",
                    MIN_NODE_STARTUP_TIMEOUT
                ));
            }
        }

        Ok(())
    }
}

/// Status subresource for MachineHealthCheck
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineHealthCheckStatus {
    /// Number of machines matched by the selector in the last pass
    #[serde(default)]
    pub expected_machines: i32,

    /// Number of matched machines found healthy in the last pass
    #[serde(default)]
    pub current_healthy: i32,

    /// Generation observed by the last pass
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Names of the machines matched in the last pass. Always serialized
    /// so a merge patch clears a previously recorded list.
    #[serde(default)]
    pub targets: Vec<String>,
}
