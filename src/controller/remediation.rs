//! Reporting of machines that need remediation
//!
//! The operator only detects unhealthy machines. Each one is reported
//! as a Warning event on the MachineHealthCheck that selected it and
//! counted in the remediation metric. Replacing the machine is left to
//! the component owning it.

use kube::{Client, ResourceExt};
use tracing::{info, warn};

use super::events;
use super::health::UnhealthyReason;
use super::metrics;
use super::targets::Target;
use crate::crd::MachineHealthCheck;
use crate::error::Result;

/// Event reason for a machine found unhealthy
pub const MACHINE_MARKED_UNHEALTHY: &str = "MachineMarkedUnhealthy";

/// Human readable description of why the target's machine is unhealthy
pub fn unhealthy_message(target: &Target, reason: &UnhealthyReason) -> String {
    match target.node_name() {
        Some(node) => format!(
            "Machine {} (node {}) has been marked as unhealthy: {}",
            target.machine_name(),
            node,
            reason
        ),
        None => format!(
            "Machine {} has been marked as unhealthy: {}",
            target.machine_name(),
            reason
        ),
    }
}

/// Report a target that needs remediation. Repeated reports of the same
/// machine update one event.
pub async fn mark_unhealthy(
    client: &Client,
    mhc: &MachineHealthCheck,
    target: &Target,
    reason: &UnhealthyReason,
) -> Result<()> {
    let namespace = mhc.namespace().unwrap_or_else(|| "default".to_string());
    warn!("Target {} needs remediation: {}", target, reason);
    metrics::inc_remediations(&namespace, &mhc.name_any(), &mhc.spec.cluster_name);

    let machine = target.machine_name();
    events::publish_warning(
        client,
        mhc,
        Some(&machine),
        MACHINE_MARKED_UNHEALTHY,
        &unhealthy_message(target, reason),
    )
    .await?;

    info!(
        "Emitted {} event for machine {}",
        MACHINE_MARKED_UNHEALTHY, machine
    );
    Ok(())
}
