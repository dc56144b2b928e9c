//! Health evaluation for MachineHealthCheck targets
//!
//! Each target is classified at a point in time as:
//!
//! - **Healthy** - no unhealthy condition holds on its node
//! - **Unhealthy** - the machine needs remediation
//! - **Pending** - a condition (or missing node) may still resolve; the
//!   target must be checked again once its timeout elapses
//!
//! # Health Assessment
//!
//! [`evaluate`] folds the per-target results into a [`HealthAssessment`]
//! holding the healthy count, the targets to remediate, and the durations
//! after which pending targets become decidable.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use tracing::debug;

use super::targets::Target;
use crate::crd::{MachineHealthCheck, UnhealthyCondition};

/// Why a target needs remediation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnhealthyReason {
    /// The machine reported a terminal failure
    MachineFailed(String),
    /// The machine did not get a node within the startup timeout
    NodeStartupTimeout(Duration),
    /// The node the machine references does not exist
    NodeNotFound(String),
    /// A node condition held for longer than its timeout
    ConditionTimeout {
        type_: String,
        status: String,
        timeout: Duration,
    },
}

impl fmt::Display for UnhealthyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnhealthyReason::MachineFailed(failure) => write!(f, "machine failed: {}", failure),
            UnhealthyReason::NodeStartupTimeout(timeout) => {
                write!(f, "no node after {}s", timeout.as_secs())
            }
            UnhealthyReason::NodeNotFound(node) => write!(f, "node {} not found", node),
            UnhealthyReason::ConditionTimeout {
                type_,
                status,
                timeout,
            } => write!(
                f,
                "condition {}={} for more than {}s",
                type_,
                status,
                timeout.as_secs()
            ),
        }
    }
}

/// Health of a single target
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetHealth {
    Healthy,
    Unhealthy(UnhealthyReason),
    /// Not decidable yet; decidable after `recheck_in`
    Pending { recheck_in: Duration },
}

impl TargetHealth {
    fn pending(timeout: Duration, elapsed: Duration) -> Self {
        TargetHealth::Pending {
            recheck_in: timeout.saturating_sub(elapsed),
        }
    }
}

/// Aggregated health of all targets of one MachineHealthCheck
#[derive(Clone, Debug, Default)]
pub struct HealthAssessment {
    /// Number of healthy targets
    pub healthy: usize,

    /// Targets needing remediation, with the reason
    pub remediation: Vec<(Target, UnhealthyReason)>,

    /// Remaining time until each pending target becomes decidable
    pub next_checks: Vec<Duration>,
}

impl HealthAssessment {
    /// Delay until the next scheduled check: the smallest positive
    /// pending duration, or `None` when nothing is pending
    pub fn next_check(&self) -> Option<Duration> {
        min_positive(&self.next_checks)
    }
}

/// Smallest non-zero duration in `durations`
pub fn min_positive(durations: &[Duration]) -> Option<Duration> {
    durations.iter().copied().filter(|d| !d.is_zero()).min()
}

/// Time elapsed from `since` to `now`, clamped at zero
fn elapsed_since(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(since)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

fn matching_condition<'a>(
    node: &'a Node,
    rule: &UnhealthyCondition,
) -> Option<&'a k8s_openapi::api::core::v1::NodeCondition> {
    node.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == rule.type_ && c.status == rule.status)
}

/// Classify one target at `now`
pub fn check_target(
    target: &Target,
    rules: &[UnhealthyCondition],
    node_startup_timeout: Duration,
    now: DateTime<Utc>,
) -> TargetHealth {
    if let Some(failure) = target.machine.failure() {
        return TargetHealth::Unhealthy(UnhealthyReason::MachineFailed(failure));
    }

    if target.node_missing {
        let node = target.node_name().unwrap_or_default().to_string();
        return TargetHealth::Unhealthy(UnhealthyReason::NodeNotFound(node));
    }

    let Some(node) = target.node.as_deref() else {
        let age = target
            .machine
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|created| elapsed_since(created.0, now))
            .unwrap_or(Duration::ZERO);

        if age >= node_startup_timeout {
            return TargetHealth::Unhealthy(UnhealthyReason::NodeStartupTimeout(
                node_startup_timeout,
            ));
        }
        return TargetHealth::pending(node_startup_timeout, age);
    };

    for rule in rules {
        let Some(condition) = matching_condition(node, rule) else {
            continue;
        };

        let timeout = rule.timeout.as_std();
        let elapsed = condition
            .last_transition_time
            .as_ref()
            .map(|since| elapsed_since(since.0, now))
            .unwrap_or(Duration::ZERO);

        if elapsed >= timeout {
            return TargetHealth::Unhealthy(UnhealthyReason::ConditionTimeout {
                type_: rule.type_.clone(),
                status: rule.status.clone(),
                timeout,
            });
        }
        return TargetHealth::pending(timeout, elapsed);
    }

    TargetHealth::Healthy
}

/// Evaluate all targets of `mhc` at `now`
pub fn evaluate(targets: &[Target], mhc: &MachineHealthCheck, now: DateTime<Utc>) -> HealthAssessment {
    let startup_timeout = mhc.spec.node_startup_timeout();
    let mut assessment = HealthAssessment::default();

    for target in targets {
        match check_target(target, &mhc.spec.unhealthy_conditions, startup_timeout, now) {
            TargetHealth::Healthy => assessment.healthy += 1,
            TargetHealth::Unhealthy(reason) => {
                debug!("Target {} is unhealthy: {}", target, reason);
                assessment.remediation.push((target.clone(), reason));
            }
            TargetHealth::Pending { recheck_in } => {
                debug!("Target {} may go unhealthy in {:?}", target, recheck_in);
                assessment.next_checks.push(recheck_in);
            }
        }
    }

    assessment
}
