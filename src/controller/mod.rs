//! Controller module for MachineHealthCheck reconciliation
//!
//! This module contains the main controller loop, the secondary indexes
//! and node watches feeding it, and the health evaluation of machines.

pub mod cluster_watch;
mod events;
mod health;
pub mod index;
pub mod metrics;
mod reconciler;
#[cfg(test)]
mod reconciler_test;
mod remediation;
pub mod remote;
pub mod router;
mod targets;
#[cfg(test)]
mod test_fixtures;

pub use cluster_watch::{ClusterKey, ClusterWatchRegistry, NodeWatch, NodeWatchFactory, RemoteNodeWatcher};
pub use health::{check_target, evaluate, min_positive, HealthAssessment, TargetHealth, UnhealthyReason};
pub use index::{IndexManager, IndexStreams, NamespacedName};
pub use reconciler::{calculate_backoff, run_controller, ControllerState};
pub use remediation::MACHINE_MARKED_UNHEALTHY;
pub use router::{EventRouter, WatchedObject};
pub use targets::{has_matching_labels, resolve_targets, Target};
