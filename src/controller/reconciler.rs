//! Core reconciliation logic for MachineHealthChecks
//!
//! Every pass recomputes the health of all machines a MachineHealthCheck
//! selects from the cached machines and the workload cluster's nodes,
//! then persists owner reference, labels and status in one final step.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::channel::mpsc::UnboundedReceiver;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::{Action, Config as ControllerConfig, Controller},
        reflector::{ObjectRef, Store},
        watcher::Config,
    },
    Resource, ResourceExt,
};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use super::cluster_watch::{ClusterKey, ClusterWatchRegistry};
use super::events;
use super::health::{self, HealthAssessment};
use super::index::{scoped_api, IndexManager, IndexStreams};
use super::metrics;
use super::remediation;
use super::router::{EventRouter, WatchedObject};
use super::targets::{self, Target};
use crate::config::OperatorConfig;
use crate::crd::{
    is_paused, Cluster, Machine, MachineHealthCheck, MachineHealthCheckStatus, CLUSTER_NAME_LABEL,
};
use crate::error::{Error, Result};

/// Field manager of the operator's patches
const FIELD_MANAGER: &str = "machine-health-operator";

/// Event reason for a failed reconciliation pass
pub const RECONCILE_ERROR_REASON: &str = "ReconcileError";

/// Retry delay of a pass that ran before the indexes were synced
const CACHE_SYNC_RETRY: Duration = Duration::from_secs(5);

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub index: Arc<IndexManager>,
    pub watches: Arc<ClusterWatchRegistry>,
    pub config: Arc<OperatorConfig>,
    /// Consecutive failed passes per MachineHealthCheck
    failures: Mutex<HashMap<ObjectRef<MachineHealthCheck>, u32>>,
    ready: AtomicBool,
}

impl ControllerState {
    pub fn new(
        client: Client,
        index: Arc<IndexManager>,
        watches: Arc<ClusterWatchRegistry>,
        config: Arc<OperatorConfig>,
    ) -> Self {
        Self {
            client,
            index,
            watches,
            config,
            failures: Mutex::new(HashMap::new()),
            ready: AtomicBool::new(false),
        }
    }

    /// Whether the indexes have completed their initial list
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
    }

    /// Count a failed pass; returns the number of failures before it
    pub(crate) fn record_failure(&self, obj: &ObjectRef<MachineHealthCheck>) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(obj.clone()).or_insert(0);
        let attempt = *count;
        *count = count.saturating_add(1);
        attempt
    }

    fn reset_failures(&self, obj: &ObjectRef<MachineHealthCheck>) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(obj);
    }

    /// Drop the retry state and metrics of a deleted MachineHealthCheck
    pub fn forget(&self, mhc: &MachineHealthCheck) {
        debug!("Forgetting deleted MachineHealthCheck {}", mhc.name_any());
        self.reset_failures(&ObjectRef::from_obj(mhc));
        metrics::remove_health_check(
            &mhc.namespace().unwrap_or_default(),
            &mhc.name_any(),
            &mhc.spec.cluster_name,
        );
    }
}

/// Main entry point to start the controller
///
/// The controller is driven by the index watches in `streams`, by its own
/// Cluster watch and by `triggers`, the reconcile requests of the node
/// watches on workload clusters.
pub async fn run_controller(
    state: Arc<ControllerState>,
    router: Arc<EventRouter>,
    streams: IndexStreams,
    triggers: UnboundedReceiver<ObjectRef<MachineHealthCheck>>,
) -> Result<()> {
    let client = state.client.clone();
    let namespace = state.config.namespace.as_deref();
    let health_checks: Api<MachineHealthCheck> = scoped_api(client.clone(), namespace);

    info!("Starting MachineHealthCheck controller");

    // Verify CRD exists
    match health_checks.list(&ListParams::default().limit(1)).await {
        Ok(_) => info!("MachineHealthCheck CRD is available"),
        Err(e) => {
            error!(
                "MachineHealthCheck CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "MachineHealthCheck CRD not installed".to_string(),
            ));
        }
    }

    let IndexStreams {
        health_checks: health_check_stream,
        machines: machine_stream,
        deleted_health_checks,
    } = streams;
    tokio::spawn(forget_deleted(state.clone(), deleted_health_checks));

    let cluster_router = router.clone();
    let machine_router = router;

    Controller::for_shared_stream(health_check_stream, state.index.health_checks().clone())
        .with_config(ControllerConfig::default().concurrency(state.config.concurrency))
        .watches(
            scoped_api::<Cluster>(client, namespace),
            Config::default(),
            move |cluster| cluster_router.route(WatchedObject::Cluster(&cluster)),
        )
        .watches_shared_stream(machine_stream, move |machine: Arc<Machine>| {
            machine_router.route(WatchedObject::Machine(machine.as_ref()))
        })
        .reconcile_on(triggers)
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => warn!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// Release per-object state of MachineHealthChecks as they are deleted
async fn forget_deleted(
    state: Arc<ControllerState>,
    mut deleted: UnboundedReceiver<MachineHealthCheck>,
) {
    while let Some(mhc) = deleted.next().await {
        state.forget(&mhc);
    }
}

/// The main reconciliation function
///
/// This function is called whenever:
/// - A MachineHealthCheck is created or updated
/// - Its Cluster, one of its Machines, or a Node of a Machine changes
/// - The requeue timer of a pending target expires
#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
pub(crate) async fn reconcile(
    obj: Arc<MachineHealthCheck>,
    ctx: Arc<ControllerState>,
) -> Result<Action> {
    // Targets are only resolved against fully listed caches
    if !ctx.is_ready() {
        debug!("Index caches not synced, retrying in {:?}", CACHE_SYNC_RETRY);
        return Ok(Action::requeue(CACHE_SYNC_RETRY));
    }

    let object_ref = ObjectRef::from_obj(obj.as_ref());
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let name = obj.name_any();
    let api: Api<MachineHealthCheck> = Api::namespaced(ctx.client.clone(), &namespace);

    // The cached copy may be stale; work on the current object
    let Some(mhc) = api.get_opt(&name).await? else {
        debug!("MachineHealthCheck {}/{} no longer exists", namespace, name);
        ctx.reset_failures(&object_ref);
        return Ok(Action::await_change());
    };

    let clusters: Api<Cluster> = Api::namespaced(ctx.client.clone(), &namespace);
    let cluster = clusters
        .get_opt(&mhc.spec.cluster_name)
        .await?
        .ok_or_else(|| Error::NotFound {
            kind: "Cluster".to_string(),
            name: mhc.spec.cluster_name.clone(),
            namespace: namespace.clone(),
        })?;

    if is_paused(&cluster, &mhc) {
        info!(
            "Reconciliation of {}/{} is paused, skipping",
            namespace, name
        );
        ctx.reset_failures(&object_ref);
        return Ok(Action::await_change());
    }

    info!(
        "Reconciling MachineHealthCheck {}/{} (cluster: {})",
        namespace, name, mhc.spec.cluster_name
    );

    if let Err(e) = mhc.spec.validate() {
        warn!("Invalid MachineHealthCheck {}/{}: {}", namespace, name, e);
    }

    let patch = StatusPatch::snapshot(&mhc);
    let mut updated = mhc;
    let result = reconcile_health_check(&ctx, &cluster, &mut updated).await;

    if let Err(e) = &result {
        warn!("Reconciliation of {}/{} failed: {}", namespace, name, e);
        if let Err(event_err) = events::publish_warning(
            &ctx.client,
            &updated,
            None,
            RECONCILE_ERROR_REASON,
            &e.to_string(),
        )
        .await
        {
            warn!("Failed to emit {} event: {}", RECONCILE_ERROR_REASON, event_err);
        }
    }

    // Persist whatever the pass produced, also after a failure
    let persisted = patch.persist(&api, &updated).await;
    let action = Error::merge(result, persisted)?;

    ctx.reset_failures(&object_ref);
    Ok(action)
}

/// Body of a pass: everything between the pause check and persistence
async fn reconcile_health_check(
    ctx: &ControllerState,
    cluster: &Cluster,
    mhc: &mut MachineHealthCheck,
) -> Result<Action> {
    ensure_owner_reference(mhc, cluster)?;
    ensure_cluster_label(mhc, cluster);

    let nodes = ctx.watches.ensure_watch(&ClusterKey::from(cluster)).await?;
    let outcome = assess(mhc, ctx.index.machines(), &nodes, Utc::now());

    let namespace = mhc.namespace().unwrap_or_default();
    debug!(
        "MachineHealthCheck {}/{}: {} targets, {} healthy, {} to remediate",
        namespace,
        mhc.name_any(),
        outcome.targets.len(),
        outcome.assessment.healthy,
        outcome.assessment.remediation.len()
    );
    metrics::set_machine_counts(
        &namespace,
        &mhc.name_any(),
        &mhc.spec.cluster_name,
        outcome.targets.len(),
        outcome.assessment.healthy,
    );

    mhc.status = Some(outcome.status(mhc));

    for (target, reason) in &outcome.assessment.remediation {
        if let Err(e) = remediation::mark_unhealthy(&ctx.client, mhc, target, reason).await {
            warn!("Failed to report unhealthy target {}: {}", target, e);
        }
    }

    Ok(outcome.action())
}

/// Targets of a MachineHealthCheck and their evaluated health
#[derive(Debug)]
pub(crate) struct PassOutcome {
    pub targets: Vec<Target>,
    pub assessment: HealthAssessment,
}

impl PassOutcome {
    /// Status to persist for `mhc`
    pub fn status(&self, mhc: &MachineHealthCheck) -> MachineHealthCheckStatus {
        MachineHealthCheckStatus {
            expected_machines: count(self.targets.len()),
            current_healthy: count(self.assessment.healthy),
            observed_generation: mhc.metadata.generation,
            targets: self.targets.iter().map(Target::machine_name).collect(),
        }
    }

    /// Re-check when the first pending target becomes decidable
    pub fn action(&self) -> Action {
        match self.assessment.next_check() {
            Some(delay) => {
                debug!("Next health check in {:?}", delay);
                Action::requeue(delay)
            }
            None => Action::await_change(),
        }
    }
}

fn count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// Resolve and evaluate the targets of `mhc` at `now`
pub(crate) fn assess(
    mhc: &MachineHealthCheck,
    machines: &Store<Machine>,
    nodes: &Store<Node>,
    now: DateTime<Utc>,
) -> PassOutcome {
    let targets = targets::resolve_targets(machines, nodes, mhc);
    let assessment = health::evaluate(&targets, mhc, now);
    PassOutcome {
        targets,
        assessment,
    }
}

/// Make `cluster` a (non-controller) owner of `mhc`.
///
/// An existing reference with the same UID, or the same kind and name, is
/// replaced.
pub(crate) fn ensure_owner_reference(mhc: &mut MachineHealthCheck, cluster: &Cluster) -> Result<()> {
    let uid = cluster.metadata.uid.clone().ok_or_else(|| {
        Error::ValidationError(format!("Cluster {} has no uid", cluster.name_any()))
    })?;
    let owner = OwnerReference {
        api_version: Cluster::api_version(&()).to_string(),
        kind: Cluster::kind(&()).to_string(),
        name: cluster.name_any(),
        uid,
        controller: Some(false),
        block_owner_deletion: None,
    };

    let references = mhc.metadata.owner_references.get_or_insert_with(Vec::new);
    match references
        .iter_mut()
        .find(|r| r.uid == owner.uid || (r.kind == owner.kind && r.name == owner.name))
    {
        Some(existing) => *existing = owner,
        None => references.push(owner),
    }
    Ok(())
}

/// Label `mhc` with the name of its cluster
pub(crate) fn ensure_cluster_label(mhc: &mut MachineHealthCheck, cluster: &Cluster) {
    mhc.labels_mut()
        .insert(CLUSTER_NAME_LABEL.to_string(), cluster.name_any());
}

/// State of a MachineHealthCheck before a pass, used to patch only what
/// the pass changed
pub(crate) struct StatusPatch {
    labels: Option<BTreeMap<String, String>>,
    owner_references: Option<Vec<OwnerReference>>,
    status: Option<MachineHealthCheckStatus>,
}

impl StatusPatch {
    pub fn snapshot(mhc: &MachineHealthCheck) -> Self {
        Self {
            labels: mhc.metadata.labels.clone(),
            owner_references: mhc.metadata.owner_references.clone(),
            status: mhc.status.clone(),
        }
    }

    /// Merge patch of the changed metadata, if any
    pub fn metadata_patch(&self, updated: &MachineHealthCheck) -> Option<serde_json::Value> {
        let mut metadata = serde_json::Map::new();
        if updated.metadata.labels != self.labels {
            metadata.insert("labels".to_string(), json!(updated.metadata.labels));
        }
        if updated.metadata.owner_references != self.owner_references {
            metadata.insert(
                "ownerReferences".to_string(),
                json!(updated.metadata.owner_references),
            );
        }
        (!metadata.is_empty()).then(|| json!({ "metadata": metadata }))
    }

    /// Merge patch of the status, if it changed
    pub fn status_patch(&self, updated: &MachineHealthCheck) -> Option<serde_json::Value> {
        (updated.status != self.status).then(|| json!({ "status": updated.status }))
    }

    /// Write the changes of `updated` back. Both patches are attempted;
    /// their failures are combined.
    pub async fn persist(
        &self,
        api: &Api<MachineHealthCheck>,
        updated: &MachineHealthCheck,
    ) -> Result<()> {
        let name = updated.name_any();
        let params = PatchParams::apply(FIELD_MANAGER);

        let metadata = match self.metadata_patch(updated) {
            Some(patch) => api
                .patch(&name, &params, &Patch::Merge(&patch))
                .await
                .map(|_| ())
                .map_err(Error::KubeError),
            None => Ok(()),
        };
        let status = match self.status_patch(updated) {
            Some(patch) => api
                .patch_status(&name, &params, &Patch::Merge(&patch))
                .await
                .map(|_| ())
                .map_err(Error::KubeError),
            None => Ok(()),
        };

        Error::merge(metadata, status)
    }
}

/// Exponential retry delay: `base * 2^attempt`, capped at `max`
pub fn calculate_backoff(attempt: u32, base_delay_secs: u64, max_delay_secs: u64) -> Duration {
    let delay_secs = base_delay_secs.saturating_mul(2_u64.saturating_pow(attempt.min(16)));
    Duration::from_secs(delay_secs.min(max_delay_secs))
}

/// Error policy determines how to handle reconciliation errors
fn error_policy(mhc: Arc<MachineHealthCheck>, error: &Error, ctx: Arc<ControllerState>) -> Action {
    let namespace = mhc.namespace().unwrap_or_default();
    metrics::inc_reconcile_errors(&namespace, &mhc.name_any());

    let attempt = ctx.record_failure(&ObjectRef::from_obj(mhc.as_ref()));
    let retry_duration = if error.is_retriable() {
        calculate_backoff(
            attempt,
            ctx.config.backoff_base_secs,
            ctx.config.backoff_max_secs,
        )
    } else {
        Duration::from_secs(ctx.config.backoff_max_secs)
    };

    error!(
        "Reconciliation error for {}/{} (attempt {}), retrying in {:?}: {}",
        namespace,
        mhc.name_any(),
        attempt + 1,
        retry_duration,
        error.status_message()
    );
    Action::requeue(retry_duration)
}
