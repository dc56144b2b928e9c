//! Tests for the reconciliation pass and its persistence

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use http::{Method, StatusCode};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use serde_json::json;

use super::cluster_watch::ClusterWatchRegistry;
use super::index::IndexManager;
use super::reconciler::{
    assess, calculate_backoff, ensure_cluster_label, ensure_owner_reference, reconcile,
    ControllerState, StatusPatch,
};
use super::test_fixtures::{
    api_error, cluster, controller_state, created_at, health_check, machine, machine_store,
    mock_client, node, node_store, not_found, FixedNodeWatches,
};
use crate::config::OperatorConfig;
use crate::crd::{MachineHealthCheckStatus, CLUSTER_NAME_LABEL};
use crate::error::Error;

const MHC_PATH: &str =
    "/apis/cluster.x-k8s.io/v1alpha3/namespaces/default/machinehealthchecks/mhc";
const CLUSTER_PATH: &str = "/apis/cluster.x-k8s.io/v1alpha3/namespaces/default/clusters/c1";
const EVENTS_PATH: &str = "/api/v1/namespaces/default/events";

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out waiting for the API server")
}

#[test]
fn test_backoff_calculation() {
    // Attempt 0: 15 seconds
    assert_eq!(calculate_backoff(0, 15, 300), Duration::from_secs(15));

    // Doubles per attempt
    assert_eq!(calculate_backoff(1, 15, 300), Duration::from_secs(30));
    assert_eq!(calculate_backoff(2, 15, 300), Duration::from_secs(60));
    assert_eq!(calculate_backoff(3, 15, 300), Duration::from_secs(120));
    assert_eq!(calculate_backoff(4, 15, 300), Duration::from_secs(240));

    // Capped at the maximum
    assert_eq!(calculate_backoff(5, 15, 300), Duration::from_secs(300));
    assert_eq!(calculate_backoff(100, 15, 300), Duration::from_secs(300));
}

#[test]
fn test_unhealthy_machine_is_reported_without_requeue() {
    let now = Utc::now();
    let mhc = health_check("default", "mhc", "c1", &[("role", "worker")]);
    let startup = mhc.spec.node_startup_timeout();
    let age = ChronoDuration::from_std(startup * 2).unwrap();

    let machines = machine_store(vec![
        machine("default", "m1", "c1", Some("n1"), &[("role", "worker")]),
        created_at(
            machine("default", "m2", "c1", None, &[("role", "worker")]),
            now - age,
        ),
    ]);
    let nodes = node_store(vec![node(
        "n1",
        &[("Ready", "True", now - ChronoDuration::hours(1))],
    )]);

    let outcome = assess(&mhc, &machines, &nodes, now);
    let status = outcome.status(&mhc);

    assert_eq!(status.expected_machines, 2);
    assert_eq!(status.current_healthy, 1);
    assert_eq!(status.targets, vec!["m1", "m2"]);
    assert_eq!(status.observed_generation, Some(1));

    let remediated: Vec<_> = outcome
        .assessment
        .remediation
        .iter()
        .map(|(target, _)| target.machine_name())
        .collect();
    assert_eq!(remediated, vec!["m2"]);
    assert_eq!(outcome.assessment.next_check(), None);
}

#[test]
fn test_pending_machine_schedules_recheck() {
    let now = Utc::now();
    let mhc = health_check("default", "mhc", "c1", &[("role", "worker")]);
    let machines = machine_store(vec![machine(
        "default",
        "m1",
        "c1",
        Some("n1"),
        &[("role", "worker")],
    )]);
    let nodes = node_store(vec![node(
        "n1",
        &[("Ready", "Unknown", now - ChronoDuration::seconds(240))],
    )]);

    let outcome = assess(&mhc, &machines, &nodes, now);
    assert_eq!(outcome.status(&mhc).current_healthy, 0);
    assert!(outcome.assessment.remediation.is_empty());
    assert_eq!(
        outcome.assessment.next_check(),
        Some(Duration::from_secs(60))
    );
}

#[test]
fn test_policy_without_matches_has_empty_status() {
    let now = Utc::now();
    let mhc = health_check("default", "mhc", "c1", &[("role", "worker")]);
    let machines = machine_store(vec![machine(
        "default",
        "m1",
        "c1",
        Some("n1"),
        &[("role", "control-plane")],
    )]);

    let outcome = assess(&mhc, &machines, &node_store(vec![]), now);
    let status = outcome.status(&mhc);
    assert_eq!(status.expected_machines, 0);
    assert_eq!(status.current_healthy, 0);
    assert!(status.targets.is_empty());
    assert_eq!(outcome.assessment.next_check(), None);
}

#[test]
fn test_owner_reference_is_added_once() {
    let mut mhc = health_check("default", "mhc", "c1", &[("role", "worker")]);
    let c1 = cluster("default", "c1");

    ensure_owner_reference(&mut mhc, &c1).unwrap();
    ensure_owner_reference(&mut mhc, &c1).unwrap();

    let references = mhc.metadata.owner_references.as_ref().unwrap();
    assert_eq!(references.len(), 1);
    assert_eq!(references[0].kind, "Cluster");
    assert_eq!(references[0].api_version, "cluster.x-k8s.io/v1alpha3");
    assert_eq!(references[0].name, "c1");
    assert_eq!(references[0].uid, "uid-c1");
    assert_eq!(references[0].controller, Some(false));
}

#[test]
fn test_owner_reference_with_same_name_is_replaced() {
    let mut mhc = health_check("default", "mhc", "c1", &[("role", "worker")]);
    mhc.metadata.owner_references = Some(vec![
        OwnerReference {
            api_version: "cluster.x-k8s.io/v1alpha2".to_string(),
            kind: "Cluster".to_string(),
            name: "c1".to_string(),
            uid: "old-uid".to_string(),
            ..Default::default()
        },
        OwnerReference {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            name: "settings".to_string(),
            uid: "uid-settings".to_string(),
            ..Default::default()
        },
    ]);

    ensure_owner_reference(&mut mhc, &cluster("default", "c1")).unwrap();

    let references = mhc.metadata.owner_references.as_ref().unwrap();
    assert_eq!(references.len(), 2);
    assert_eq!(references[0].uid, "uid-c1");
    assert_eq!(references[0].api_version, "cluster.x-k8s.io/v1alpha3");
    assert_eq!(references[1].name, "settings");
}

#[test]
fn test_cluster_without_uid_is_rejected() {
    let mut mhc = health_check("default", "mhc", "c1", &[("role", "worker")]);
    let mut c1 = cluster("default", "c1");
    c1.metadata.uid = None;

    assert!(ensure_owner_reference(&mut mhc, &c1).is_err());
    assert!(mhc.metadata.owner_references.is_none());
}

#[test]
fn test_cluster_label_is_set() {
    let mut mhc = health_check("default", "mhc", "c1", &[("role", "worker")]);
    mhc.metadata.labels = Some([("team".to_string(), "infra".to_string())].into());

    ensure_cluster_label(&mut mhc, &cluster("default", "c1"));

    let labels = mhc.metadata.labels.as_ref().unwrap();
    assert_eq!(labels.get(CLUSTER_NAME_LABEL).map(String::as_str), Some("c1"));
    assert_eq!(labels.get("team").map(String::as_str), Some("infra"));
}

#[test]
fn test_unchanged_object_needs_no_patch() {
    let mhc = health_check("default", "mhc", "c1", &[("role", "worker")]);
    let patch = StatusPatch::snapshot(&mhc);

    assert!(patch.metadata_patch(&mhc).is_none());
    assert!(patch.status_patch(&mhc).is_none());
}

#[test]
fn test_patch_contains_only_changes() {
    let mhc = health_check("default", "mhc", "c1", &[("role", "worker")]);
    let patch = StatusPatch::snapshot(&mhc);

    let mut updated = mhc.clone();
    ensure_cluster_label(&mut updated, &cluster("default", "c1"));
    updated.status = Some(MachineHealthCheckStatus {
        expected_machines: 2,
        current_healthy: 1,
        observed_generation: Some(1),
        targets: vec!["m1".to_string(), "m2".to_string()],
    });

    assert_eq!(
        patch.metadata_patch(&updated),
        Some(json!({
            "metadata": {
                "labels": { "cluster.x-k8s.io/cluster-name": "c1" }
            }
        }))
    );
    assert_eq!(
        patch.status_patch(&updated),
        Some(json!({
            "status": {
                "expectedMachines": 2,
                "currentHealthy": 1,
                "observedGeneration": 1,
                "targets": ["m1", "m2"]
            }
        }))
    );
}

#[test]
fn test_emptied_status_clears_targets() {
    let mut mhc = health_check("default", "mhc", "c1", &[("role", "worker")]);
    mhc.status = Some(MachineHealthCheckStatus {
        expected_machines: 1,
        current_healthy: 1,
        observed_generation: Some(1),
        targets: vec!["m1".to_string()],
    });
    let patch = StatusPatch::snapshot(&mhc);

    let outcome = assess(&mhc, &machine_store(vec![]), &node_store(vec![]), Utc::now());
    let mut updated = mhc.clone();
    updated.status = Some(outcome.status(&mhc));

    assert_eq!(
        patch.status_patch(&updated),
        Some(json!({
            "status": {
                "expectedMachines": 0,
                "currentHealthy": 0,
                "observedGeneration": 1,
                "targets": []
            }
        }))
    );
}

#[tokio::test]
async fn test_forget_resets_retry_state() {
    let (client, _server) = mock_client();
    let state = controller_state(client, vec![], Some(vec![]));
    let mhc = health_check("default", "forget-test", "c1", &[("role", "worker")]);
    let obj = ObjectRef::from_obj(&mhc);

    assert_eq!(state.record_failure(&obj), 0);
    assert_eq!(state.record_failure(&obj), 1);

    state.forget(&mhc);
    assert_eq!(state.record_failure(&obj), 0);
}

#[tokio::test]
async fn test_pass_before_cache_sync_is_requeued() {
    let (client, _server) = mock_client();
    let state = Arc::new(ControllerState::new(
        client,
        Arc::new(IndexManager::seeded(vec![], vec![])),
        Arc::new(ClusterWatchRegistry::new(Arc::new(FixedNodeWatches(Some(vec![]))))),
        Arc::new(OperatorConfig::default()),
    ));
    let mhc = health_check("default", "mhc", "c1", &[("role", "worker")]);

    // Any request would stay unanswered and time out
    let action = within(reconcile(Arc::new(mhc), state)).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(5)));
}

#[tokio::test]
async fn test_deleted_health_check_is_ignored() {
    let (client, mut server) = mock_client();
    let state = controller_state(client, vec![], Some(vec![]));
    let mhc = health_check("default", "mhc", "c1", &[("role", "worker")]);

    let scenario = tokio::spawn(async move {
        server
            .respond(Method::GET, MHC_PATH, StatusCode::NOT_FOUND, not_found())
            .await;
    });

    let action = within(reconcile(Arc::new(mhc), state)).await.unwrap();
    assert_eq!(action, Action::await_change());
    within(scenario).await.unwrap();
}

#[tokio::test]
async fn test_missing_cluster_is_an_error() {
    let (client, mut server) = mock_client();
    let state = controller_state(client, vec![], Some(vec![]));
    let mhc = health_check("default", "mhc", "c1", &[("role", "worker")]);
    let current = serde_json::to_value(&mhc).unwrap();

    let scenario = tokio::spawn(async move {
        server
            .respond(Method::GET, MHC_PATH, StatusCode::OK, current)
            .await;
        server
            .respond(Method::GET, CLUSTER_PATH, StatusCode::NOT_FOUND, not_found())
            .await;
    });

    let err = within(reconcile(Arc::new(mhc), state)).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { ref kind, ref name, .. } if kind == "Cluster" && name == "c1"));
    within(scenario).await.unwrap();
}

#[tokio::test]
async fn test_paused_cluster_is_not_patched() {
    let (client, mut server) = mock_client();
    let state = controller_state(client, vec![], Some(vec![]));
    let mhc = health_check("default", "mhc", "c1", &[("role", "worker")]);
    let current = serde_json::to_value(&mhc).unwrap();
    let mut paused = cluster("default", "c1");
    paused.spec.paused = true;
    let paused = serde_json::to_value(&paused).unwrap();

    let scenario = tokio::spawn(async move {
        server
            .respond(Method::GET, MHC_PATH, StatusCode::OK, current)
            .await;
        server
            .respond(Method::GET, CLUSTER_PATH, StatusCode::OK, paused)
            .await;
    });

    let action = within(reconcile(Arc::new(mhc), state)).await.unwrap();
    assert_eq!(action, Action::await_change());
    within(scenario).await.unwrap();
}

#[tokio::test]
async fn test_healthy_pass_patches_metadata_and_status() {
    let (client, mut server) = mock_client();
    let now = Utc::now();
    let state = controller_state(
        client,
        vec![machine("default", "m1", "c1", Some("n1"), &[("role", "worker")])],
        Some(vec![node("n1", &[("Ready", "True", now - ChronoDuration::hours(1))])]),
    );
    let mhc = health_check("default", "mhc", "c1", &[("role", "worker")]);
    let current = serde_json::to_value(&mhc).unwrap();
    let c1 = serde_json::to_value(cluster("default", "c1")).unwrap();

    let scenario = tokio::spawn(async move {
        server
            .respond(Method::GET, MHC_PATH, StatusCode::OK, current.clone())
            .await;
        server
            .respond(Method::GET, CLUSTER_PATH, StatusCode::OK, c1)
            .await;
        let metadata = server
            .respond(Method::PATCH, MHC_PATH, StatusCode::OK, current.clone())
            .await;
        let status = server
            .respond(
                Method::PATCH,
                &format!("{}/status", MHC_PATH),
                StatusCode::OK,
                current,
            )
            .await;
        (metadata, status)
    });

    let action = within(reconcile(Arc::new(mhc), state)).await.unwrap();
    assert_eq!(action, Action::await_change());

    let (metadata, status) = within(scenario).await.unwrap();
    assert_eq!(metadata["metadata"]["labels"][CLUSTER_NAME_LABEL], "c1");
    assert_eq!(metadata["metadata"]["ownerReferences"][0]["uid"], "uid-c1");
    assert_eq!(
        status,
        json!({
            "status": {
                "expectedMachines": 1,
                "currentHealthy": 1,
                "observedGeneration": 1,
                "targets": ["m1"]
            }
        })
    );
}

#[tokio::test]
async fn test_failed_pass_still_persists_and_aggregates_errors() {
    let (client, mut server) = mock_client();
    // The node watch of the cluster cannot be started
    let state = controller_state(client, vec![], None);
    let mhc = health_check("default", "mhc", "c1", &[("role", "worker")]);
    let current = serde_json::to_value(&mhc).unwrap();
    let c1 = serde_json::to_value(cluster("default", "c1")).unwrap();

    let scenario = tokio::spawn(async move {
        server
            .respond(Method::GET, MHC_PATH, StatusCode::OK, current)
            .await;
        server
            .respond(Method::GET, CLUSTER_PATH, StatusCode::OK, c1)
            .await;
        server
            .respond(
                Method::GET,
                &format!("{}/mhc.reconcileerror", EVENTS_PATH),
                StatusCode::NOT_FOUND,
                not_found(),
            )
            .await;
        let event = server
            .echo(Method::POST, EVENTS_PATH, StatusCode::CREATED)
            .await;
        let metadata = server
            .respond(
                Method::PATCH,
                MHC_PATH,
                StatusCode::INTERNAL_SERVER_ERROR,
                api_error(500, "InternalError"),
            )
            .await;
        (event, metadata)
    });

    let err = within(reconcile(Arc::new(mhc), state)).await.unwrap_err();
    match err {
        Error::Aggregate(errors) => {
            assert_eq!(errors.len(), 2);
            assert!(matches!(errors[0], Error::RemoteClusterError { .. }));
            assert!(matches!(errors[1], Error::KubeError(_)));
        }
        other => panic!("expected aggregate error, got {:?}", other),
    }

    let (event, metadata) = within(scenario).await.unwrap();
    assert_eq!(event["reason"], "ReconcileError");
    // Owner reference and label were still written
    assert_eq!(metadata["metadata"]["labels"][CLUSTER_NAME_LABEL], "c1");
}
