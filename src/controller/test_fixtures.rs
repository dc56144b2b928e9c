//! Object builders and a scripted API server shared by the controller tests

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future;
use http::{Method, Request, Response, StatusCode};
use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeStatus, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::api::ObjectMeta;
use kube::client::Body;
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher;
use kube::Client;
use serde_json::{json, Value};
use tower_test::mock::SendResponse;

use super::cluster_watch::{ClusterKey, ClusterWatchRegistry, NodeWatch, NodeWatchFactory};
use super::index::IndexManager;
use super::reconciler::ControllerState;
use crate::config::OperatorConfig;
use crate::error::{Error, Result};
use crate::crd::{
    Cluster, ClusterSpec, Duration, Machine, MachineHealthCheck, MachineHealthCheckSpec,
    MachineSpec, MachineStatus, UnhealthyCondition,
};

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn cluster(namespace: &str, name: &str) -> Cluster {
    let mut cluster = Cluster::new(name, ClusterSpec::default());
    cluster.metadata.namespace = Some(namespace.to_string());
    cluster.metadata.uid = Some(format!("uid-{}", name));
    cluster
}

/// A health check selecting `selector` labels, flagging `Ready=False` and
/// `Ready=Unknown` after five minutes
pub fn health_check(
    namespace: &str,
    name: &str,
    cluster_name: &str,
    selector: &[(&str, &str)],
) -> MachineHealthCheck {
    let mut mhc = MachineHealthCheck::new(
        name,
        MachineHealthCheckSpec {
            cluster_name: cluster_name.to_string(),
            selector: LabelSelector {
                match_labels: (!selector.is_empty()).then(|| labels(selector)),
                match_expressions: None,
            },
            unhealthy_conditions: vec![
                UnhealthyCondition {
                    type_: "Ready".to_string(),
                    status: "False".to_string(),
                    timeout: Duration::from_secs(300),
                },
                UnhealthyCondition {
                    type_: "Ready".to_string(),
                    status: "Unknown".to_string(),
                    timeout: Duration::from_secs(300),
                },
            ],
            node_startup_timeout: None,
        },
    );
    mhc.metadata.namespace = Some(namespace.to_string());
    mhc.metadata.generation = Some(1);
    mhc
}

pub fn machine(
    namespace: &str,
    name: &str,
    cluster_name: &str,
    node_name: Option<&str>,
    machine_labels: &[(&str, &str)],
) -> Machine {
    let mut machine = Machine::new(
        name,
        MachineSpec {
            cluster_name: cluster_name.to_string(),
        },
    );
    machine.metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels(machine_labels)),
        creation_timestamp: Some(Time(Utc::now())),
        ..Default::default()
    };
    machine.status = Some(MachineStatus {
        node_ref: node_name.map(|n| ObjectReference {
            kind: Some("Node".to_string()),
            name: Some(n.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    });
    machine
}

pub fn created_at(mut machine: Machine, time: DateTime<Utc>) -> Machine {
    machine.metadata.creation_timestamp = Some(Time(time));
    machine
}

/// A node holding `conditions` as (type, status, last transition) triples
pub fn node(name: &str, conditions: &[(&str, &str, DateTime<Utc>)]) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        status: Some(NodeStatus {
            conditions: Some(
                conditions
                    .iter()
                    .map(|(type_, status, since)| NodeCondition {
                        type_: type_.to_string(),
                        status: status.to_string(),
                        last_transition_time: Some(Time(*since)),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn machine_store(machines: Vec<Machine>) -> Store<Machine> {
    seeded_store(machines)
}

pub fn node_store(nodes: Vec<Node>) -> Store<Node> {
    seeded_store(nodes)
}

fn seeded_store<K>(objects: Vec<K>) -> Store<K>
where
    K: kube::Resource + Clone + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (store, mut writer) = reflector::store();
    for obj in objects {
        writer.apply_watcher_event(&watcher::Event::Apply(obj));
    }
    store
}

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

/// Client whose requests are answered through the returned server
pub fn mock_client() -> (Client, ApiServer) {
    let (service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    (Client::new(service, "default"), ApiServer(handle))
}

/// API server answering the requests of a mock client in script order
pub struct ApiServer(ApiServerHandle);

impl ApiServer {
    /// Answer the next request, which must be `method` on `path`, with
    /// `status` and `body`. Returns the JSON body of the request.
    pub async fn respond(
        &mut self,
        method: Method,
        path: &str,
        status: StatusCode,
        body: Value,
    ) -> Value {
        let (request, sent) = self.next(method, path).await;
        send(sent, status, &body);
        request
    }

    /// Answer the next request with its own body
    pub async fn echo(&mut self, method: Method, path: &str, status: StatusCode) -> Value {
        let (request, sent) = self.next(method, path).await;
        send(sent, status, &request);
        request
    }

    async fn next(
        &mut self,
        method: Method,
        path: &str,
    ) -> (Value, SendResponse<Response<Body>>) {
        let (request, sent) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), method);
        assert_eq!(request.uri().path(), path);
        let bytes = request.into_body().collect_bytes().await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (body, sent)
    }
}

fn send(sent: SendResponse<Response<Body>>, status: StatusCode, body: &Value) {
    let response = Response::builder()
        .status(status)
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap();
    sent.send_response(response);
}

/// Status body the API server returns for a failed request
pub fn api_error(code: u16, reason: &str) -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": reason,
        "reason": reason,
        "code": code,
    })
}

pub fn not_found() -> Value {
    api_error(404, "NotFound")
}

/// Node watches serving fixed nodes, or failing when there are none
pub struct FixedNodeWatches(pub Option<Vec<Node>>);

#[async_trait]
impl NodeWatchFactory for FixedNodeWatches {
    async fn start(&self, cluster: &ClusterKey) -> Result<NodeWatch> {
        let nodes = self.0.clone().ok_or_else(|| Error::RemoteClusterError {
            cluster: cluster.to_string(),
            message: "unreachable".to_string(),
        })?;
        Ok(NodeWatch::new(
            node_store(nodes),
            tokio::spawn(future::pending()),
        ))
    }
}

/// Synced controller state over `machines` and the nodes of every cluster
pub fn controller_state(
    client: Client,
    machines: Vec<Machine>,
    nodes: Option<Vec<Node>>,
) -> Arc<ControllerState> {
    let state = ControllerState::new(
        client,
        Arc::new(IndexManager::seeded(vec![], machines)),
        Arc::new(ClusterWatchRegistry::new(Arc::new(FixedNodeWatches(nodes)))),
        Arc::new(OperatorConfig::default()),
    );
    state.mark_ready();
    Arc::new(state)
}
