//! Node watches on workload clusters
//!
//! Every workload cluster gets one node reflector, started lazily the
//! first time a MachineHealthCheck for that cluster is reconciled and
//! kept for the lifetime of the process. Node changes are routed to the
//! MachineHealthChecks they affect and fed back into the controller.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc::UnboundedSender;
use futures::{future, StreamExt};
use k8s_openapi::api::core::v1::Node;
use kube::api::Api;
use kube::runtime::reflector::{self, store::Writer, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::remote;
use super::router::{EventRouter, WatchedObject};
use crate::crd::{Cluster, MachineHealthCheck};
use crate::error::{Error, Result};

/// Identity of a workload cluster
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterKey {
    pub namespace: String,
    pub name: String,
}

impl ClusterKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl From<&Cluster> for ClusterKey {
    fn from(cluster: &Cluster) -> Self {
        Self::new(cluster.namespace().unwrap_or_default(), cluster.name_any())
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A running node reflector; the background task stops when dropped
pub struct NodeWatch {
    nodes: Store<Node>,
    task: JoinHandle<()>,
}

impl NodeWatch {
    pub fn new(nodes: Store<Node>, task: JoinHandle<()>) -> Self {
        Self { nodes, task }
    }

    pub fn nodes(&self) -> &Store<Node> {
        &self.nodes
    }
}

impl Drop for NodeWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Starts node watches on workload clusters
#[async_trait]
pub trait NodeWatchFactory: Send + Sync {
    /// Start watching the nodes of `cluster`. Returns once the watch has
    /// completed its initial list.
    async fn start(&self, cluster: &ClusterKey) -> Result<NodeWatch>;
}

/// Process-wide registry of node watches, one per workload cluster
pub struct ClusterWatchRegistry {
    factory: Arc<dyn NodeWatchFactory>,
    watches: Mutex<HashMap<ClusterKey, Arc<OnceCell<NodeWatch>>>>,
}

impl ClusterWatchRegistry {
    pub fn new(factory: Arc<dyn NodeWatchFactory>) -> Self {
        Self {
            factory,
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Slot of `cluster`, created empty on first use
    async fn slot(&self, cluster: &ClusterKey) -> Arc<OnceCell<NodeWatch>> {
        self.watches
            .lock()
            .await
            .entry(cluster.clone())
            .or_default()
            .clone()
    }

    /// Node store of `cluster`, starting its watch if there is none yet.
    ///
    /// Concurrent callers for the same cluster wait on one start; callers
    /// for other clusters are not blocked by it. A watch that fails to
    /// start leaves the slot empty for the next caller.
    #[instrument(skip(self), fields(cluster = %cluster))]
    pub async fn ensure_watch(&self, cluster: &ClusterKey) -> Result<Store<Node>> {
        let slot = self.slot(cluster).await;
        let watch = slot
            .get_or_try_init(|| async {
                info!("Starting node watch for cluster {}", cluster);
                self.factory.start(cluster).await.map_err(|e| {
                    warn!("Failed to start node watch for cluster {}: {}", cluster, e);
                    e
                })
            })
            .await?;
        Ok(watch.nodes().clone())
    }

    /// Node store of `cluster` if its watch is running
    pub async fn node_store(&self, cluster: &ClusterKey) -> Option<Store<Node>> {
        let slot = self.watches.lock().await.get(cluster).cloned()?;
        slot.get().map(|watch| watch.nodes().clone())
    }

    /// Number of running watches
    pub async fn len(&self) -> usize {
        self.watches
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Watches nodes through a client built from the cluster's kubeconfig
/// secret and triggers reconciliation of the affected MachineHealthChecks
pub struct RemoteNodeWatcher {
    client: Client,
    router: Arc<EventRouter>,
    triggers: UnboundedSender<ObjectRef<MachineHealthCheck>>,
    sync_timeout: Duration,
}

impl RemoteNodeWatcher {
    pub fn new(
        client: Client,
        router: Arc<EventRouter>,
        triggers: UnboundedSender<ObjectRef<MachineHealthCheck>>,
        sync_timeout: Duration,
    ) -> Self {
        Self {
            client,
            router,
            triggers,
            sync_timeout,
        }
    }
}

#[async_trait]
impl NodeWatchFactory for RemoteNodeWatcher {
    async fn start(&self, cluster: &ClusterKey) -> Result<NodeWatch> {
        let remote = remote::remote_client(&self.client, cluster).await?;
        let (nodes, writer) = reflector::store();

        let task = tokio::spawn(watch_nodes(
            Api::all(remote),
            writer,
            cluster.clone(),
            self.router.clone(),
            self.triggers.clone(),
        ));
        // Dropping the watch on any early return aborts the task
        let watch = NodeWatch::new(nodes, task);

        match tokio::time::timeout(self.sync_timeout, watch.nodes().wait_until_ready()).await {
            Ok(Ok(())) => {
                info!(
                    "Node watch for cluster {} synced with {} nodes",
                    cluster,
                    watch.nodes().state().len()
                );
                Ok(watch)
            }
            Ok(Err(_)) => Err(Error::WatchError {
                cluster: cluster.to_string(),
                message: "watch stopped before the initial list completed".to_string(),
            }),
            Err(_) => Err(Error::WatchError {
                cluster: cluster.to_string(),
                message: format!("nodes not synced within {}s", self.sync_timeout.as_secs()),
            }),
        }
    }
}

async fn watch_nodes(
    api: Api<Node>,
    writer: Writer<Node>,
    cluster: ClusterKey,
    router: Arc<EventRouter>,
    triggers: UnboundedSender<ObjectRef<MachineHealthCheck>>,
) {
    watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .touched_objects()
        .for_each(|event| {
            match event {
                Ok(node) => {
                    let requests = router.route(WatchedObject::Node {
                        cluster: &cluster,
                        node: &node,
                    });
                    for request in requests {
                        if triggers.unbounded_send(request).is_err() {
                            debug!("Controller stopped, dropping request from node {}", node.name_any());
                        }
                    }
                }
                Err(e) => warn!("Node watch error for cluster {}: {}", cluster, e),
            }
            future::ready(())
        })
        .await;
}
