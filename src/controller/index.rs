//! Secondary indexes over the operator's cached objects
//!
//! Each index is a projection of one reflector watch stream, keyed by a
//! field extracted from the object. Entries are eventually consistent
//! with the store they point into: a lookup resolves ids through the
//! store and silently skips objects that are gone.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::{future, Stream, StreamExt, TryStreamExt};
use kube::api::Api;
use kube::runtime::reflector::{self, store::Writer, ObjectRef, ReflectHandle, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::crd::{Machine, MachineHealthCheck};
use crate::error::{Error, Result};

/// Index of MachineHealthChecks by `spec.clusterName`
pub const HEALTH_CHECK_CLUSTER_NAME_INDEX: &str = "spec.clusterName";

/// Index of Machines by `status.nodeRef.name`
pub const MACHINE_NODE_NAME_INDEX: &str = "status.nodeRef.name";

/// Objects a subscriber may fall behind before the watch waits for it
const SHARED_STREAM_BUFFER: usize = 256;

/// Namespace and name of a namespaced object
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Identity of `obj`, or `None` when it has no name
    pub fn of<K: Resource>(obj: &K) -> Option<Self> {
        let name = obj.meta().name.clone()?;
        Some(Self {
            namespace: obj.namespace().unwrap_or_default(),
            name,
        })
    }

    fn object_ref<K>(&self) -> ObjectRef<K>
    where
        K: Resource,
        K::DynamicType: Default,
    {
        ObjectRef::new(&self.name).within(&self.namespace)
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Default)]
struct IndexState {
    by_key: HashMap<String, BTreeSet<NamespacedName>>,
    by_object: HashMap<NamespacedName, Vec<String>>,
}

impl IndexState {
    fn insert(&mut self, id: NamespacedName, keys: Vec<String>) {
        self.remove(&id);
        if keys.is_empty() {
            return;
        }
        for key in &keys {
            self.by_key.entry(key.clone()).or_default().insert(id.clone());
        }
        self.by_object.insert(id, keys);
    }

    fn remove(&mut self, id: &NamespacedName) {
        let Some(keys) = self.by_object.remove(id) else {
            return;
        };
        for key in keys {
            if let Some(ids) = self.by_key.get_mut(&key) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_key.remove(&key);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct IndexInner {
    live: IndexState,
    /// Built while the watcher relists; swapped in on `InitDone`
    relist: Option<IndexState>,
}

/// A secondary index keyed by values extracted from each object
pub struct FieldIndex<K> {
    name: &'static str,
    extract: fn(&K) -> Vec<String>,
    inner: RwLock<IndexInner>,
}

impl<K: Resource> FieldIndex<K> {
    pub fn new(name: &'static str, extract: fn(&K) -> Vec<String>) -> Self {
        Self {
            name,
            extract,
            inner: RwLock::new(IndexInner::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Fold one watcher event into the index
    pub fn apply(&self, event: &watcher::Event<K>) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match event {
            watcher::Event::Apply(obj) => {
                if let Some(id) = NamespacedName::of(obj) {
                    inner.live.insert(id, (self.extract)(obj));
                }
            }
            watcher::Event::Delete(obj) => {
                if let Some(id) = NamespacedName::of(obj) {
                    inner.live.remove(&id);
                }
            }
            watcher::Event::Init => {
                inner.relist = Some(IndexState::default());
            }
            watcher::Event::InitApply(obj) => {
                if let Some(id) = NamespacedName::of(obj) {
                    inner
                        .relist
                        .get_or_insert_with(IndexState::default)
                        .insert(id, (self.extract)(obj));
                }
            }
            watcher::Event::InitDone => {
                if let Some(state) = inner.relist.take() {
                    debug!(
                        "Index {} rebuilt with {} keys",
                        self.name,
                        state.by_key.len()
                    );
                    inner.live = state;
                }
            }
        }
    }

    /// Ids of the objects indexed under `key`, in stable order
    pub fn lookup(&self, key: &str) -> Vec<NamespacedName> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .live
            .by_key
            .get(key)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// A reflector store paired with one secondary index over it
pub struct IndexedStore<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    store: Store<K>,
    index: Arc<FieldIndex<K>>,
}

impl<K> IndexedStore<K>
where
    K: Resource + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    /// Start the watch feeding the store and index in a background task.
    ///
    /// Returns a subscription to the objects the watch applies, and sends
    /// deleted objects to `deletions` when set.
    fn spawn(
        api: Api<K>,
        name: &'static str,
        extract: fn(&K) -> Vec<String>,
        deletions: Option<UnboundedSender<K>>,
    ) -> Result<(Self, ReflectHandle<K>, JoinHandle<()>)> {
        let (store, writer) = reflector::store_shared(SHARED_STREAM_BUFFER);
        let subscriber = writer
            .subscribe()
            .ok_or_else(|| Error::ConfigError(format!("index {} is not shared", name)))?;
        let index = Arc::new(FieldIndex::new(name, extract));

        let events = watcher(api, watcher::Config::default()).default_backoff();
        info!("Starting watch for index {}", name);
        let task = tokio::spawn(project(events, index.clone(), writer, deletions));
        Ok((Self { store, index }, subscriber, task))
    }

    /// Objects in `namespace` indexed under `key`
    pub fn list_by(&self, namespace: &str, key: &str) -> Vec<Arc<K>> {
        self.index
            .lookup(key)
            .into_iter()
            .filter(|id| id.namespace == namespace)
            .filter_map(|id| self.store.get(&id.object_ref()))
            .collect()
    }

    /// Objects anywhere indexed under `key`
    pub fn list_all_by(&self, key: &str) -> Vec<Arc<K>> {
        self.index
            .lookup(key)
            .into_iter()
            .filter_map(|id| self.store.get(&id.object_ref()))
            .collect()
    }

    pub fn store(&self) -> &Store<K> {
        &self.store
    }
}

#[cfg(test)]
impl<K> IndexedStore<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    /// Store and index preloaded with `objects`
    pub(crate) fn seeded(
        name: &'static str,
        extract: fn(&K) -> Vec<String>,
        objects: Vec<K>,
    ) -> Self {
        let (store, mut writer) = reflector::store();
        let index = Arc::new(FieldIndex::new(name, extract));
        for obj in objects {
            let event = watcher::Event::Apply(obj);
            index.apply(&event);
            writer.apply_watcher_event(&event);
        }
        Self { store, index }
    }
}

/// Fold watch events into `index` and the shared store behind `writer`
async fn project<K, S>(
    events: S,
    index: Arc<FieldIndex<K>>,
    writer: Writer<K>,
    deletions: Option<UnboundedSender<K>>,
) where
    K: Resource + Clone + fmt::Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
    S: Stream<Item = std::result::Result<watcher::Event<K>, watcher::Error>> + Send + 'static,
{
    let name = index.name();
    events
        .map_ok(move |event| {
            index.apply(&event);
            if let (watcher::Event::Delete(obj), Some(deletions)) = (&event, &deletions) {
                if deletions.unbounded_send(obj.clone()).is_err() {
                    debug!("Nobody listens for deletions from index {}", name);
                }
            }
            event
        })
        .reflect_shared(writer)
        .for_each(|event| {
            if let Err(e) = event {
                warn!("Watch error for index {}: {}", name, e);
            }
            future::ready(())
        })
        .await;
}

fn health_check_cluster_name(mhc: &MachineHealthCheck) -> Vec<String> {
    vec![mhc.spec.cluster_name.clone()]
}

fn machine_node_name(machine: &Machine) -> Vec<String> {
    machine
        .node_name()
        .map(|name| vec![name.to_string()])
        .unwrap_or_default()
}

/// Change streams of the index watches, consumed by the controller
pub struct IndexStreams {
    pub health_checks: ReflectHandle<MachineHealthCheck>,
    pub machines: ReflectHandle<Machine>,
    /// MachineHealthChecks deleted from the cluster
    pub deleted_health_checks: UnboundedReceiver<MachineHealthCheck>,
}

/// Secondary indexes over MachineHealthChecks and Machines
pub struct IndexManager {
    health_checks: IndexedStore<MachineHealthCheck>,
    machines: IndexedStore<Machine>,
    tasks: Vec<JoinHandle<()>>,
}

impl IndexManager {
    /// Start the watches backing both indexes, scoped to `namespace` when set.
    ///
    /// These are the only watches on MachineHealthChecks and Machines; the
    /// controller is driven by the returned streams.
    pub fn spawn(client: Client, namespace: Option<&str>) -> Result<(Self, IndexStreams)> {
        let (deleted_tx, deleted_health_checks) = mpsc::unbounded();
        let (health_checks, health_check_stream, mhc_task) = IndexedStore::spawn(
            scoped_api(client.clone(), namespace),
            HEALTH_CHECK_CLUSTER_NAME_INDEX,
            health_check_cluster_name,
            Some(deleted_tx),
        )?;
        let (machines, machine_stream, machine_task) = IndexedStore::spawn(
            scoped_api(client, namespace),
            MACHINE_NODE_NAME_INDEX,
            machine_node_name,
            None,
        )?;

        let manager = Self {
            health_checks,
            machines,
            tasks: vec![mhc_task, machine_task],
        };
        let streams = IndexStreams {
            health_checks: health_check_stream,
            machines: machine_stream,
            deleted_health_checks,
        };
        Ok((manager, streams))
    }

    /// Wait until both watches completed their initial list
    pub async fn wait_until_ready(&self) -> Result<()> {
        let not_running = |_| Error::ConfigError("index watch stopped before initial list".into());
        self.health_checks
            .store
            .wait_until_ready()
            .await
            .map_err(not_running)?;
        self.machines
            .store
            .wait_until_ready()
            .await
            .map_err(not_running)?;
        Ok(())
    }

    /// MachineHealthChecks in `namespace` whose cluster name is `cluster_name`
    pub fn health_checks_for_cluster(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Vec<Arc<MachineHealthCheck>> {
        self.health_checks.list_by(namespace, cluster_name)
    }

    /// Machines, in any namespace, whose node reference names `node_name`
    pub fn machines_for_node(&self, node_name: &str) -> Vec<Arc<Machine>> {
        self.machines.list_all_by(node_name)
    }

    /// Cached machines
    pub fn machines(&self) -> &Store<Machine> {
        self.machines.store()
    }

    /// Cached MachineHealthChecks
    pub fn health_checks(&self) -> &Store<MachineHealthCheck> {
        self.health_checks.store()
    }

    #[cfg(test)]
    pub(crate) fn seeded(health_checks: Vec<MachineHealthCheck>, machines: Vec<Machine>) -> Self {
        Self {
            health_checks: IndexedStore::seeded(
                HEALTH_CHECK_CLUSTER_NAME_INDEX,
                health_check_cluster_name,
                health_checks,
            ),
            machines: IndexedStore::seeded(MACHINE_NODE_NAME_INDEX, machine_node_name, machines),
            tasks: Vec::new(),
        }
    }
}

impl Drop for IndexManager {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

pub(crate) fn scoped_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = kube::core::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}
