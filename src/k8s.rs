//! The real, cluster-backed lister/watch implementation: three
//! `kube_runtime::watcher` loops feeding a shared in-memory cache
//! (`Arc<Mutex<..>>` state updated from `Event::{Applied,Deleted,Restarted}`,
//! wrapped in a `tokio::select!` against a shutdown broadcast receiver).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace as ApiNamespace, Pod as ApiPod};
use k8s_openapi::api::networking::v1::NetworkPolicy as ApiNetworkPolicy;
use kube::{Api, Client};
use kube_runtime::watcher::{self, Event};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::listers::{NamespaceChange, NamespaceLister, PodChange, PodLister, PolicyChange, PolicyLister};
use crate::model::{self, Namespace, Pod};
use crate::reconcile::Reconciler;

struct SharedCache<T> {
    items: Mutex<HashMap<String, T>>,
}

impl<T: Clone> SharedCache<T> {
    fn new() -> Self {
        Self { items: Mutex::new(HashMap::new()) }
    }

    fn list(&self) -> Vec<T> {
        self.items.lock().unwrap().values().cloned().collect()
    }

    fn get(&self, key: &str) -> Option<T> {
        self.items.lock().unwrap().get(key).cloned()
    }

    fn upsert(&self, key: String, value: T) -> Option<T> {
        self.items.lock().unwrap().insert(key, value)
    }

    fn remove(&self, key: &str) -> Option<T> {
        self.items.lock().unwrap().remove(key)
    }

    fn replace_all(&self, values: impl IntoIterator<Item = (String, T)>) {
        let mut items = self.items.lock().unwrap();
        items.clear();
        items.extend(values);
    }
}

fn pod_key(ns: &str, name: &str) -> String {
    format!("{ns}/{name}")
}

/// Cluster-backed implementation of the three lister traits, reading from
/// the caches the watch loops maintain. Cheap to clone: every field is an
/// `Arc` over the same shared cache.
#[derive(Clone)]
pub struct KubeListers {
    pods: Arc<SharedCache<Pod>>,
    namespaces: Arc<SharedCache<Namespace>>,
    policies: Arc<SharedCache<ApiNetworkPolicy>>,
}

impl PodLister for KubeListers {
    fn list(&self) -> Vec<Pod> {
        self.pods.list()
    }

    fn get(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.pods.get(&pod_key(namespace, name))
    }
}

impl NamespaceLister for KubeListers {
    fn list(&self) -> Vec<Namespace> {
        self.namespaces.list()
    }

    fn get(&self, name: &str) -> Option<Namespace> {
        self.namespaces.get(name)
    }
}

impl PolicyLister for KubeListers {
    fn list(&self) -> Vec<ApiNetworkPolicy> {
        self.policies.list()
    }

    fn get(&self, namespace: &str, name: &str) -> Option<ApiNetworkPolicy> {
        self.policies.get(&pod_key(namespace, name))
    }
}

impl KubeListers {
    pub fn new() -> Self {
        Self {
            pods: Arc::new(SharedCache::new()),
            namespaces: Arc::new(SharedCache::new()),
            policies: Arc::new(SharedCache::new()),
        }
    }
}

impl Default for KubeListers {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns the three watch loops and runs them until `shutdown` fires. Each
/// loop updates `listers`' shared cache and, once the reconciler has
/// completed its first full sync, forwards significant changes into a
/// resync request.
pub async fn run_watchers(
    client: Client,
    node_name: String,
    listers: &KubeListers,
    reconciler: Arc<Reconciler>,
    shutdown: broadcast::Receiver<()>,
) {
    let pods = Api::<ApiPod>::all(client.clone());
    let namespaces = Api::<ApiNamespace>::all(client.clone());
    let policies = Api::<ApiNetworkPolicy>::all(client);

    tokio::join!(
        watch_pods(pods, node_name, listers.pods.clone(), reconciler.clone(), shutdown.resubscribe()),
        watch_namespaces(namespaces, listers.namespaces.clone(), reconciler.clone(), shutdown.resubscribe()),
        watch_policies(policies, listers.policies.clone(), reconciler, shutdown.resubscribe()),
    );
}

async fn watch_pods(
    api: Api<ApiPod>,
    node_name: String,
    cache: Arc<SharedCache<Pod>>,
    reconciler: Arc<Reconciler>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut stream = watcher::watcher(api, watcher::Config::default()).boxed();
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("pod_watch_shutdown");
                return;
            }
            event = stream.next() => {
                let Some(Ok(event)) = event else { continue };
                match event {
                    Event::Applied(raw) => {
                        let new = model::pod_from_api(&raw, &node_name);
                        let key = pod_key(&new.namespace, &new.name);
                        match cache.upsert(key, new.clone()) {
                            Some(old) => reconciler.handle_pod_change(PodChange::Updated { old, new }).await,
                            None => reconciler.handle_pod_change(PodChange::Added(new)).await,
                        }
                    }
                    Event::Deleted(raw) => {
                        let ns = raw.metadata.namespace.clone().unwrap_or_default();
                        let name = raw.metadata.name.clone().unwrap_or_default();
                        if let Some(old) = cache.remove(&pod_key(&ns, &name)) {
                            reconciler.handle_pod_change(PodChange::Deleted(old)).await;
                        }
                    }
                    Event::Restarted(raws) => {
                        let values = raws.iter().map(|raw| {
                            let pod = model::pod_from_api(raw, &node_name);
                            (pod_key(&pod.namespace, &pod.name), pod)
                        });
                        cache.replace_all(values);
                        reconciler.request_sync();
                    }
                }
            }
        }
    }
}

async fn watch_namespaces(
    api: Api<ApiNamespace>,
    cache: Arc<SharedCache<Namespace>>,
    reconciler: Arc<Reconciler>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut stream = watcher::watcher(api, watcher::Config::default()).boxed();
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("namespace_watch_shutdown");
                return;
            }
            event = stream.next() => {
                let Some(Ok(event)) = event else { continue };
                match event {
                    Event::Applied(raw) => {
                        let new = namespace_from_api(&raw);
                        match cache.upsert(new.name.clone(), new.clone()) {
                            Some(old) => reconciler.handle_namespace_change(NamespaceChange::Updated { old, new }).await,
                            None => reconciler.handle_namespace_change(NamespaceChange::Added(new)).await,
                        }
                    }
                    Event::Deleted(raw) => {
                        let name = raw.metadata.name.clone().unwrap_or_default();
                        if let Some(old) = cache.remove(&name) {
                            reconciler.handle_namespace_change(NamespaceChange::Deleted(old)).await;
                        }
                    }
                    Event::Restarted(raws) => {
                        let values = raws.iter().map(namespace_from_api).map(|ns| (ns.name.clone(), ns));
                        cache.replace_all(values);
                        reconciler.request_sync();
                    }
                }
            }
        }
    }
}

async fn watch_policies(
    api: Api<ApiNetworkPolicy>,
    cache: Arc<SharedCache<ApiNetworkPolicy>>,
    reconciler: Arc<Reconciler>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut stream = watcher::watcher(api, watcher::Config::default()).boxed();
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("policy_watch_shutdown");
                return;
            }
            event = stream.next() => {
                let Some(Ok(event)) = event else {
                    warn!("policy_watch_decode_failed");
                    continue;
                };
                match event {
                    Event::Applied(raw) => {
                        let key = policy_key(&raw);
                        let change = if cache.upsert(key, raw).is_some() { PolicyChange::Updated } else { PolicyChange::Added };
                        reconciler.handle_policy_change(change).await;
                    }
                    Event::Deleted(raw) => {
                        if cache.remove(&policy_key(&raw)).is_some() {
                            reconciler.handle_policy_change(PolicyChange::Deleted).await;
                        }
                    }
                    Event::Restarted(raws) => {
                        let values = raws.into_iter().map(|raw| (policy_key(&raw), raw));
                        cache.replace_all(values);
                        reconciler.request_sync();
                    }
                }
            }
        }
    }
}

fn policy_key(raw: &ApiNetworkPolicy) -> String {
    pod_key(&raw.metadata.namespace.clone().unwrap_or_default(), &raw.metadata.name.clone().unwrap_or_default())
}

fn namespace_from_api(raw: &ApiNamespace) -> Namespace {
    Namespace {
        name: raw.metadata.name.clone().unwrap_or_default(),
        labels: raw.metadata.labels.clone().unwrap_or_default().into_iter().collect(),
    }
}
