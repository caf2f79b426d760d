//! The narrow read/event contracts the reconciler depends on: a read-only
//! indexed cache exposing list/get plus a registrable change-notification
//! hook with `Add`, `Update(old,new)`, `Delete` callbacks. Keeping these as
//! traits lets the engine run its full-sync and event-filtering logic
//! against fakes in tests; `k8s::KubeListers` is the only real backing,
//! watching the cluster via `kube_runtime::watcher`.

use k8s_openapi::api::networking::v1::NetworkPolicy as ApiNetworkPolicy;

use crate::model::{Namespace, Pod};

pub trait PodLister: Send + Sync {
    fn list(&self) -> Vec<Pod>;

    /// Point lookup by namespace/name. Default-implemented by scanning
    /// `list()`; a backing with a real index (`k8s::KubeListers`) is free to
    /// override it with an O(1) lookup.
    fn get(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.list().into_iter().find(|p| p.namespace == namespace && p.name == name)
    }
}

pub trait NamespaceLister: Send + Sync {
    fn list(&self) -> Vec<Namespace>;

    /// Point lookup by name. Namespaces have no enclosing namespace of their
    /// own, so unlike `PodLister`/`PolicyLister` this takes a single key.
    fn get(&self, name: &str) -> Option<Namespace> {
        self.list().into_iter().find(|n| n.name == name)
    }
}

pub trait PolicyLister: Send + Sync {
    fn list(&self) -> Vec<ApiNetworkPolicy>;

    /// Point lookup by namespace/name. Default-implemented by scanning
    /// `list()`.
    fn get(&self, namespace: &str, name: &str) -> Option<ApiNetworkPolicy> {
        self.list()
            .into_iter()
            .find(|p| p.metadata.namespace.as_deref() == Some(namespace) && p.metadata.name.as_deref() == Some(name))
    }
}

/// A pod add/update/delete, as delivered by the watch driver. `Updated`
/// carries both the previous and current value so the reconciler can apply
/// the "only phase, IP, or labels changed" filter from spec 4.7 without
/// needing to re-fetch anything.
#[derive(Debug, Clone)]
pub enum PodChange {
    Added(Pod),
    Updated { old: Pod, new: Pod },
    Deleted(Pod),
}

#[derive(Debug, Clone)]
pub enum NamespaceChange {
    Added(Namespace),
    Updated { old: Namespace, new: Namespace },
    Deleted(Namespace),
}

/// Any policy change requests a resync unconditionally; there is no
/// equivalent of the pod phase/IP/labels filter for policies.
#[derive(Debug, Clone, Copy)]
pub enum PolicyChange {
    Added,
    Updated,
    Deleted,
}

/// True if a pod update is significant enough to warrant a resync: its
/// phase, IP, or labels changed. Matches spec 4.7's event filter exactly.
pub fn pod_change_is_significant(old: &Pod, new: &Pod) -> bool {
    old.ip != new.ip || old.labels != new.labels
}
