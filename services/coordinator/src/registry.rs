//! In-process registry of running container instances.
//!
//! The topology watcher is the registry's only writer; request handlers are
//! its many readers. Every mutation replaces whole values under the write
//! lock, so a reader never observes a partially-applied instance.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use scanhub_imageref::ImageReference;

/// Composite key identifying one running container.
///
/// Stable for the container's running lifetime; a restarted pod of the same
/// name reuses the key, which is exactly the replace-by-key behavior the
/// registry wants.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct InstanceId {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl InstanceId {
    pub fn new(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

/// A running container instance as last observed from the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerInstance {
    pub id: InstanceId,
    pub image: ImageReference,

    /// Node the pod is scheduled on. Empty when the reporting source knows
    /// no node (for example a pod surfaced by an out-of-cluster runtime).
    pub node_name: String,

    /// Container runtime, from the container ID scheme (`containerd`, ...).
    pub runtime: Option<String>,
}

/// Where a digest can be scanned: the node running it, and the runtime
/// managing the container there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestPlacement {
    pub node_name: String,
    pub runtime: Option<String>,
}

/// Concurrent map of running container instances.
///
/// Backed by a `BTreeMap` so iteration order is the key order; lookups that
/// return "any one" match therefore deterministically return the smallest
/// (namespace, pod, container) key.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: RwLock<BTreeMap<InstanceId, ContainerInstance>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the instance stored under its id.
    pub async fn upsert(&self, instance: ContainerInstance) {
        let mut instances = self.instances.write().await;
        debug!(instance = %instance.id, node = %instance.node_name, "Registry upsert");
        instances.insert(instance.id.clone(), instance);
    }

    /// Remove one instance. No-op when absent.
    pub async fn remove(&self, id: &InstanceId) {
        let mut instances = self.instances.write().await;
        if instances.remove(id).is_some() {
            debug!(instance = %id, "Registry remove");
        }
    }

    /// Remove every instance belonging to a pod, regardless of the phase it
    /// was last recorded with.
    pub async fn remove_pod(&self, namespace: &str, pod: &str) {
        let mut instances = self.instances.write().await;
        let before = instances.len();
        instances.retain(|id, _| !(id.namespace == namespace && id.pod == pod));
        let removed = before - instances.len();
        if removed > 0 {
            debug!(namespace, pod, removed, "Registry removed pod instances");
        }
    }

    /// Replace the full set of instances recorded for one pod in a single
    /// atomic step. Containers that disappeared from the pod's status drop
    /// out together with the ones being updated.
    pub async fn replace_pod(
        &self,
        namespace: &str,
        pod: &str,
        replacements: Vec<ContainerInstance>,
    ) {
        let mut instances = self.instances.write().await;
        instances.retain(|id, _| !(id.namespace == namespace && id.pod == pod));
        for instance in replacements {
            instances.insert(instance.id.clone(), instance);
        }
    }

    /// Drop every instance whose (namespace, pod) is not in `live_pods`.
    ///
    /// Called when a watch resync completes, to heal deletes that happened
    /// while the watch stream was down.
    pub async fn retain_pods(&self, live_pods: &BTreeSet<(String, String)>) {
        let mut instances = self.instances.write().await;
        let before = instances.len();
        instances
            .retain(|id, _| live_pods.contains(&(id.namespace.clone(), id.pod.clone())));
        let removed = before - instances.len();
        if removed > 0 {
            debug!(removed, "Registry pruned instances absent from resync");
        }
    }

    pub async fn get(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Option<ContainerInstance> {
        let instances = self.instances.read().await;
        instances
            .get(&InstanceId::new(namespace, pod, container))
            .cloned()
    }

    pub async fn count(&self) -> usize {
        self.instances.read().await.len()
    }

    /// Find a node running an image with this digest.
    ///
    /// Returns the match with the smallest (namespace, pod, container) key
    /// when several instances share the digest, so repeated queries route to
    /// the same node.
    pub async fn find_node_for_image_digest(&self, digest: &str) -> Option<DigestPlacement> {
        let instances = self.instances.read().await;
        instances
            .values()
            .find(|instance| instance.image.digest.as_deref() == Some(digest))
            .map(|instance| DigestPlacement {
                node_name: instance.node_name.clone(),
                runtime: instance.runtime.clone(),
            })
    }

    /// Snapshot of all tracked instances, in key order.
    pub async fn list(&self) -> Vec<ContainerInstance> {
        self.instances.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(namespace: &str, pod: &str, container: &str, node: &str) -> ContainerInstance {
        ContainerInstance {
            id: InstanceId::new(namespace, pod, container),
            image: ImageReference {
                repository: "nginx".to_string(),
                tag: "1.21".to_string(),
                digest: Some("sha256:abc".to_string()),
            },
            node_name: node.to_string(),
            runtime: Some("containerd".to_string()),
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let registry = InstanceRegistry::new();

        registry.upsert(instance("default", "web-0", "app", "worker-1")).await;
        registry.upsert(instance("default", "web-0", "app", "worker-1")).await;

        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn upsert_replaces_by_key() {
        let registry = InstanceRegistry::new();

        registry.upsert(instance("default", "web-0", "app", "worker-1")).await;
        registry.upsert(instance("default", "web-0", "app", "worker-2")).await;

        let stored = registry.get("default", "web-0", "app").await.unwrap();
        assert_eq!(stored.node_name, "worker-2");
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn remove_is_noop_when_absent() {
        let registry = InstanceRegistry::new();
        registry.remove(&InstanceId::new("default", "gone", "app")).await;
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn remove_pod_drops_all_containers_of_that_pod() {
        let registry = InstanceRegistry::new();

        registry.upsert(instance("default", "web-0", "app", "worker-1")).await;
        registry.upsert(instance("default", "web-0", "sidecar", "worker-1")).await;
        registry.upsert(instance("default", "web-1", "app", "worker-2")).await;
        registry.upsert(instance("other", "web-0", "app", "worker-3")).await;

        registry.remove_pod("default", "web-0").await;

        assert_eq!(registry.count().await, 2);
        assert!(registry.get("default", "web-0", "app").await.is_none());
        assert!(registry.get("default", "web-0", "sidecar").await.is_none());
        assert!(registry.get("default", "web-1", "app").await.is_some());
        assert!(registry.get("other", "web-0", "app").await.is_some());
    }

    #[tokio::test]
    async fn replace_pod_drops_vanished_containers() {
        let registry = InstanceRegistry::new();

        registry.upsert(instance("default", "web-0", "app", "worker-1")).await;
        registry.upsert(instance("default", "web-0", "sidecar", "worker-1")).await;

        registry
            .replace_pod(
                "default",
                "web-0",
                vec![instance("default", "web-0", "app", "worker-1")],
            )
            .await;

        assert_eq!(registry.count().await, 1);
        assert!(registry.get("default", "web-0", "sidecar").await.is_none());
    }

    #[tokio::test]
    async fn find_node_matches_digest() {
        let registry = InstanceRegistry::new();

        let mut running = instance("default", "web-0", "app", "worker-1");
        running.image.digest = Some("sha256:target".to_string());
        registry.upsert(running).await;

        let placement = registry
            .find_node_for_image_digest("sha256:target")
            .await
            .unwrap();
        assert_eq!(placement.node_name, "worker-1");
        assert_eq!(placement.runtime.as_deref(), Some("containerd"));

        assert!(registry
            .find_node_for_image_digest("sha256:absent")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn find_node_tie_break_is_smallest_key() {
        let registry = InstanceRegistry::new();

        let mut on_b = instance("ns-b", "pod", "app", "worker-9");
        on_b.image.digest = Some("sha256:shared".to_string());
        let mut on_a = instance("ns-a", "pod", "app", "worker-1");
        on_a.image.digest = Some("sha256:shared".to_string());

        // Insertion order must not matter.
        registry.upsert(on_b).await;
        registry.upsert(on_a).await;

        let placement = registry
            .find_node_for_image_digest("sha256:shared")
            .await
            .unwrap();
        assert_eq!(placement.node_name, "worker-1");
    }

    #[tokio::test]
    async fn instances_without_digest_never_match() {
        let registry = InstanceRegistry::new();

        let mut pending = instance("default", "web-0", "app", "worker-1");
        pending.image.digest = None;
        registry.upsert(pending).await;

        assert!(registry.find_node_for_image_digest("").await.is_none());
    }

    #[tokio::test]
    async fn retain_pods_prunes_stale_entries() {
        let registry = InstanceRegistry::new();

        registry.upsert(instance("default", "web-0", "app", "worker-1")).await;
        registry.upsert(instance("default", "web-1", "app", "worker-2")).await;

        let live = BTreeSet::from([("default".to_string(), "web-1".to_string())]);
        registry.retain_pods(&live).await;

        assert_eq!(registry.count().await, 1);
        assert!(registry.get("default", "web-1", "app").await.is_some());
    }
}
