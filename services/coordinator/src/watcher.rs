//! Cluster topology watcher.
//!
//! One long-lived task consumes the pod list+watch feed and mutates the
//! [`InstanceRegistry`]. The watch library re-lists on every (re)connect;
//! during that init phase we record which pods the cluster still has and
//! prune everything else afterwards, healing deletes that were missed while
//! the stream was down. Between a disconnect and the completed resync the
//! registry may serve transiently stale reads.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::{watcher, Config, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use tokio::sync::watch;
use tracing::{info, warn};

use scanhub_imageref::{runtime_from_container_id, ImageReference};

use crate::registry::{ContainerInstance, InstanceId, InstanceRegistry};

/// Pods seen while a list-then-watch resync is in flight.
type ResyncState = Option<BTreeSet<(String, String)>>;

/// Run the topology watch until shutdown.
///
/// `ready` flips to `true` once the first resync completes; `/readyz`
/// reports it.
pub async fn run(
    client: Client,
    registry: Arc<InstanceRegistry>,
    ready: watch::Sender<bool>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let pods: Api<Pod> = Api::all(client);
    let stream = watcher(pods, Config::default()).default_backoff();
    let mut stream = std::pin::pin!(stream);

    info!("Starting cluster topology watch");

    let mut resync: ResyncState = None;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Topology watcher shutting down");
                    break;
                }
            }
            event = stream.next() => match event {
                Some(Ok(event)) => handle_event(&registry, &ready, &mut resync, event).await,
                Some(Err(error)) => {
                    // The watcher restarts with a fresh list after errors;
                    // the next init phase heals whatever was missed.
                    warn!(error = %error, "Pod watch stream error");
                }
                None => {
                    warn!("Pod watch stream ended");
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Apply one watch event to the registry.
pub(crate) async fn handle_event(
    registry: &InstanceRegistry,
    ready: &watch::Sender<bool>,
    resync: &mut ResyncState,
    event: Event<Pod>,
) {
    match event {
        Event::Init => {
            *resync = Some(BTreeSet::new());
        }
        Event::InitApply(pod) => {
            if let Some(seen) = resync.as_mut() {
                seen.insert((pod.namespace().unwrap_or_default(), pod.name_any()));
            }
            apply_pod(registry, &pod).await;
        }
        Event::InitDone => {
            if let Some(seen) = resync.take() {
                registry.retain_pods(&seen).await;
            }
            let instances = registry.count().await;
            info!(instances, "Topology resync complete");
            ready.send_replace(true);
        }
        Event::Apply(pod) => apply_pod(registry, &pod).await,
        Event::Delete(pod) => {
            registry
                .remove_pod(&pod.namespace().unwrap_or_default(), &pod.name_any())
                .await;
        }
    }
}

/// Fold one observed pod into the registry.
///
/// A Running pod contributes one instance per spec container that has a
/// matching status entry; anything else removes whatever the pod had
/// contributed before. The whole container set is swapped atomically so
/// readers never see a half-applied pod.
pub(crate) async fn apply_pod(registry: &InstanceRegistry, pod: &Pod) {
    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();

    let phase = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref());
    let Some(spec) = pod.spec.as_ref() else {
        registry.remove_pod(&namespace, &name).await;
        return;
    };
    if phase != Some("Running") {
        registry.remove_pod(&namespace, &name).await;
        return;
    }

    let node_name = spec.node_name.clone().unwrap_or_default();
    let statuses = pod
        .status
        .as_ref()
        .and_then(|status| status.container_statuses.as_deref())
        .unwrap_or_default();

    let mut instances = Vec::with_capacity(spec.containers.len());
    for container in &spec.containers {
        let Some(image) = container.image.as_deref() else {
            continue;
        };
        let Some(status) = statuses.iter().find(|s| s.name == container.name) else {
            continue;
        };
        instances.push(ContainerInstance {
            id: InstanceId::new(namespace.clone(), name.clone(), container.name.clone()),
            image: ImageReference::from_runtime(image, &status.image_id),
            node_name: node_name.clone(),
            runtime: status
                .container_id
                .as_deref()
                .and_then(runtime_from_container_id),
        });
    }

    registry.replace_pod(&namespace, &name, instances).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, ContainerStatus, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    struct ContainerFixture {
        name: &'static str,
        image: &'static str,
        image_id: &'static str,
        container_id: &'static str,
    }

    fn pod(
        namespace: &str,
        name: &str,
        node: &str,
        phase: &str,
        containers: &[ContainerFixture],
    ) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: (!node.is_empty()).then(|| node.to_string()),
                containers: containers
                    .iter()
                    .map(|c| Container {
                        name: c.name.to_string(),
                        image: Some(c.image.to_string()),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                container_statuses: Some(
                    containers
                        .iter()
                        .map(|c| ContainerStatus {
                            name: c.name.to_string(),
                            image: c.image.to_string(),
                            image_id: c.image_id.to_string(),
                            container_id: (!c.container_id.is_empty())
                                .then(|| c.container_id.to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
        }
    }

    const NGINX: ContainerFixture = ContainerFixture {
        name: "app",
        image: "nginx:1.21",
        image_id: "docker-pullable://nginx@sha256:abc",
        container_id: "containerd://6a95e3",
    };

    #[tokio::test]
    async fn running_pod_contributes_instances() {
        let registry = InstanceRegistry::new();

        apply_pod(&registry, &pod("default", "web-0", "worker-1", "Running", &[NGINX])).await;

        let instance = registry.get("default", "web-0", "app").await.unwrap();
        assert_eq!(instance.node_name, "worker-1");
        assert_eq!(instance.image.repository, "nginx");
        assert_eq!(instance.image.tag, "1.21");
        assert_eq!(instance.image.digest.as_deref(), Some("sha256:abc"));
        assert_eq!(instance.runtime.as_deref(), Some("containerd"));
    }

    #[tokio::test]
    async fn transition_away_from_running_removes_instances() {
        let registry = InstanceRegistry::new();
        let before = registry.count().await;

        apply_pod(&registry, &pod("default", "web-0", "worker-1", "Running", &[NGINX])).await;
        assert_eq!(registry.count().await, before + 1);

        apply_pod(&registry, &pod("default", "web-0", "worker-1", "Failed", &[NGINX])).await;

        assert_eq!(registry.count().await, before);
        assert!(registry.get("default", "web-0", "app").await.is_none());
    }

    #[tokio::test]
    async fn pod_without_statuses_contributes_nothing() {
        let registry = InstanceRegistry::new();

        let mut fresh = pod("default", "web-0", "worker-1", "Running", &[NGINX]);
        fresh.status.as_mut().unwrap().container_statuses = None;
        apply_pod(&registry, &fresh).await;

        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn digest_stays_unset_until_runtime_reports_it() {
        let registry = InstanceRegistry::new();

        let pulling = ContainerFixture {
            image_id: "",
            container_id: "",
            ..NGINX
        };
        apply_pod(&registry, &pod("default", "web-0", "worker-1", "Running", &[pulling])).await;

        let instance = registry.get("default", "web-0", "app").await.unwrap();
        assert_eq!(instance.image.digest, None);
        assert_eq!(instance.runtime, None);
    }

    #[tokio::test]
    async fn delete_event_removes_regardless_of_phase() {
        let registry = InstanceRegistry::new();
        let (ready, _) = watch::channel(false);
        let mut resync = None;

        handle_event(
            &registry,
            &ready,
            &mut resync,
            Event::Apply(pod("default", "web-0", "worker-1", "Running", &[NGINX])),
        )
        .await;
        assert_eq!(registry.count().await, 1);

        handle_event(
            &registry,
            &ready,
            &mut resync,
            Event::Delete(pod("default", "web-0", "worker-1", "Running", &[NGINX])),
        )
        .await;
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn resync_prunes_pods_the_cluster_no_longer_has() {
        let registry = InstanceRegistry::new();
        let (ready, ready_rx) = watch::channel(false);
        let mut resync = None;

        // State left over from before a disconnect.
        apply_pod(&registry, &pod("default", "stale-0", "worker-1", "Running", &[NGINX])).await;
        apply_pod(&registry, &pod("default", "live-0", "worker-2", "Running", &[NGINX])).await;
        assert_eq!(registry.count().await, 2);

        // Relist only sees live-0.
        handle_event(&registry, &ready, &mut resync, Event::Init).await;
        handle_event(
            &registry,
            &ready,
            &mut resync,
            Event::InitApply(pod("default", "live-0", "worker-2", "Running", &[NGINX])),
        )
        .await;
        handle_event(&registry, &ready, &mut resync, Event::InitDone).await;

        assert_eq!(registry.count().await, 1);
        assert!(registry.get("default", "stale-0", "app").await.is_none());
        assert!(*ready_rx.borrow());
    }

    #[tokio::test]
    async fn resync_keeps_non_running_pods_out() {
        let registry = InstanceRegistry::new();
        let (ready, _) = watch::channel(false);
        let mut resync = None;

        handle_event(&registry, &ready, &mut resync, Event::Init).await;
        handle_event(
            &registry,
            &ready,
            &mut resync,
            Event::InitApply(pod("default", "web-0", "worker-1", "Pending", &[NGINX])),
        )
        .await;
        handle_event(&registry, &ready, &mut resync, Event::InitDone).await;

        assert_eq!(registry.count().await, 0);
    }
}
