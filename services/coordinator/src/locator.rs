//! Node-scanner locator.
//!
//! Scanner agents run as one pod per node, labeled with a fixed component
//! label. The locator answers three questions about a node: is an agent
//! serving there (and at which address), is one at least scheduled there,
//! and, bounded by a deadline, when does one become ready.
//!
//! Agent state is recomputed from a fresh pod list on every query, never
//! cached: readiness changes behind our back and a stale answer would make
//! the coordinator wait on a node that lost its agent.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use thiserror::Error;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Label selecting scanner-agent pods.
pub const AGENT_LABEL_SELECTOR: &str = "app.kubernetes.io/component=scanner-agent";

/// Interval between readiness polls in [`ScannerLocator::wait_until_ready`].
pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Errors from locator queries.
#[derive(Debug, Error)]
pub enum LocatorError {
    #[error("kubernetes api error: {0}")]
    Api(#[from] kube::Error),

    #[error("no scanner agent became ready on node {node} within {timeout:?}")]
    Timeout { node: String, timeout: Duration },

    #[error("wait for scanner agent on node {node} was cancelled")]
    Cancelled { node: String },
}

/// Discovers the per-node scanner agent.
#[async_trait]
pub trait ScannerLocator: Send + Sync {
    /// Address of a serving agent on `node`, if any.
    async fn locate(&self, node: &str) -> Result<Option<String>, LocatorError>;

    /// Whether an agent pod is assigned to `node` but not serving yet
    /// (Pending, or Running without an address). Distinguishes "will become
    /// ready" from "the orchestrator will never place an agent here".
    async fn is_scheduled(&self, node: &str) -> Result<bool, LocatorError>;

    /// Poll [`locate`](Self::locate) every [`READY_POLL_INTERVAL`] until an
    /// address appears, the deadline passes, or the caller cancels. Timeout
    /// and cancellation are distinct errors.
    async fn wait_until_ready(
        &self,
        node: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, LocatorError> {
        let deadline = Instant::now() + timeout;
        let mut poll = interval(READY_POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(LocatorError::Cancelled {
                        node: node.to_string(),
                    });
                }
                _ = sleep_until(deadline) => {
                    return Err(LocatorError::Timeout {
                        node: node.to_string(),
                        timeout,
                    });
                }
                _ = poll.tick() => {
                    if let Some(address) = self.locate(node).await? {
                        return Ok(address);
                    }
                    debug!(node, "Scanner agent not ready yet");
                }
            }
        }
    }
}

/// Locator backed by the Kubernetes API.
///
/// Lists agent pods by [`AGENT_LABEL_SELECTOR`] in the configured agent
/// namespace. The namespace is an explicit constructor argument; defaulting
/// happens once, in [`Config`](crate::config::Config), not here.
pub struct KubeScannerLocator {
    pods: Api<Pod>,
}

impl KubeScannerLocator {
    pub fn new(client: Client, agent_namespace: &str) -> Self {
        Self {
            pods: Api::namespaced(client, agent_namespace),
        }
    }

    async fn list_agent_pods(&self) -> Result<Vec<Pod>, LocatorError> {
        let params = ListParams::default().labels(AGENT_LABEL_SELECTOR);
        Ok(self.pods.list(&params).await?.items)
    }
}

#[async_trait]
impl ScannerLocator for KubeScannerLocator {
    async fn locate(&self, node: &str) -> Result<Option<String>, LocatorError> {
        Ok(select_serving_agent(&self.list_agent_pods().await?, node))
    }

    async fn is_scheduled(&self, node: &str) -> Result<bool, LocatorError> {
        Ok(has_scheduled_agent(&self.list_agent_pods().await?, node))
    }
}

fn pod_node(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref()?.node_name.as_deref()
}

fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

fn pod_address(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()?
        .pod_ip
        .as_deref()
        .filter(|ip| !ip.is_empty())
}

/// Address of a Running agent pod with an address on `node`.
///
/// Several matches only happen during agent rollout; the smallest pod name
/// wins so the answer does not depend on API list order.
fn select_serving_agent(pods: &[Pod], node: &str) -> Option<String> {
    pods.iter()
        .filter(|pod| pod_node(pod) == Some(node) && pod_phase(pod) == Some("Running"))
        .filter_map(|pod| pod_address(pod).map(|address| (pod.name_any(), address)))
        .min_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, address)| address.to_string())
}

/// Whether an agent pod is assigned to `node` but not serving yet.
fn has_scheduled_agent(pods: &[Pod], node: &str) -> bool {
    pods.iter()
        .filter(|pod| pod_node(pod) == Some(node))
        .any(|pod| match pod_phase(pod) {
            Some("Pending") => true,
            Some("Running") => pod_address(pod).is_none(),
            _ => false,
        })
}
