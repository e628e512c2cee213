//! SBOM acquisition coordinator.
//!
//! Drives one request through cache lookup, registry lookup, agent
//! location, bounded readiness wait, remote fetch, and cache write-back.
//! This is the single place where helper failures are folded into the
//! externally visible outcome set; everything below it returns its own
//! narrower error type.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use scanhub_imageref::normalize_digest;

use crate::agent::{AgentClient, FetchError};
use crate::cache::SbomCache;
use crate::locator::{LocatorError, ScannerLocator};
use crate::registry::InstanceRegistry;

/// Terminal outcomes of one acquisition, beyond success.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// Client sent no digest. Never retried.
    #[error("missing image digest")]
    EmptyDigest,

    /// No running instance carries this digest.
    #[error("image not found in cluster")]
    NotFoundInCluster,

    /// An instance exists but reports no node, so there is nowhere to route.
    #[error("image not available on any cluster node")]
    NoNode,

    /// No agent pod is assigned to the node; waiting would be pointless.
    #[error("no scanner agent is scheduled on node {node}")]
    NotScheduled { node: String },

    /// An agent is scheduled on the node but did not become ready in time.
    #[error("scanner agent on node {node} did not become ready in time")]
    WaitTimeout { node: String },

    /// The remote fetch exceeded its deadline.
    #[error("sbom fetch from node {node} exceeded its deadline")]
    FetchTimeout { node: String },

    /// The agent answered with a non-success status.
    #[error("scanner agent on node {node} returned status {status}")]
    RemoteError { node: String, status: u16 },

    /// The caller cancelled while we were waiting or fetching.
    #[error("request was cancelled")]
    Cancelled,

    /// Transport-level failure talking to the agent.
    #[error("fetching sbom from node {node}: {source}")]
    AgentUnreachable {
        node: String,
        #[source]
        source: reqwest::Error,
    },

    /// Locator queries against the orchestrator failed.
    #[error("locating scanner agent for node {node}: {source}")]
    Locate {
        node: String,
        #[source]
        source: LocatorError,
    },
}

/// Coordinates SBOM acquisition across cache, registry, locator, and agents.
pub struct SbomCoordinator {
    cache: Arc<dyn SbomCache>,
    registry: Arc<InstanceRegistry>,
    locator: Arc<dyn ScannerLocator>,
    agent: AgentClient,
    ready_timeout: Duration,
}

impl SbomCoordinator {
    pub fn new(
        cache: Arc<dyn SbomCache>,
        registry: Arc<InstanceRegistry>,
        locator: Arc<dyn ScannerLocator>,
        agent: AgentClient,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            registry,
            locator,
            agent,
            ready_timeout,
        }
    }

    /// Produce the SBOM for `digest`, from cache or from the node running
    /// the image.
    pub async fn acquire(
        &self,
        digest: &str,
        cancel: &CancellationToken,
    ) -> Result<Bytes, AcquireError> {
        if digest.is_empty() {
            return Err(AcquireError::EmptyDigest);
        }
        let digest = normalize_digest(digest);

        // Fast path: a non-empty cache hit answers without touching the
        // registry or any node.
        match self.cache.get(&digest).await {
            Ok(Some(sbom)) if !sbom.is_empty() => {
                debug!(digest = %digest, "SBOM served from cache");
                return Ok(sbom);
            }
            Ok(_) => {}
            // The cache is best-effort on the read side too: a failed
            // lookup degrades to a miss instead of failing the request.
            Err(error) => warn!(digest = %digest, error = %error, "Cache lookup failed"),
        }

        let placement = self
            .registry
            .find_node_for_image_digest(&digest)
            .await
            .ok_or(AcquireError::NotFoundInCluster)?;
        if placement.node_name.is_empty() {
            return Err(AcquireError::NoNode);
        }
        let node = placement.node_name;

        let address = self.route(&node, cancel).await?;
        info!(digest = %digest, node = %node, address = %address, "Routing SBOM request");

        let sbom = self
            .agent
            .fetch_sbom(&address, &digest, cancel)
            .await
            .map_err(|error| classify_fetch(error, &node))?;

        // Write-back is best-effort: the caller already has its bytes.
        if let Err(error) = self.cache.put(&digest, &sbom).await {
            warn!(digest = %digest, error = %error, "Cache write-back failed");
        }

        Ok(sbom)
    }

    /// Resolve the agent address for `node`, waiting a bounded time when the
    /// agent is scheduled but not serving yet.
    async fn route(
        &self,
        node: &str,
        cancel: &CancellationToken,
    ) -> Result<String, AcquireError> {
        let locate_error = |source| AcquireError::Locate {
            node: node.to_string(),
            source,
        };

        if let Some(address) = self.locator.locate(node).await.map_err(locate_error)? {
            return Ok(address);
        }

        if !self.locator.is_scheduled(node).await.map_err(locate_error)? {
            // Nothing is assigned and nothing will be; waiting cannot help.
            return Err(AcquireError::NotScheduled {
                node: node.to_string(),
            });
        }

        info!(node, "Scanner agent scheduled but not ready, waiting");
        match self
            .locator
            .wait_until_ready(node, self.ready_timeout, cancel)
            .await
        {
            Ok(address) => Ok(address),
            Err(LocatorError::Timeout { .. }) => Err(AcquireError::WaitTimeout {
                node: node.to_string(),
            }),
            Err(LocatorError::Cancelled { .. }) => Err(AcquireError::Cancelled),
            Err(error @ LocatorError::Api(_)) => Err(locate_error(error)),
        }
    }
}

fn classify_fetch(error: FetchError, node: &str) -> AcquireError {
    match error {
        FetchError::Remote { status } => AcquireError::RemoteError {
            node: node.to_string(),
            status,
        },
        FetchError::Timeout { .. } => AcquireError::FetchTimeout {
            node: node.to_string(),
        },
        FetchError::Cancelled => AcquireError::Cancelled,
        FetchError::Transport(source) => AcquireError::AgentUnreachable {
            node: node.to_string(),
            source,
        },
    }
}
