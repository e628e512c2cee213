//! HTTP client for per-node scanner agents.
//!
//! One outbound call per acquisition: `GET http://{address}:{port}/sbom/{digest}`.
//! The call races the caller's cancellation token, and its outcome is
//! classified into remote / timeout / cancelled / transport so the
//! coordinator can map each onto a distinct externally-visible result.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Processing timeout the agent documents for a single SBOM request.
///
/// The coordinator's outbound budget must stay strictly above this, so the
/// agent times out (and reports why) before the coordinator gives up on it.
pub const AGENT_PROCESSING_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors from an SBOM fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("scanner agent returned status {status}")]
    Remote { status: u16 },

    #[error("sbom fetch from {address} exceeded its deadline")]
    Timeout { address: String },

    #[error("sbom fetch was cancelled")]
    Cancelled,

    #[error("transport error talking to scanner agent: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Client for the scanner agents' SBOM endpoint.
pub struct AgentClient {
    client: reqwest::Client,
    port: u16,
    fetch_timeout: Duration,
}

impl AgentClient {
    /// `fetch_timeout` is the per-request budget; [`Config`](crate::config::Config)
    /// validates that it exceeds [`AGENT_PROCESSING_TIMEOUT`].
    pub fn new(port: u16, fetch_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            port,
            fetch_timeout,
        }
    }

    /// Fetch the SBOM for `digest` from the agent at `address`.
    pub async fn fetch_sbom(
        &self,
        address: &str,
        digest: &str,
        cancel: &CancellationToken,
    ) -> Result<Bytes, FetchError> {
        let url = format!("http://{address}:{}/sbom/{digest}", self.port);
        debug!(url = %url, "Fetching SBOM from scanner agent");

        let request = self.client.get(&url).timeout(self.fetch_timeout).send();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = request => match result {
                Ok(response) if response.status().is_success() => {
                    let bytes = response
                        .bytes()
                        .await
                        .map_err(|error| classify_transport(error, address))?;
                    debug!(url = %url, size = bytes.len(), "Fetched SBOM");
                    Ok(bytes)
                }
                Ok(response) => Err(FetchError::Remote {
                    status: response.status().as_u16(),
                }),
                Err(error) => Err(classify_transport(error, address)),
            }
        }
    }
}

fn classify_transport(error: reqwest::Error, address: &str) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout {
            address: address.to_string(),
        }
    } else {
        FetchError::Transport(error)
    }
}
