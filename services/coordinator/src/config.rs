use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::agent::AGENT_PROCESSING_TIMEOUT;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,

    /// Namespace the scanner agents are deployed in.
    pub agent_namespace: String,

    /// Port the scanner agents serve their SBOM endpoint on.
    pub agent_port: u16,

    /// Outbound budget for one SBOM fetch. Must exceed
    /// [`AGENT_PROCESSING_TIMEOUT`] so the agent times out first.
    pub agent_fetch_timeout: Duration,

    /// How long to wait for a scheduled-but-not-ready agent.
    pub agent_ready_timeout: Duration,

    /// Directory the SBOM cache lives in.
    pub cache_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("SCANHUB_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()?;

        let log_level = std::env::var("SCANHUB_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let agent_namespace =
            std::env::var("SCANHUB_AGENT_NAMESPACE").unwrap_or_else(|_| "scanhub".to_string());

        let agent_port: u16 = std::env::var("SCANHUB_AGENT_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()?;

        let agent_fetch_timeout = Duration::from_secs(
            std::env::var("SCANHUB_AGENT_FETCH_TIMEOUT_SECS")
                .unwrap_or_else(|_| "330".to_string())
                .parse()?,
        );
        if agent_fetch_timeout <= AGENT_PROCESSING_TIMEOUT {
            bail!(
                "SCANHUB_AGENT_FETCH_TIMEOUT_SECS must exceed the agent processing timeout ({}s)",
                AGENT_PROCESSING_TIMEOUT.as_secs()
            );
        }

        let agent_ready_timeout = Duration::from_secs(
            std::env::var("SCANHUB_AGENT_READY_TIMEOUT_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()?,
        );

        let cache_dir = std::env::var("SCANHUB_CACHE_DIR")
            .unwrap_or_else(|_| "/var/lib/scanhub/sboms".to_string())
            .into();

        Ok(Self {
            listen_addr,
            log_level,
            agent_namespace,
            agent_port,
            agent_fetch_timeout,
            agent_ready_timeout,
            cache_dir,
        })
    }
}
