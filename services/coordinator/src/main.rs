//! scanhub Coordinator
//!
//! The coordinator tracks which container images run on which cluster node
//! and serves SBOM requests, either from the persistent cache or by routing
//! them to the scanner agent on the node that runs the image.

use std::sync::Arc;

use anyhow::Result;
use scanhub_coordinator::{
    acquire::SbomCoordinator,
    agent::AgentClient,
    api,
    cache::FsSbomCache,
    config,
    locator::KubeScannerLocator,
    registry::InstanceRegistry,
    state::AppState,
    watcher,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SCANHUB_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting scanhub coordinator");
    info!(
        listen_addr = %config.listen_addr,
        agent_namespace = %config.agent_namespace,
        cache_dir = %config.cache_dir.display(),
        "Configuration loaded"
    );

    // Connect to the cluster API
    let client = match kube::Client::try_default().await {
        Ok(client) => {
            info!("Kubernetes client initialized");
            client
        }
        Err(e) => {
            error!(error = %e, "Failed to initialize Kubernetes client");
            return Err(e.into());
        }
    };

    // Create shutdown signals: the watch channel stops background workers,
    // the token cancels in-flight acquisition requests.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_token = CancellationToken::new();

    // Start the topology watcher in background
    let registry = Arc::new(InstanceRegistry::new());
    let (ready_tx, ready_rx) = watch::channel(false);
    let watcher_handle = tokio::spawn({
        let client = client.clone();
        let registry = Arc::clone(&registry);
        let shutdown_rx = shutdown_rx.clone();
        async move {
            if let Err(e) = watcher::run(client, registry, ready_tx, shutdown_rx).await {
                error!(error = %e, "Topology watcher failed");
            }
        }
    });

    // Assemble the acquisition coordinator
    let coordinator = SbomCoordinator::new(
        Arc::new(FsSbomCache::new(&config.cache_dir)),
        Arc::clone(&registry),
        Arc::new(KubeScannerLocator::new(client, &config.agent_namespace)),
        AgentClient::new(config.agent_port, config.agent_fetch_timeout),
        config.agent_ready_timeout,
    );

    // Create application state
    let state = AppState::new(coordinator, registry, ready_rx, shutdown_token.clone());

    // Build and run the server
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Signal shutdown to the watcher and cancel in-flight requests
    let _ = shutdown_tx.send(true);
    shutdown_token.cancel();

    // Wait for the watcher to finish
    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, watcher_handle).await {
        warn!(error = %e, "Topology watcher did not shut down in time");
    }

    info!("Coordinator shutdown complete");
    Ok(())
}
