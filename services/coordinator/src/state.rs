//! Application state shared across request handlers.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::acquire::SbomCoordinator;
use crate::registry::InstanceRegistry;

/// Shared application state.
///
/// Passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    coordinator: SbomCoordinator,
    registry: Arc<InstanceRegistry>,
    topology_ready: watch::Receiver<bool>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        coordinator: SbomCoordinator,
        registry: Arc<InstanceRegistry>,
        topology_ready: watch::Receiver<bool>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                coordinator,
                registry,
                topology_ready,
                shutdown,
            }),
        }
    }

    pub fn coordinator(&self) -> &SbomCoordinator {
        &self.inner.coordinator
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.inner.registry
    }

    /// Whether the first topology resync has completed.
    pub fn topology_ready(&self) -> bool {
        *self.inner.topology_ready.borrow()
    }

    /// Cancellation token for one request, tied to service shutdown.
    pub fn request_token(&self) -> CancellationToken {
        self.inner.shutdown.child_token()
    }
}
