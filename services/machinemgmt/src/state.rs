//! Application state shared across request handlers.

use std::sync::Arc;

use infra_bootimage::BootstrapImageService;
use tokio_util::sync::CancellationToken;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    images: BootstrapImageService,
    shutdown: CancellationToken,
}

impl AppState {
    /// Create a new application state.
    ///
    /// Each request derives its own cancellation token from `shutdown`.
    pub fn new(images: BootstrapImageService, shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(AppStateInner { images, shutdown }),
        }
    }

    /// Get a reference to the bootstrap image service.
    pub fn images(&self) -> &BootstrapImageService {
        &self.inner.images
    }

    /// Token cancelled when the server begins shutting down.
    pub fn shutdown(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    /// True once shutdown has started.
    pub fn is_draining(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}
