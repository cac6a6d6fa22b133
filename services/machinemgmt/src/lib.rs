//! Machine management service.
//!
//! Serves bootstrap images to provisioning clients over HTTP. Images are read
//! from an object store and verified by `infra-bootimage` before any byte is
//! sent.

pub mod api;
pub mod config;
pub mod state;

use std::sync::Arc;

use infra_bootimage::{BootstrapImageService, BufferPool, ConfigError, LocalDirObjectStore};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::state::AppState;

/// Build application state serving images from `config.image_root`.
pub fn build_state(config: &Config, shutdown: CancellationToken) -> Result<AppState, ConfigError> {
    let store = Arc::new(LocalDirObjectStore::new(&config.image_root));
    let pool = BufferPool::new(config.pool.clone());
    let images = BootstrapImageService::new(config.image.clone(), store, pool)?;

    Ok(AppState::new(images, shutdown))
}
