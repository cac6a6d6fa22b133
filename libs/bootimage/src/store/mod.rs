//! Object store capability.
//!
//! The image service needs exactly two things from a backend: object metadata
//! (size, generation, stored checksum) and a byte stream. Any backend that can
//! provide both is interchangeable.
//!
//! Implementations:
//! - `InMemoryObjectStore`: For tests, with fault injection
//! - `LocalDirObjectStore`: Files on disk with JSON metadata sidecars

use std::io::{self, ErrorKind};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

mod local;
mod memory;

pub use local::{LocalDirObjectStore, SidecarMetadata, SIDECAR_SUFFIX};
pub use memory::{InMemoryObjectStore, StreamBehavior};

/// A readable stream of object bytes. Dropping it closes the backend stream.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// Metadata recorded by the store for one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMetadata {
    /// Object size in bytes.
    pub size_bytes: u64,
    /// Store-assigned version, increasing on every overwrite.
    pub generation: i64,
    /// Integrity checksum computed by the store when the object was written.
    pub stored_checksum: u32,
}

/// Errors from object store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("object {key} has no usable metadata: {reason}")]
    BadMetadata { key: String, reason: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Whether repeating the same call might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotFound(_)
            | Self::InvalidKey(_)
            | Self::PermissionDenied(_)
            | Self::BadMetadata { .. } => false,
            Self::Unavailable(_) => true,
            Self::Io(e) => !matches!(
                e.kind(),
                ErrorKind::NotFound | ErrorKind::PermissionDenied | ErrorKind::InvalidInput
            ),
        }
    }

    /// Map an I/O error for `key`, keeping not-found and permission failures
    /// distinguishable.
    pub fn from_io(key: &str, err: io::Error) -> Self {
        match err.kind() {
            ErrorKind::NotFound => Self::NotFound(key.to_string()),
            ErrorKind::PermissionDenied => Self::PermissionDenied(key.to_string()),
            _ => Self::Io(err),
        }
    }
}

/// Backend capability consumed by the image service.
///
/// Both methods must be idempotent; the service retries them.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch size, generation, and stored checksum for `key`.
    async fn fetch_metadata(&self, key: &str) -> Result<ObjectMetadata, StoreError>;

    /// Open a byte stream over the object's contents.
    async fn open_reader(&self, key: &str) -> Result<ObjectReader, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(!StoreError::NotFound("k".into()).is_retryable());
        assert!(!StoreError::InvalidKey("k".into()).is_retryable());
        assert!(StoreError::Unavailable("503".into()).is_retryable());
        assert!(StoreError::Io(io::Error::new(ErrorKind::ConnectionReset, "reset")).is_retryable());
        assert!(!StoreError::Io(io::Error::new(ErrorKind::NotFound, "gone")).is_retryable());
    }

    #[test]
    fn test_from_io_maps_not_found() {
        let err = StoreError::from_io("bootstrap/a.img", io::Error::from(ErrorKind::NotFound));
        assert!(matches!(err, StoreError::NotFound(key) if key == "bootstrap/a.img"));
    }
}
