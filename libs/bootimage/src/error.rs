//! Errors returned by the bootstrap image service.

use std::io;

use thiserror::Error;

use crate::store::StoreError;

/// The coarse kind of an [`ImageError`], for callers that map errors to
/// responses or alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageErrorKind {
    NotFound,
    ObjectRead,
    ChecksumMismatch,
    Cancelled,
}

/// Errors from `get_bootstrap_image`.
///
/// Every variant is scoped to the single request that produced it. The pooled
/// buffer has already been returned by the time one of these is observed.
#[derive(Debug, Error)]
pub enum ImageError {
    /// No object exists for the requested id.
    #[error("bootstrap image not found: {key}")]
    NotFound { key: String },

    /// Any backend I/O failure, including short reads.
    #[error("failed to read object {key}: {source}")]
    ObjectRead {
        key: String,
        #[source]
        source: ReadFailure,
    },

    /// The bytes read do not checksum to the value the store recorded.
    #[error("checksum mismatch for {key}: stored {expected:08x}, computed {actual:08x}")]
    ChecksumMismatch {
        key: String,
        expected: u32,
        actual: u32,
    },

    /// The caller cancelled the request.
    #[error("request for {key} cancelled")]
    Cancelled { key: String },
}

impl ImageError {
    pub fn kind(&self) -> ImageErrorKind {
        match self {
            Self::NotFound { .. } => ImageErrorKind::NotFound,
            Self::ObjectRead { .. } => ImageErrorKind::ObjectRead,
            Self::ChecksumMismatch { .. } => ImageErrorKind::ChecksumMismatch,
            Self::Cancelled { .. } => ImageErrorKind::Cancelled,
        }
    }

    /// Object key the failing request resolved to.
    pub fn key(&self) -> &str {
        match self {
            Self::NotFound { key }
            | Self::ObjectRead { key, .. }
            | Self::ChecksumMismatch { key, .. }
            | Self::Cancelled { key } => key,
        }
    }

    pub(crate) fn read(key: &str, source: ReadFailure) -> Self {
        Self::ObjectRead {
            key: key.to_string(),
            source,
        }
    }
}

/// The underlying cause of an [`ImageError::ObjectRead`].
#[derive(Debug, Error)]
pub enum ReadFailure {
    #[error("metadata fetch failed after {attempts} attempt(s): {source}")]
    Metadata {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("stream open failed after {attempts} attempt(s): {source}")]
    Open {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("stream read failed after {copied} bytes: {source}")]
    Stream {
        copied: u64,
        #[source]
        source: io::Error,
    },

    #[error("buffer write failed after {copied} bytes: {source}")]
    BufferWrite {
        copied: u64,
        #[source]
        source: io::Error,
    },

    #[error("{} read: expected {expected} bytes, copied {copied}", mismatch_label(.copied, .expected))]
    SizeMismatch { expected: u64, copied: u64 },

    #[error("object is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },
}

fn mismatch_label(copied: &u64, expected: &u64) -> &'static str {
    if copied < expected {
        "short"
    } else {
        "long"
    }
}
