//! Bootstrap image service: fetch an image by id and verify it.
//!
//! This is the main entry point of the crate. A request runs through these
//! steps, strictly in order:
//!
//! 1. Resolve the object key (`<namespace>/<id>`)
//! 2. Fetch metadata (retried)
//! 3. Open the object stream (retried)
//! 4. Acquire a pooled buffer
//! 5. Copy the stream through the digest pipeline, then close the stream
//! 6. Check the copied length against the metadata size
//! 7. Check the integrity checksum against the stored checksum
//! 8. Hand back the content hash and a body backed by the buffer
//!
//! Only steps 2 and 3 are retried. A failed copy is fatal to the request:
//! resuming a half-read stream would mean reopening and re-downloading it.

use std::io::{self, Read, Write};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument, Span};

use crate::digest::{
    ContentHash, ContentHashAlgorithm, ContentHasher, DigestPipeline, IntegrityAlgorithm,
    IntegrityHasher,
};
use crate::error::{ImageError, ReadFailure};
use crate::pool::{BufferPool, PooledBuffer};
use crate::retry::{RetryError, RetryPolicy};
use crate::store::{ObjectMetadata, ObjectReader, ObjectStore, StoreError};

/// Upper bound on buffer capacity reserved up front from reported metadata.
const MAX_PRESIZE_BYTES: u64 = 64 * 1024 * 1024;

/// Metadata of a served image, as recorded by the object store.
pub type ImageMetadata = ObjectMetadata;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Configuration for the image service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Key prefix under which images live.
    pub namespace: String,

    /// Retry policy for metadata fetch and stream open.
    pub retry: RetryPolicy,

    /// Checksum the object store records for each object.
    pub integrity: IntegrityAlgorithm,

    /// Hash exposed to callers as the image identity.
    pub content_hash: ContentHashAlgorithm,

    /// Refuse images larger than this many bytes.
    pub max_image_bytes: Option<u64>,

    /// Size of each read from the backend stream.
    pub read_chunk_bytes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            namespace: "bootstrap".to_string(),
            retry: RetryPolicy::default(),
            integrity: IntegrityAlgorithm::Crc32c,
            content_hash: ContentHashAlgorithm::Sha256,
            max_image_bytes: Some(4 * 1024 * 1024 * 1024), // 4 GiB
            read_chunk_bytes: 64 * 1024,
        }
    }
}

impl ServiceConfig {
    /// Check field values that would make the service misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() {
            return Err(invalid("namespace", "must not be empty"));
        }
        if self.namespace.starts_with('/') || self.namespace.ends_with('/') {
            return Err(invalid("namespace", "must not start or end with '/'"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(invalid("retry.multiplier", "must be at least 1.0"));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(invalid(
                "retry.initial_delay",
                "must not exceed retry.max_delay",
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(invalid("retry.jitter", "must be between 0.0 and 1.0"));
        }
        if self.read_chunk_bytes == 0 {
            return Err(invalid("read_chunk_bytes", "must be greater than 0"));
        }
        Ok(())
    }
}

/// Identifies the image to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    /// Opaque id, appended to the namespace to form the object key.
    pub id: String,
}

impl ImageRequest {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// A verified image.
#[derive(Debug)]
pub struct ImageResponse {
    /// Store metadata for the served object.
    pub metadata: ImageMetadata,
    /// Digest of the full body.
    pub content_hash: ContentHash,
    /// The image bytes.
    pub body: ImageBody,
}

impl ImageResponse {
    /// Entity tag derived from the content hash.
    pub fn etag(&self) -> String {
        self.content_hash.etag()
    }
}

/// Image bytes backed by a pooled buffer.
///
/// Reading yields the object's bytes in order. Closing (or dropping) the body
/// returns the buffer to its pool, whether or not it was read to the end.
pub struct ImageBody {
    buffer: PooledBuffer,
    pos: usize,
}

impl ImageBody {
    fn new(buffer: PooledBuffer) -> Self {
        Self { buffer, pos: 0 }
    }

    /// Total length of the image.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Bytes not yet read.
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.pos
    }

    /// The full image, regardless of read position.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Return the buffer to its pool.
    pub fn close(self) {
        self.buffer.release();
    }

    fn take_into(&mut self, dest: &mut [u8]) -> usize {
        let n = self.remaining().min(dest.len());
        dest[..n].copy_from_slice(&self.buffer[self.pos..self.pos + n]);
        self.pos += n;
        n
    }
}

impl Read for ImageBody {
    fn read(&mut self, dest: &mut [u8]) -> io::Result<usize> {
        Ok(self.take_into(dest))
    }
}

impl AsyncRead for ImageBody {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let n = self.remaining().min(buf.remaining());
        let start = self.pos;
        buf.put_slice(&self.buffer[start..start + n]);
        self.pos += n;
        Poll::Ready(Ok(()))
    }
}

impl std::fmt::Debug for ImageBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageBody")
            .field("len", &self.len())
            .field("pos", &self.pos)
            .finish()
    }
}

enum CopyError {
    Read { copied: u64, source: io::Error },
    Write { copied: u64, source: io::Error },
    Cancelled,
}

/// Copy `reader` to `sink` until EOF, an error, or cancellation. The reader
/// is closed before this returns on every path.
async fn copy_and_close<W: Write>(
    mut reader: ObjectReader,
    sink: &mut W,
    chunk_bytes: usize,
    cancel: &CancellationToken,
) -> Result<u64, CopyError> {
    let mut chunk = vec![0u8; chunk_bytes];
    let mut copied = 0u64;

    let result = loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Err(CopyError::Cancelled),
            read = reader.read(&mut chunk) => read,
        };

        let n = match read {
            Ok(0) => break Ok(copied),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => break Err(CopyError::Read { copied, source }),
        };

        if let Err(source) = sink.write_all(&chunk[..n]) {
            break Err(CopyError::Write { copied, source });
        }
        copied += n as u64;
    };

    drop(reader);
    result
}

/// Serves verified bootstrap images out of an object store.
pub struct BootstrapImageService {
    config: ServiceConfig,
    store: Arc<dyn ObjectStore>,
    pool: BufferPool,
    span: Span,
}

impl BootstrapImageService {
    /// Create a new service. Fails if `config` does not validate.
    pub fn new(
        config: ServiceConfig,
        store: Arc<dyn ObjectStore>,
        pool: BufferPool,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let span = info_span!("bootstrap_image_service", namespace = %config.namespace);

        Ok(Self {
            config,
            store,
            pool,
            span,
        })
    }

    /// Parent span for every request this service handles.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Object key for an image id. The id is used as-is.
    pub fn object_key(&self, id: &str) -> String {
        format!("{}/{}", self.config.namespace, id)
    }

    /// Fetch an image and verify it against the store's checksum.
    ///
    /// `cancel` aborts backend calls, backoff waits, and the copy. On every
    /// error path the backend stream is closed and the buffer is back in the
    /// pool before this returns.
    pub async fn get_bootstrap_image(
        &self,
        request: &ImageRequest,
        cancel: &CancellationToken,
    ) -> Result<ImageResponse, ImageError> {
        let key = self.object_key(&request.id);
        let span = info_span!(
            parent: &self.span,
            "get_bootstrap_image",
            image_id = %request.id,
            object_key = %key
        );

        self.fetch_verified(&key, cancel).instrument(span).await
    }

    async fn fetch_verified(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<ImageResponse, ImageError> {
        let metadata = self.fetch_metadata(key, cancel).await?;

        if let Some(limit) = self.config.max_image_bytes {
            if metadata.size_bytes > limit {
                error!(
                    object_bytes = metadata.size_bytes,
                    limit_bytes = limit,
                    "Object exceeds size limit"
                );
                return Err(ImageError::read(
                    key,
                    ReadFailure::TooLarge {
                        size: metadata.size_bytes,
                        limit,
                    },
                ));
            }
        }

        let reader = self.open_reader(key, cancel).await?;

        info!(
            object_bytes = metadata.size_bytes,
            object_generation = metadata.generation,
            "Reading bootstrap image"
        );

        // Reported size is unverified. Pre-size within a cap and let the
        // buffer grow as bytes arrive.
        let mut buffer = self.pool.acquire();
        let presize = metadata.size_bytes.min(MAX_PRESIZE_BYTES);
        if let Err(e) = buffer.try_reserve(usize::try_from(presize).unwrap_or(0)) {
            debug!(presize_bytes = presize, error = %e, "Could not pre-size buffer");
        }

        let mut integrity = IntegrityHasher::new(self.config.integrity);
        let mut content = ContentHasher::new(self.config.content_hash);

        let copied = {
            let mut pipeline = DigestPipeline::new(&mut integrity, &mut content, &mut buffer)
                .with_limit(self.config.max_image_bytes);
            copy_and_close(reader, &mut pipeline, self.config.read_chunk_bytes, cancel).await
        };

        let copied = match copied {
            Ok(copied) => copied,
            Err(err) => {
                buffer.release();
                return Err(self.copy_failed(key, &metadata, err));
            }
        };

        if copied != metadata.size_bytes {
            error!(
                object_bytes = metadata.size_bytes,
                copied_bytes = copied,
                "Failed to copy entire object to buffer"
            );
            buffer.release();
            return Err(ImageError::read(
                key,
                ReadFailure::SizeMismatch {
                    expected: metadata.size_bytes,
                    copied,
                },
            ));
        }

        let checksum = integrity.finalize();
        if !checksum.matches(metadata.stored_checksum) {
            error!(
                algorithm = %checksum.algorithm(),
                computed_checksum = checksum.value(),
                object_checksum = metadata.stored_checksum,
                object_generation = metadata.generation,
                "Checksum mismatch"
            );
            buffer.release();
            return Err(ImageError::ChecksumMismatch {
                key: key.to_string(),
                expected: metadata.stored_checksum,
                actual: checksum.value(),
            });
        }

        let content_hash = content.finalize();
        info!(
            object_bytes = metadata.size_bytes,
            object_generation = metadata.generation,
            content_hash = %content_hash,
            "Read bootstrap image"
        );

        Ok(ImageResponse {
            metadata,
            content_hash,
            body: ImageBody::new(buffer),
        })
    }

    async fn fetch_metadata(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<ImageMetadata, ImageError> {
        let result = self
            .config
            .retry
            .run("fetch_metadata", cancel, StoreError::is_retryable, || {
                self.store.fetch_metadata(key)
            })
            .await;

        result.map_err(|err| match err {
            RetryError::Cancelled { .. } => ImageError::Cancelled {
                key: key.to_string(),
            },
            RetryError::Failed {
                source: StoreError::NotFound(_),
                ..
            } => {
                info!("Bootstrap image not found");
                ImageError::NotFound {
                    key: key.to_string(),
                }
            }
            RetryError::Failed { attempts, source } => {
                error!(attempts, error = %source, "Failed to get object metadata");
                ImageError::read(key, ReadFailure::Metadata { attempts, source })
            }
        })
    }

    async fn open_reader(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<ObjectReader, ImageError> {
        let result = self
            .config
            .retry
            .run("open_reader", cancel, StoreError::is_retryable, || {
                self.store.open_reader(key)
            })
            .await;

        result.map_err(|err| match err {
            RetryError::Cancelled { .. } => ImageError::Cancelled {
                key: key.to_string(),
            },
            RetryError::Failed { attempts, source } => {
                error!(attempts, error = %source, "Failed to open object reader");
                ImageError::read(key, ReadFailure::Open { attempts, source })
            }
        })
    }

    fn copy_failed(&self, key: &str, metadata: &ImageMetadata, err: CopyError) -> ImageError {
        match err {
            CopyError::Cancelled => {
                info!(object_bytes = metadata.size_bytes, "Copy cancelled");
                ImageError::Cancelled {
                    key: key.to_string(),
                }
            }
            CopyError::Read { copied, source } => {
                error!(
                    object_bytes = metadata.size_bytes,
                    copied_bytes = copied,
                    error = %source,
                    "Failed to copy object to buffer"
                );
                ImageError::read(key, ReadFailure::Stream { copied, source })
            }
            CopyError::Write { copied, source } => {
                error!(
                    object_bytes = metadata.size_bytes,
                    copied_bytes = copied,
                    error = %source,
                    "Failed to write object to buffer"
                );
                ImageError::read(key, ReadFailure::BufferWrite { copied, source })
            }
        }
    }
}

impl std::fmt::Debug for BootstrapImageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapImageService")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}
