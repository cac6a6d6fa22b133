//! Bootstrap image retrieval and integrity verification.
//!
//! Provisioning clients fetch OS boot images through the machine-management
//! service. This library is the part of that path that matters: it streams an
//! image out of an object store, checksums and hashes every byte on the way
//! into a pooled buffer, and refuses to hand anything back unless the checksum
//! matches what the store recorded at write time.
//!
//! ## Architecture
//!
//! ```text
//! BootstrapImageService
//! ├── RetryPolicy      (metadata fetch, stream open)
//! ├── ObjectStore      (InMemoryObjectStore, LocalDirObjectStore)
//! ├── DigestPipeline   (integrity checksum + content hash + buffer)
//! └── BufferPool       (shared across requests)
//! ```
//!
//! ## Modules
//!
//! - `pool`: Reusable byte buffers
//! - `digest`: Checksum/hash accumulators and the fan-out writer
//! - `retry`: Bounded exponential backoff for idempotent backend calls
//! - `store`: Object store capability and backends
//! - `service`: The `get_bootstrap_image` orchestration

pub mod digest;
pub mod error;
pub mod pool;
pub mod retry;
pub mod service;
pub mod store;

pub use digest::{
    Checksum, ContentHash, ContentHashAlgorithm, ContentHasher, DigestPipeline,
    IntegrityAlgorithm, IntegrityHasher,
};
pub use error::{ImageError, ImageErrorKind, ReadFailure};
pub use pool::{BufferPool, BufferPoolConfig, PoolStats, PooledBuffer};
pub use retry::{RetryError, RetryPolicy};
pub use service::{
    BootstrapImageService, ConfigError, ImageBody, ImageMetadata, ImageRequest, ImageResponse,
    ServiceConfig,
};
pub use store::{
    InMemoryObjectStore, LocalDirObjectStore, ObjectMetadata, ObjectReader, ObjectStore,
    StoreError,
};
