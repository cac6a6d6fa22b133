//! In-memory object store for tests.
//!
//! Besides holding objects, it can be told to fail the next N metadata or
//! open calls with a transient error, to cut a stream short, to fail or stall
//! a stream part way through, to misreport sizes, and to record a wrong
//! checksum. Call counters let tests assert how many attempts the retry
//! policy made.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};

use super::{ObjectMetadata, ObjectReader, ObjectStore, StoreError};
use crate::digest::IntegrityAlgorithm;

/// How the stream returned by `open_reader` behaves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamBehavior {
    /// Yield every byte, then EOF.
    #[default]
    Complete,
    /// Yield the first N bytes, then EOF.
    TruncateAt(usize),
    /// Yield the first N bytes, then fail with a connection reset.
    FailAfter(usize),
    /// Yield the first N bytes, then never make progress again.
    StallAfter(usize),
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    generation: i64,
    stored_checksum: u32,
    reported_size: Option<u64>,
    stream: StreamBehavior,
}

#[derive(Debug, Default)]
struct Inner {
    objects: HashMap<String, StoredObject>,
    next_generation: i64,
    metadata_failures: u32,
    open_failures: u32,
}

/// In-memory object store. Clones share the same objects and counters.
#[derive(Debug, Clone)]
pub struct InMemoryObjectStore {
    inner: Arc<Mutex<Inner>>,
    algorithm: IntegrityAlgorithm,
    chunk_size: usize,
    metadata_calls: Arc<AtomicU32>,
    open_calls: Arc<AtomicU32>,
}

impl InMemoryObjectStore {
    /// Create an empty store that checksums objects with CRC32C.
    pub fn new() -> Self {
        Self::with_algorithm(IntegrityAlgorithm::Crc32c)
    }

    /// Create an empty store that checksums objects with `algorithm`.
    pub fn with_algorithm(algorithm: IntegrityAlgorithm) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            algorithm,
            chunk_size: 4096,
            metadata_calls: Arc::new(AtomicU32::new(0)),
            open_calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Maximum bytes returned by a single read from an opened stream.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an object, computing its checksum the way a real store would.
    pub fn insert(&self, key: &str, data: impl Into<Bytes>) -> ObjectMetadata {
        let data = data.into();
        let checksum = self.algorithm.checksum(&data);
        self.insert_with_checksum(key, data, checksum)
    }

    /// Store an object with an explicit (possibly wrong) checksum.
    pub fn insert_with_checksum(
        &self,
        key: &str,
        data: impl Into<Bytes>,
        stored_checksum: u32,
    ) -> ObjectMetadata {
        let data = data.into();
        let mut inner = self.lock();
        inner.next_generation += 1;

        let object = StoredObject {
            generation: inner.next_generation,
            stored_checksum,
            reported_size: None,
            stream: StreamBehavior::Complete,
            data,
        };
        let metadata = object.metadata();
        inner.objects.insert(key.to_string(), object);
        metadata
    }

    /// Store an object whose metadata reports `size_bytes` instead of the
    /// real length. The checksum is still computed over the real bytes.
    pub fn insert_with_size(
        &self,
        key: &str,
        data: impl Into<Bytes>,
        size_bytes: u64,
    ) -> ObjectMetadata {
        let metadata = self.insert(key, data);
        if let Some(object) = self.lock().objects.get_mut(key) {
            object.reported_size = Some(size_bytes);
        }
        ObjectMetadata {
            size_bytes,
            ..metadata
        }
    }

    /// Change how the stream for `key` behaves. Returns false if absent.
    pub fn set_stream_behavior(&self, key: &str, behavior: StreamBehavior) -> bool {
        match self.lock().objects.get_mut(key) {
            Some(object) => {
                object.stream = behavior;
                true
            }
            None => false,
        }
    }

    /// Remove an object.
    pub fn remove(&self, key: &str) -> bool {
        self.lock().objects.remove(key).is_some()
    }

    /// Fail the next `n` metadata calls with a transient error.
    pub fn fail_next_metadata(&self, n: u32) {
        self.lock().metadata_failures = n;
    }

    /// Fail the next `n` open calls with a transient error.
    pub fn fail_next_open(&self, n: u32) {
        self.lock().open_failures = n;
    }

    /// Number of `fetch_metadata` calls made so far.
    pub fn metadata_calls(&self) -> u32 {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    /// Number of `open_reader` calls made so far.
    pub fn open_calls(&self) -> u32 {
        self.open_calls.load(Ordering::SeqCst)
    }

    /// Reset both call counters.
    pub fn reset_counters(&self) {
        self.metadata_calls.store(0, Ordering::SeqCst);
        self.open_calls.store(0, Ordering::SeqCst);
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StoredObject {
    fn metadata(&self) -> ObjectMetadata {
        ObjectMetadata {
            size_bytes: self.reported_size.unwrap_or(self.data.len() as u64),
            generation: self.generation,
            stored_checksum: self.stored_checksum,
        }
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn fetch_metadata(&self, key: &str) -> Result<ObjectMetadata, StoreError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.lock();

        if inner.metadata_failures > 0 {
            inner.metadata_failures -= 1;
            return Err(StoreError::Unavailable(format!(
                "injected metadata failure for {key}"
            )));
        }

        inner
            .objects
            .get(key)
            .map(StoredObject::metadata)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn open_reader(&self, key: &str) -> Result<ObjectReader, StoreError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.lock();

        if inner.open_failures > 0 {
            inner.open_failures -= 1;
            return Err(StoreError::Unavailable(format!(
                "injected open failure for {key}"
            )));
        }

        let object = inner
            .objects
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        Ok(Box::new(MemoryReader::new(
            object.data.clone(),
            object.stream,
            self.chunk_size,
        )))
    }
}

struct MemoryReader {
    data: Bytes,
    pos: usize,
    end: usize,
    chunk_size: usize,
    behavior: StreamBehavior,
}

impl MemoryReader {
    fn new(data: Bytes, behavior: StreamBehavior, chunk_size: usize) -> Self {
        let end = match behavior {
            StreamBehavior::Complete => data.len(),
            StreamBehavior::TruncateAt(n)
            | StreamBehavior::FailAfter(n)
            | StreamBehavior::StallAfter(n) => n.min(data.len()),
        };

        Self {
            data,
            pos: 0,
            end,
            chunk_size,
            behavior,
        }
    }
}

impl AsyncRead for MemoryReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos >= self.end {
            return match self.behavior {
                StreamBehavior::FailAfter(_) => Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "injected stream failure",
                ))),
                StreamBehavior::StallAfter(_) => Poll::Pending,
                StreamBehavior::Complete | StreamBehavior::TruncateAt(_) => Poll::Ready(Ok(())),
            };
        }

        let n = (self.end - self.pos)
            .min(self.chunk_size)
            .min(buf.remaining());
        let start = self.pos;
        buf.put_slice(&self.data[start..start + n]);
        self.pos += n;

        Poll::Ready(Ok(()))
    }
}
