//! Pool of reusable byte buffers.
//!
//! Images are materialized in memory before they are served, so every request
//! needs a buffer the size of the image. The pool hands out buffers that have
//! already grown to that size on an earlier request instead of allocating and
//! regrowing a fresh `Vec` each time.
//!
//! A `PooledBuffer` is owned by exactly one request between `acquire` and
//! release. Release happens on `release()` or on drop, whichever comes first,
//! and the buffer is always truncated to zero length before another request
//! can see it.

use std::collections::TryReserveError;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;

/// Configuration for a buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Maximum number of idle buffers kept for reuse.
    pub max_idle: usize,

    /// Buffers that grew beyond this capacity are dropped instead of kept.
    pub max_retained_capacity: Option<usize>,
}

/// Default cap on the capacity of an idle buffer (64 MiB).
pub const DEFAULT_MAX_RETAINED_CAPACITY: usize = 64 * 1024 * 1024;

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 16,
            max_retained_capacity: Some(DEFAULT_MAX_RETAINED_CAPACITY),
        }
    }
}

/// Point-in-time pool accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers sitting in the pool.
    pub idle: usize,
    /// Buffers currently checked out.
    pub outstanding: u64,
    /// Buffers allocated because the pool was empty.
    pub allocated: u64,
    /// Acquisitions served from an idle buffer.
    pub reused: u64,
}

struct PoolInner {
    config: BufferPoolConfig,
    idle: Mutex<Vec<Vec<u8>>>,
    outstanding: AtomicU64,
    allocated: AtomicU64,
    reused: AtomicU64,
}

impl PoolInner {
    fn put_back(&self, mut buf: Vec<u8>) {
        buf.clear();
        self.outstanding.fetch_sub(1, Ordering::AcqRel);

        if let Some(limit) = self.config.max_retained_capacity {
            if buf.capacity() > limit {
                trace!(capacity = buf.capacity(), limit, "Dropping oversized buffer");
                return;
            }
        }

        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.config.max_idle {
            idle.push(buf);
        }
    }
}

/// Concurrency-safe pool of byte buffers. Cloning shares the same pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool with the given configuration.
    pub fn new(config: BufferPoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                idle: Mutex::new(Vec::new()),
                outstanding: AtomicU64::new(0),
                allocated: AtomicU64::new(0),
                reused: AtomicU64::new(0),
            }),
        }
    }

    /// Check out an empty buffer.
    pub fn acquire(&self) -> PooledBuffer {
        let recycled = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        let buf = match recycled {
            Some(buf) => {
                self.inner.reused.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.inner.allocated.fetch_add(1, Ordering::Relaxed);
                Vec::new()
            }
        };
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);

        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Return a buffer to the pool. Equivalent to dropping it.
    pub fn release(&self, buffer: PooledBuffer) {
        buffer.release();
    }

    /// Current accounting.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self
                .inner
                .idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            outstanding: self.inner.outstanding.load(Ordering::Acquire),
            allocated: self.inner.allocated.load(Ordering::Relaxed),
            reused: self.inner.reused.load(Ordering::Relaxed),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(BufferPoolConfig::default())
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A buffer checked out of a [`BufferPool`].
///
/// Goes back to its pool exactly once: on [`PooledBuffer::release`] or drop.
pub struct PooledBuffer {
    // Only `None` after the buffer has been handed back.
    buf: Option<Vec<u8>>,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    /// Append bytes.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        if let Some(buf) = self.buf.as_mut() {
            buf.extend_from_slice(data);
        }
    }

    /// Try to reserve room for at least `additional` more bytes.
    ///
    /// Unlike `Vec::reserve`, an allocation failure is returned instead of
    /// aborting the process.
    pub fn try_reserve(&mut self, additional: usize) -> Result<(), TryReserveError> {
        match self.buf.as_mut() {
            Some(buf) => buf.try_reserve(additional),
            None => Ok(()),
        }
    }

    /// Allocated capacity of the underlying buffer.
    pub fn capacity(&self) -> usize {
        self.buf.as_ref().map(Vec::capacity).unwrap_or(0)
    }

    /// Return the buffer to its pool now.
    pub fn release(mut self) {
        self.give_back();
    }

    fn give_back(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put_back(buf);
        }
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.give_back();
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
