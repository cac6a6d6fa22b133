//! Integrity checksums, content hashes, and the fan-out writer that feeds them.
//!
//! Two digests are computed over every image:
//!
//! - an *integrity checksum* (CRC32C by default), compared against the value
//!   the object store recorded at write time, and
//! - a *content hash* (SHA-256 by default), handed to callers as the image's
//!   identity and cache key.

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

use crate::pool::PooledBuffer;

// =============================================================================
// Algorithms
// =============================================================================

/// Checksum used to detect corruption between the store and us.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityAlgorithm {
    /// CRC-32 with the Castagnoli polynomial.
    #[default]
    Crc32c,
    /// CRC-32 with the IEEE polynomial.
    Crc32,
}

impl IntegrityAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crc32c => "crc32c",
            Self::Crc32 => "crc32",
        }
    }

    /// Checksum a complete byte slice in one call.
    pub fn checksum(&self, data: &[u8]) -> u32 {
        let mut hasher = IntegrityHasher::new(*self);
        hasher.update(data);
        hasher.finalize().value()
    }
}

impl fmt::Display for IntegrityAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntegrityAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "crc32c" => Ok(Self::Crc32c),
            "crc32" => Ok(Self::Crc32),
            other => Err(format!("unknown integrity algorithm: {other}")),
        }
    }
}

/// Cryptographic hash used as the image identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentHashAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl ContentHashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Digest length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }

    /// Hash a complete byte slice in one call.
    pub fn hash(&self, data: &[u8]) -> ContentHash {
        let mut hasher = ContentHasher::new(*self);
        hasher.update(data);
        hasher.finalize()
    }
}

impl fmt::Display for ContentHashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentHashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(format!("unknown content hash algorithm: {other}")),
        }
    }
}

// =============================================================================
// Accumulators
// =============================================================================

enum IntegrityState {
    Crc32c(u32),
    Crc32(crc32fast::Hasher),
}

/// Running integrity checksum.
pub struct IntegrityHasher {
    state: IntegrityState,
}

impl IntegrityHasher {
    pub fn new(algorithm: IntegrityAlgorithm) -> Self {
        let state = match algorithm {
            IntegrityAlgorithm::Crc32c => IntegrityState::Crc32c(0),
            IntegrityAlgorithm::Crc32 => IntegrityState::Crc32(crc32fast::Hasher::new()),
        };
        Self { state }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            IntegrityState::Crc32c(crc) => *crc = crc32c::crc32c_append(*crc, data),
            IntegrityState::Crc32(hasher) => hasher.update(data),
        }
    }

    pub fn finalize(self) -> Checksum {
        match self.state {
            IntegrityState::Crc32c(crc) => Checksum {
                algorithm: IntegrityAlgorithm::Crc32c,
                value: crc,
            },
            IntegrityState::Crc32(hasher) => Checksum {
                algorithm: IntegrityAlgorithm::Crc32,
                value: hasher.finalize(),
            },
        }
    }
}

/// A finalized integrity checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checksum {
    algorithm: IntegrityAlgorithm,
    value: u32,
}

impl Checksum {
    pub fn algorithm(&self) -> IntegrityAlgorithm {
        self.algorithm
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    /// Big-endian bytes, the order object stores publish checksums in.
    pub fn to_be_bytes(&self) -> [u8; 4] {
        self.value.to_be_bytes()
    }

    /// Byte-for-byte comparison against a store-recorded checksum.
    pub fn matches(&self, stored: u32) -> bool {
        self.to_be_bytes() == stored.to_be_bytes()
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:08x}", self.algorithm, self.value)
    }
}

enum ContentState {
    Sha256(Sha256),
    Sha512(Sha512),
}

/// Running content hash.
pub struct ContentHasher {
    state: ContentState,
}

impl ContentHasher {
    pub fn new(algorithm: ContentHashAlgorithm) -> Self {
        let state = match algorithm {
            ContentHashAlgorithm::Sha256 => ContentState::Sha256(Sha256::new()),
            ContentHashAlgorithm::Sha512 => ContentState::Sha512(Sha512::new()),
        };
        Self { state }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            ContentState::Sha256(hasher) => hasher.update(data),
            ContentState::Sha512(hasher) => hasher.update(data),
        }
    }

    pub fn finalize(self) -> ContentHash {
        match self.state {
            ContentState::Sha256(hasher) => ContentHash {
                algorithm: ContentHashAlgorithm::Sha256,
                bytes: hasher.finalize().to_vec(),
            },
            ContentState::Sha512(hasher) => ContentHash {
                algorithm: ContentHashAlgorithm::Sha512,
                bytes: hasher.finalize().to_vec(),
            },
        }
    }
}

/// Digest of a complete image body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash {
    algorithm: ContentHashAlgorithm,
    bytes: Vec<u8>,
}

impl ContentHash {
    pub fn algorithm(&self) -> ContentHashAlgorithm {
        self.algorithm
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// URL-safe base64 with padding.
    pub fn to_base64_url(&self) -> String {
        URL_SAFE.encode(&self.bytes)
    }

    /// Entity tag value, e.g. `sha256/uU0nuZNNPgilLlLX2n2r-sSE7-N6U4DukIj3rOLvzek=`.
    pub fn etag(&self) -> String {
        format!("{}/{}", self.algorithm, self.to_base64_url())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.to_hex())
    }
}

// =============================================================================
// Fan-out writer
// =============================================================================

/// Writer that feeds every byte to the integrity checksum, the content hash,
/// and the pooled buffer, in that order within a single `write` call.
///
/// Nothing is buffered beyond the slice being written. The buffer is the
/// only destination that can refuse bytes (when `limit` would be exceeded);
/// in that case no destination sees the chunk.
pub struct DigestPipeline<'a> {
    integrity: &'a mut IntegrityHasher,
    content: &'a mut ContentHasher,
    sink: &'a mut PooledBuffer,
    limit: Option<u64>,
    written: u64,
}

impl<'a> DigestPipeline<'a> {
    pub fn new(
        integrity: &'a mut IntegrityHasher,
        content: &'a mut ContentHasher,
        sink: &'a mut PooledBuffer,
    ) -> Self {
        Self {
            integrity,
            content,
            sink,
            limit: None,
            written: 0,
        }
    }

    /// Refuse writes that would take the total past `limit` bytes.
    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    /// Total bytes accepted so far.
    pub fn written(&self) -> u64 {
        self.written
    }
}

impl Write for DigestPipeline<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let next = self.written + data.len() as u64;
        if let Some(limit) = self.limit {
            if next > limit {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    format!("buffer limit of {limit} bytes exceeded"),
                ));
            }
        }

        self.integrity.update(data);
        self.content.update(data);
        self.sink.extend_from_slice(data);
        self.written = next;

        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;

    #[test]
    fn test_crc32c_known_value() {
        // RFC 3720 check value.
        assert_eq!(IntegrityAlgorithm::Crc32c.checksum(b"123456789"), 0xe306_9283);
    }

    #[test]
    fn test_crc32_known_value() {
        assert_eq!(IntegrityAlgorithm::Crc32.checksum(b"123456789"), 0xcbf4_3926);
    }

    #[test]
    fn test_incremental_checksum_matches_one_shot() {
        let data = b"the quick brown fox jumps over the lazy dog";

        let mut hasher = IntegrityHasher::new(IntegrityAlgorithm::Crc32c);
        for chunk in data.chunks(5) {
            hasher.update(chunk);
        }

        let checksum = hasher.finalize();
        assert_eq!(checksum.value(), IntegrityAlgorithm::Crc32c.checksum(data));
        assert!(checksum.matches(IntegrityAlgorithm::Crc32c.checksum(data)));
    }

    #[test]
    fn test_sha256_hello_world() {
        let hash = ContentHashAlgorithm::Sha256.hash(b"hello world");
        assert_eq!(
            hash.to_hex(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(
            hash.etag(),
            "sha256/uU0nuZNNPgilLlLX2n2r-sSE7-N6U4DukIj3rOLvzek="
        );
    }

    #[test]
    fn test_sha512_length() {
        let hash = ContentHashAlgorithm::Sha512.hash(b"");
        assert_eq!(hash.as_bytes().len(), ContentHashAlgorithm::Sha512.output_len());
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!("CRC32C".parse::<IntegrityAlgorithm>(), Ok(IntegrityAlgorithm::Crc32c));
        assert_eq!("sha512".parse::<ContentHashAlgorithm>(), Ok(ContentHashAlgorithm::Sha512));
        assert!("md5".parse::<ContentHashAlgorithm>().is_err());
    }

    #[test]
    fn test_pipeline_fans_out_every_byte() {
        let pool = BufferPool::default();
        let mut buf = pool.acquire();
        let mut integrity = IntegrityHasher::new(IntegrityAlgorithm::Crc32c);
        let mut content = ContentHasher::new(ContentHashAlgorithm::Sha256);

        {
            let mut pipeline = DigestPipeline::new(&mut integrity, &mut content, &mut buf);
            pipeline.write_all(b"hello ").unwrap();
            pipeline.write_all(b"world").unwrap();
            assert_eq!(pipeline.written(), 11);
        }

        assert_eq!(&buf[..], b"hello world");
        assert_eq!(
            integrity.finalize().value(),
            IntegrityAlgorithm::Crc32c.checksum(b"hello world")
        );
        assert_eq!(content.finalize(), ContentHashAlgorithm::Sha256.hash(b"hello world"));
    }

    #[test]
    fn test_pipeline_limit_rejects_whole_chunk() {
        let pool = BufferPool::default();
        let mut buf = pool.acquire();
        let mut integrity = IntegrityHasher::new(IntegrityAlgorithm::Crc32c);
        let mut content = ContentHasher::new(ContentHashAlgorithm::Sha256);

        let mut pipeline =
            DigestPipeline::new(&mut integrity, &mut content, &mut buf).with_limit(Some(8));
        pipeline.write_all(b"12345").unwrap();
        let err = pipeline.write_all(b"6789").unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::OutOfMemory);
        assert_eq!(pipeline.written(), 5);
        drop(pipeline);
        assert_eq!(&buf[..], b"12345");
    }
}
