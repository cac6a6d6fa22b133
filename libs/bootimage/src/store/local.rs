//! Object store backed by a local directory.
//!
//! Each object is a regular file under the root. Its metadata lives next to it
//! in a JSON sidecar named `<file>.meta.json`:
//!
//! ```json
//! { "generation": 3, "checksum": 3381945770 }
//! ```
//!
//! The sidecar is written by whatever publishes the image, at the same time
//! as the image itself, so the checksum plays the same role as one recorded
//! by a cloud object store at upload time.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ObjectMetadata, ObjectReader, ObjectStore, StoreError};

/// Suffix appended to an object's file name to find its metadata.
pub const SIDECAR_SUFFIX: &str = ".meta.json";

/// Contents of a metadata sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarMetadata {
    /// Version of the object, bumped by the publisher on every overwrite.
    pub generation: i64,
    /// Integrity checksum of the object bytes.
    pub checksum: u32,
}

/// Object store reading from files under `root`.
#[derive(Debug, Clone)]
pub struct LocalDirObjectStore {
    root: PathBuf,
}

impl LocalDirObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `key` to a file path under the root.
    ///
    /// Keys may not be empty, absolute, contain `..`, or name a sidecar.
    pub fn object_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.ends_with(SIDECAR_SUFFIX) {
            return Err(StoreError::InvalidKey(key.to_string()));
        }

        let mut path = self.root.clone();
        let mut depth = 0;
        for component in Path::new(key).components() {
            match component {
                Component::Normal(part) => {
                    path.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(StoreError::InvalidKey(key.to_string()));
                }
            }
        }

        if depth == 0 {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(path)
    }

    fn sidecar_path(object_path: &Path) -> PathBuf {
        let mut name = object_path.as_os_str().to_os_string();
        name.push(SIDECAR_SUFFIX);
        PathBuf::from(name)
    }
}

#[async_trait]
impl ObjectStore for LocalDirObjectStore {
    async fn fetch_metadata(&self, key: &str) -> Result<ObjectMetadata, StoreError> {
        let path = self.object_path(key)?;

        let file_meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| StoreError::from_io(key, e))?;
        if !file_meta.is_file() {
            return Err(StoreError::NotFound(key.to_string()));
        }

        let sidecar_path = Self::sidecar_path(&path);
        let raw = tokio::fs::read(&sidecar_path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::BadMetadata {
                key: key.to_string(),
                reason: format!("missing sidecar {}", sidecar_path.display()),
            },
            _ => StoreError::from_io(key, e),
        })?;
        let sidecar: SidecarMetadata =
            serde_json::from_slice(&raw).map_err(|e| StoreError::BadMetadata {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        debug!(key = %key, path = %path.display(), "Loaded object metadata");

        Ok(ObjectMetadata {
            size_bytes: file_meta.len(),
            generation: sidecar.generation,
            stored_checksum: sidecar.checksum,
        })
    }

    async fn open_reader(&self, key: &str) -> Result<ObjectReader, StoreError> {
        let path = self.object_path(key)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| StoreError::from_io(key, e))?;
        Ok(Box::new(file))
    }
}
