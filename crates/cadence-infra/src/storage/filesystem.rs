//! Local filesystem object store.
//!
//! Implements `ObjectStore` from `cadence-core` with every object stored at
//! `{root}/{key}`. Writes go to a sibling temp file that is renamed over the
//! target, so a reader sees the old contents or the new contents and never a
//! torn write. Keys are validated before they touch the filesystem.
//!
//! ```text
//! {root}/
//!   blobs/sha256/ab/abcdef...                    content-addressed payloads
//!   tenants/{tenant}/runs/{run}/{stage}/{type}   pointer files (digest text)
//! ```

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use cadence_core::storage::object_store::ObjectStore;
use cadence_types::error::StoreError;
use uuid::Uuid;

/// Filesystem-backed object store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path under the root, rejecting anything that could escape it.
    fn resolve(&self, key: &str) -> Result<PathBuf, StoreError> {
        let invalid = |reason: &str| StoreError::InvalidPath {
            segment: key.to_string(),
            reason: reason.to_string(),
        };

        if key.is_empty() {
            return Err(invalid("empty key"));
        }
        if key.contains('\\') || key.contains('\0') {
            return Err(invalid("illegal character"));
        }
        if key.split('/').any(|segment| segment.is_empty()) {
            return Err(invalid("empty segment"));
        }

        let relative = Path::new(key);
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                Component::ParentDir => return Err(invalid("path traversal")),
                _ => return Err(invalid("key must be a plain relative path")),
            }
        }
        Ok(self.root.join(relative))
    }
}

fn io_err(path: &Path, e: std::io::Error) -> StoreError {
    StoreError::Io(format!("{}: {e}", path.display()))
}

impl ObjectStore for FsObjectStore {
    async fn put_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.resolve(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::Io(format!("{} has no parent", path.display())))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_err(parent, e))?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = parent.join(format!(".{file_name}.tmp-{}", Uuid::now_v7()));

        if let Err(e) = tokio::fs::write(&tmp, bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_err(&tmp, e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_err(&path, e));
        }

        tracing::trace!(key, size = bytes.len(), "object written");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(key.to_string())),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.resolve(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_err(&path, e))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&path, e)),
        }
    }
}
