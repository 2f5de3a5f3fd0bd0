//! Content-addressed artifact store.
//!
//! Blobs are filed under their SHA-256 digest at
//! `tenants/<tenant>/blobs/sha256/<aa>/<digest>`. Logical artifact paths hold a
//! small pointer object containing the digest, so several runs of one tenant
//! can share a blob by reference. Blobs are never shared across tenants: each
//! tenant's metadata store is the only authority on whether its blobs are
//! still referenced.

use cadence_types::artifact::Digest;
use cadence_types::error::StoreError;
use cadence_types::run::TenantId;

use crate::hashing::content_digest;

use super::object_store::ObjectStore;
use super::path::{ArtifactPath, validate_segment};

/// Object key of a tenant's blob for a digest.
pub fn blob_key(tenant: &TenantId, digest: &Digest) -> Result<String, StoreError> {
    validate_segment(tenant.as_str())?;
    Ok(format!(
        "tenants/{}/blobs/sha256/{}/{}",
        tenant.as_str(),
        digest.shard(),
        digest.as_str()
    ))
}

/// Digest-addressed byte store over any `ObjectStore`.
pub struct ContentAddressedStore<S: ObjectStore> {
    store: S,
}

impl<S: ObjectStore> ContentAddressedStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Access the underlying object store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Store `bytes` and point `path` at them. Identical bytes always yield
    /// the same digest and are written to the tenant's blob area at most once.
    pub async fn put(&self, bytes: &[u8], path: &ArtifactPath) -> Result<Digest, StoreError> {
        let digest = content_digest(bytes);
        let key = blob_key(path.tenant(), &digest)?;

        if !self.store.exists(&key).await? {
            self.store.put_atomic(&key, bytes).await?;
            tracing::debug!(digest = digest.short(), size = bytes.len(), "stored blob");
        }
        self.store
            .put_atomic(path.as_str(), digest.as_str().as_bytes())
            .await?;

        Ok(digest)
    }

    /// Digest a logical path points at.
    pub async fn resolve(&self, path: &ArtifactPath) -> Result<Digest, StoreError> {
        let raw = self.store.get(path.as_str()).await?;
        let text = String::from_utf8(raw)
            .map_err(|_| StoreError::InvalidDigest(format!("non-utf8 pointer at {path}")))?;
        text.trim().parse()
    }

    /// Bytes behind a logical path.
    pub async fn get(&self, path: &ArtifactPath) -> Result<Vec<u8>, StoreError> {
        let digest = self.resolve(path).await?;
        self.get_by_digest(path.tenant(), &digest).await
    }

    /// Bytes of a tenant's blob, verified against its digest.
    pub async fn get_by_digest(&self, tenant: &TenantId, digest: &Digest) -> Result<Vec<u8>, StoreError> {
        let bytes = self.store.get(&blob_key(tenant, digest)?).await?;
        let actual = content_digest(&bytes);
        if &actual != digest {
            tracing::error!(
                expected = digest.as_str(),
                actual = actual.as_str(),
                "blob digest mismatch"
            );
            return Err(StoreError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(bytes)
    }

    /// Point `path` at an existing blob of the same tenant without copying it.
    pub async fn link(&self, digest: &Digest, path: &ArtifactPath) -> Result<(), StoreError> {
        let key = blob_key(path.tenant(), digest)?;
        if !self.store.exists(&key).await? {
            return Err(StoreError::NotFound(key));
        }
        self.store
            .put_atomic(path.as_str(), digest.as_str().as_bytes())
            .await
    }

    /// Remove a logical pointer. The blob is left in place.
    pub async fn unlink(&self, path: &ArtifactPath) -> Result<bool, StoreError> {
        self.store.delete(path.as_str()).await
    }

    /// Whether the tenant holds a blob for `digest`.
    pub async fn contains(&self, tenant: &TenantId, digest: &Digest) -> Result<bool, StoreError> {
        self.store.exists(&blob_key(tenant, digest)?).await
    }

    /// Remove a tenant's blob. Callers must ensure none of the tenant's
    /// artifacts or attempt outputs still references it.
    pub async fn remove_blob(&self, tenant: &TenantId, digest: &Digest) -> Result<bool, StoreError> {
        self.store.delete(&blob_key(tenant, digest)?).await
    }
}
