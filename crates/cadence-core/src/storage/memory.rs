//! In-memory `ObjectStore` backed by a `DashMap`.

use std::sync::atomic::{AtomicBool, Ordering};

use cadence_types::error::StoreError;
use dashmap::DashMap;

use super::object_store::ObjectStore;

/// Process-local object store. Each write replaces the whole value, which is
/// atomic with respect to concurrent readers.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: DashMap<String, Vec<u8>>,
    refuse_writes: AtomicBool,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects (blobs and pointers).
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Overwrite an object without going through the content-addressed layer.
    #[cfg(test)]
    pub(crate) fn corrupt(&self, key: &str, bytes: &[u8]) {
        self.objects.insert(key.to_string(), bytes.to_vec());
    }

    /// Make every following write fail, as a full disk would.
    #[cfg(test)]
    pub(crate) fn refuse_writes(&self, refuse: bool) {
        self.refuse_writes.store(refuse, Ordering::SeqCst);
    }
}

impl ObjectStore for InMemoryObjectStore {
    async fn put_atomic(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        if self.refuse_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(format!("write to {key} refused")));
        }
        self.objects.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .get(key)
            .map(|v| v.value().clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.objects.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.objects.remove(key).is_some())
    }
}
