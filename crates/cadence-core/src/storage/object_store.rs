//! Object store trait.
//!
//! Keys are relative, `/`-separated paths. Implementations live in
//! cadence-infra (filesystem) and `storage::memory` (tests).

use cadence_types::error::StoreError;

/// Byte-oriented object store for artifact payloads and pointers.
///
/// Uses RPITIT (native async fn in traits, Rust 2024 edition).
pub trait ObjectStore: Send + Sync {
    /// Write an object so that readers see either the previous contents or
    /// the complete new contents, never a partial write.
    fn put_atomic(
        &self,
        key: &str,
        bytes: &[u8],
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Read an object. Missing keys return `StoreError::NotFound`.
    fn get(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, StoreError>> + Send;

    fn exists(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;

    /// Delete an object. Returns `true` if it existed.
    fn delete(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;
}
