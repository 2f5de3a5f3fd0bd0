use thiserror::Error;

/// Errors from repository operations (used by trait definitions in cadence-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    /// A uniqueness constraint rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors from the byte-oriented object store and the content-addressed layer on top of it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid path segment '{segment}': {reason}")]
    InvalidPath { segment: String, reason: String },

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Stored bytes no longer hash to the digest they were filed under.
    #[error("digest mismatch: expected '{expected}', got '{actual}'")]
    DigestMismatch { expected: String, actual: String },

    #[error("io error: {0}")]
    Io(String),
}
