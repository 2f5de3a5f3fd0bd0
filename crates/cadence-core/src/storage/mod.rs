//! Storage abstractions for Cadence.
//!
//! `ObjectStore` is the byte-oriented port (implemented on disk in
//! cadence-infra); `ContentAddressedStore` layers digest addressing and
//! logical artifact pointers on top of it.

pub mod cas;
pub mod memory;
pub mod object_store;
pub mod path;

pub use cas::ContentAddressedStore;
pub use object_store::ObjectStore;
pub use path::ArtifactPath;
