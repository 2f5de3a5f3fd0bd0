//! Per-tenant resource management.

pub mod cache;

pub use cache::TenantCache;
