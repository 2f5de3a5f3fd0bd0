//! Infrastructure layer for Cadence.
//!
//! Contains implementations of the port traits defined in `cadence-core`:
//! SQLite metadata storage, the filesystem object store, the TOML config
//! loader and the per-tenant pool registry.

pub mod config;
pub mod sqlite;
pub mod storage;
pub mod tenant;
