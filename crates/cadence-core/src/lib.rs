//! Pipeline engine and port trait definitions for Cadence.
//!
//! This crate defines the "ports" (repository and object-store traits) that
//! the infrastructure layer implements, plus the engine built on them. It
//! depends only on `cadence-types` -- never on `cadence-infra` or any
//! database/IO crate.

pub mod event;
pub mod hashing;
pub mod pipeline;
pub mod repository;
pub mod storage;
pub mod tenant;
