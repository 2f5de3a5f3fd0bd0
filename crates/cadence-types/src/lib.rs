//! Shared domain types for Cadence.
//!
//! This crate contains the data model of the pipeline engine: runs, steps,
//! attempts, artifacts, checkpoints, signals, pipeline definitions, engine
//! configuration, lifecycle events, and the error types shared by the ports.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod artifact;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod failure;
pub mod pipeline;
pub mod run;
pub mod signal;
pub mod step;
