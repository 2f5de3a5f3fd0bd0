//! Pipeline engine: definition loading, stage contract, and durable execution.
//!
//! - `definition` -- YAML parsing, validation, filesystem load/save
//! - `stage` -- the stage contract and the registry of stage bodies
//! - `generative` -- adapter from a text generator to a validated stage
//! - `classifier` -- failure classification and stable error codes
//! - `retry` -- backoff and quality-retry instruction building
//! - `checkpoint` -- intra-step phase snapshots gated by input digest
//! - `executor` -- idempotent single-step execution with timeout and heartbeat
//! - `branch` -- concurrent fan-out of a parallel stage with selective retry
//! - `machine` -- the run state machine and its signal surface

pub mod branch;
pub mod checkpoint;
pub mod classifier;
pub mod definition;
pub mod executor;
pub mod generative;
pub mod machine;
pub mod retry;
pub mod stage;

#[cfg(test)]
pub(crate) mod testing;
