//! Object store adapters.

pub mod filesystem;
