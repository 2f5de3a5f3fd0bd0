//! Observability setup for Cadence: structured logging with an optional
//! OpenTelemetry span bridge.

pub mod tracing_setup;
