//! Observability module providing structured logging for erasure runs.
//!
//! Every stage logs through `tracing` with the request id attached as a span
//! field; this module only installs the subscriber for the binary.

mod tracing_init;

pub use tracing_init::*;
