//! Logging and trace export setup for Conductor binaries.

pub mod tracing_setup;

pub use tracing_setup::{LogFormat, TracingOptions, init_tracing, shutdown_tracing};
