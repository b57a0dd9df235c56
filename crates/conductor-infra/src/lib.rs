//! Infrastructure layer for Conductor.
//!
//! Contains implementations of the ports defined in `conductor-core`:
//! the filesystem state store, process-backed step executors (`script`,
//! command agent, `shell` plugin kind), the `/proc` memory probe, config and
//! workflow file loading, and the wiring that assembles them into a runner.

pub mod agent;
pub mod config;
pub mod definition;
pub mod engine;
pub mod memory;
pub mod process;
pub mod script;
pub mod shell_plugin;
pub mod state;
