//! Engine logic and port traits for Conductor.
//!
//! This crate defines the "ports" (state store, step executor, plugin,
//! shutdown handler traits) that the infrastructure layer implements, plus
//! everything that needs no IO: dependency resolution, the run context,
//! condition evaluation, the runner, and the shutdown manager. It depends
//! only on `conductor-types` -- never on `conductor-infra`.

pub mod plugin;
pub mod shutdown;
pub mod state;
pub mod workflow;
