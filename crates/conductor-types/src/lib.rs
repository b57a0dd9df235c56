//! Shared domain types for Conductor.
//!
//! This crate contains the serializable shapes exchanged between the engine,
//! its storage backends, and callers: workflow definitions, step results,
//! persisted run state, engine configuration, and plugin declarations.
//!
//! Zero infrastructure dependencies -- only serde, chrono, semver, thiserror.

pub mod condition;
pub mod config;
pub mod error;
pub mod plugin;
pub mod state;
pub mod workflow;
