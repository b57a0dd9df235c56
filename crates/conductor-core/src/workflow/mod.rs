//! Workflow engine core: validation, dependency resolution, step execution,
//! and durable checkpointing.
//!
//! - `error` -- `WorkflowError` taxonomy and retry classification
//! - `definition` -- structural validation of workflow definitions
//! - `dag` -- depth-first resolver, cycle detection, batch computation
//! - `context` -- run-scoped variables, step outputs, and template lookup
//! - `expression` -- condition parser and evaluator (fixed operator set)
//! - `executor` -- `StepExecutor` trait, hooks, and the boxed wrapper
//! - `builtin` -- built-in step types (`condition`, `agent`) and their table
//! - `checkpoint` -- applies run/step transitions to persisted state
//! - `runner` -- batch-based parallel runner with pause/resume/cancel

pub mod builtin;
pub mod checkpoint;
pub mod context;
pub mod dag;
pub mod definition;
pub mod error;
pub mod executor;
pub mod expression;
pub mod runner;
