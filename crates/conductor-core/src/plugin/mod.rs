//! Plugin system: third-party step types with sandboxed execution.
//!
//! A `Plugin` contributes executors for one or more step types. Plugins are
//! built from `PluginConfig` entries by the `PluginFactory` and held by the
//! `PluginRegistry`, which wraps their executors in a `SandboxedExecutor`
//! whenever a sandbox policy applies.

pub mod factory;
pub mod registry;
pub mod sandbox;

use conductor_types::plugin::SandboxPolicy;
use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::workflow::executor::BoxStepExecutor;

/// A loadable provider of step executors.
///
/// Object-safe so the registry can hold heterogeneous plugins behind
/// `Arc<dyn Plugin>`; lifecycle hooks return boxed futures.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &semver::Version;

    /// Step types this plugin handles.
    fn step_types(&self) -> &[String];

    /// Executor for `step_type`, or `None` if the plugin does not handle it.
    fn executor(&self, step_type: &str) -> Option<BoxStepExecutor>;

    /// Policy requested by the plugin itself. The registry falls back to the
    /// engine default when this is `None`.
    fn sandbox_policy(&self) -> Option<&SandboxPolicy> {
        None
    }

    /// Called once after registration, before any step runs.
    fn initialize(&self) -> BoxFuture<'_, Result<(), PluginError>> {
        Box::pin(async { Ok(()) })
    }

    /// Called when the plugin is unregistered or the engine shuts down.
    fn shutdown(&self) -> BoxFuture<'_, Result<(), PluginError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Errors from plugin creation, registration, and lifecycle hooks.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin '{0}' is already registered")]
    Duplicate(String),

    #[error("plugin limit of {0} reached")]
    LimitReached(usize),

    #[error("plugin '{0}' not found")]
    NotFound(String),

    #[error("plugin '{name}' failed to initialize: {reason}")]
    Initialization { name: String, reason: String },

    #[error("invalid plugin config for '{name}': {reason}")]
    InvalidConfig { name: String, reason: String },

    #[error("unknown plugin kind '{0}'")]
    UnknownKind(String),

    #[error("step type '{0}' is reserved for a built-in executor")]
    ReservedStepType(String),

    #[error("step type '{step_type}' is already provided by plugin '{owner}'")]
    AlreadyRegistered { step_type: String, owner: String },

    #[error("plugin '{name}' failed to shut down: {reason}")]
    Shutdown { name: String, reason: String },
}
