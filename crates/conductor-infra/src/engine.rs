//! Assembles a runnable engine from an `EngineConfig`.
//!
//! The runner and the shutdown manager share one `ActiveRuns` collection
//! and one root cancellation token, so a forced shutdown reaches every run
//! and refuses new ones.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use conductor_core::plugin::PluginError;
use conductor_core::plugin::factory::PluginFactory;
use conductor_core::plugin::registry::PluginRegistry;
use conductor_core::shutdown::ShutdownManager;
use conductor_core::workflow::builtin::{AgentExecutor, ExecutorRegistry};
use conductor_core::workflow::error::WorkflowError;
use conductor_core::workflow::executor::BoxStepExecutor;
use conductor_core::workflow::runner::{ActiveRuns, WorkflowRunner};
use conductor_types::config::EngineConfig;
use tokio_util::sync::CancellationToken;

use crate::agent::CommandAgentInvoker;
use crate::memory::ProcMemoryProbe;
use crate::script::ScriptExecutor;
use crate::shell_plugin::register_shell_kind;
use crate::state::FsStateStore;

/// Built-in executors: `condition` and `script` always, `agent` when an
/// `[agent]` command is configured.
pub fn builtin_executors(config: &EngineConfig) -> Result<ExecutorRegistry, WorkflowError> {
    let mut executors = ExecutorRegistry::new();
    executors.register_builtin(BoxStepExecutor::new(ScriptExecutor::new()))?;
    if let Some(invoker) = CommandAgentInvoker::from_config(config) {
        executors.register_builtin(BoxStepExecutor::new(AgentExecutor::new(invoker)))?;
    }
    Ok(executors)
}

/// Plugin kinds known to this build.
pub fn plugin_factory() -> PluginFactory {
    let mut factory = PluginFactory::new();
    register_shell_kind(&mut factory);
    factory
}

/// Registry holding every enabled plugin from `config.plugins`.
pub async fn build_plugin_registry(config: &EngineConfig) -> Result<PluginRegistry, PluginError> {
    let registry = PluginRegistry::from_config(config).with_memory_probe(Arc::new(ProcMemoryProbe));
    let loaded = plugin_factory().register_all(&registry, &config.plugins).await?;
    if loaded > 0 {
        tracing::info!(loaded, "plugins loaded");
    }
    Ok(registry)
}

/// A runner over the filesystem store plus its shutdown manager.
pub struct Engine {
    pub runner: Arc<WorkflowRunner<FsStateStore>>,
    pub shutdown: Arc<ShutdownManager<FsStateStore>>,
    pub plugins: Arc<PluginRegistry>,
}

impl Engine {
    pub async fn build(config: EngineConfig, state_dir: &Path) -> Result<Self> {
        let store = FsStateStore::new(state_dir, config.max_backups);
        let executors = builtin_executors(&config).context("failed to register built-in executors")?;
        let plugins = Arc::new(
            build_plugin_registry(&config)
                .await
                .context("failed to load plugins")?,
        );

        let root = CancellationToken::new();
        let active = ActiveRuns::new();
        let runner = WorkflowRunner::new(store, executors, plugins.clone(), config.clone())
            .with_cancellation(root.clone())
            .with_active_runs(active.clone());
        let shutdown =
            ShutdownManager::new(active, runner.checkpoint().clone(), &config).with_cancellation(root);

        Ok(Self {
            runner: Arc::new(runner),
            shutdown: Arc::new(shutdown),
            plugins,
        })
    }

    pub fn store(&self) -> &FsStateStore {
        self.runner.checkpoint().store()
    }

    /// Shut plugins down, logging (not failing on) individual errors.
    pub async fn close(&self) {
        for err in self.plugins.shutdown_all().await {
            tracing::warn!(error = %err, "plugin shutdown failed");
        }
    }
}
