//! Name-indexed registry of loaded plugins and the step types they own.

use std::sync::Arc;

use conductor_types::config::EngineConfig;
use conductor_types::plugin::SandboxPolicy;
use dashmap::DashMap;

use super::sandbox::{MemoryProbe, NoopMemoryProbe, SandboxedExecutor};
use super::{Plugin, PluginError};
use crate::workflow::builtin::BuiltinStepType;
use crate::workflow::executor::BoxStepExecutor;

/// Registry of plugins, indexed by plugin name and by step type.
///
/// Registration is serialized so that the plugin limit and step type
/// ownership checks cannot race; lookups are lock-free.
pub struct PluginRegistry {
    plugins: DashMap<String, Arc<dyn Plugin>>,
    /// step type -> owning plugin name
    step_types: DashMap<String, String>,
    max_plugins: usize,
    default_policy: Option<SandboxPolicy>,
    memory_probe: Arc<dyn MemoryProbe>,
    registration: tokio::sync::Mutex<()>,
}

impl PluginRegistry {
    pub fn new(max_plugins: usize) -> Self {
        Self {
            plugins: DashMap::new(),
            step_types: DashMap::new(),
            max_plugins,
            default_policy: None,
            memory_probe: Arc::new(NoopMemoryProbe),
            registration: tokio::sync::Mutex::new(()),
        }
    }

    /// Registry sized and sandboxed according to the engine config.
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut registry = Self::new(config.max_plugins);
        registry.default_policy = config.default_sandbox.clone();
        registry
    }

    /// Policy applied to plugins that do not declare their own.
    pub fn with_default_policy(mut self, policy: SandboxPolicy) -> Self {
        self.default_policy = Some(policy);
        self
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory_probe = probe;
        self
    }

    /// Register and initialize a plugin.
    ///
    /// Fails if the name is taken, the limit is reached, a step type is a
    /// built-in, or a step type is owned by another plugin and
    /// `allow_override` is false. With `allow_override` the new plugin takes
    /// the contested step types over.
    pub async fn register(
        &self,
        plugin: Arc<dyn Plugin>,
        allow_override: bool,
    ) -> Result<(), PluginError> {
        let _guard = self.registration.lock().await;
        let name = plugin.name().to_string();

        if self.plugins.contains_key(&name) {
            return Err(PluginError::Duplicate(name));
        }
        if self.plugins.len() >= self.max_plugins {
            return Err(PluginError::LimitReached(self.max_plugins));
        }
        for step_type in plugin.step_types() {
            if BuiltinStepType::parse(step_type).is_some() {
                return Err(PluginError::ReservedStepType(step_type.clone()));
            }
            if let Some(owner) = self.step_types.get(step_type) {
                if !allow_override {
                    return Err(PluginError::AlreadyRegistered {
                        step_type: step_type.clone(),
                        owner: owner.clone(),
                    });
                }
            }
        }

        plugin.initialize().await?;

        for step_type in plugin.step_types() {
            if let Some(previous) = self.step_types.insert(step_type.clone(), name.clone()) {
                tracing::warn!(
                    step_type = step_type.as_str(),
                    previous = previous.as_str(),
                    plugin = name.as_str(),
                    "plugin overrides step type"
                );
            }
        }
        tracing::info!(
            plugin = name.as_str(),
            version = %plugin.version(),
            step_types = ?plugin.step_types(),
            "registered plugin"
        );
        self.plugins.insert(name, plugin);
        Ok(())
    }

    /// Executor for a plugin step type, sandboxed if a policy applies.
    pub fn lookup(&self, step_type: &str) -> Option<BoxStepExecutor> {
        let owner = self.step_types.get(step_type)?.clone();
        let plugin = Arc::clone(self.plugins.get(&owner)?.value());
        let executor = plugin.executor(step_type)?;

        let policy = plugin
            .sandbox_policy()
            .cloned()
            .or_else(|| self.default_policy.clone());
        Some(match policy {
            Some(policy) => BoxStepExecutor::new(SandboxedExecutor::new(
                owner,
                executor,
                policy,
                Arc::clone(&self.memory_probe),
            )),
            None => executor,
        })
    }

    /// Name of the plugin owning `step_type`.
    pub fn owner(&self, step_type: &str) -> Option<String> {
        self.step_types.get(step_type).map(|o| o.clone())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).map(|p| Arc::clone(p.value()))
    }

    /// Remove a plugin, release its step types, and run its shutdown hook.
    pub async fn unregister(&self, name: &str) -> Result<(), PluginError> {
        let plugin = {
            let _guard = self.registration.lock().await;
            let (_, plugin) = self
                .plugins
                .remove(name)
                .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
            self.step_types.retain(|_, owner| owner != name);
            plugin
        };
        tracing::info!(plugin = name, "unregistered plugin");
        plugin.shutdown().await
    }

    /// Shut every plugin down and empty the registry. Returns the errors of
    /// hooks that failed; the rest still run.
    pub async fn shutdown_all(&self) -> Vec<PluginError> {
        let plugins: Vec<Arc<dyn Plugin>> = {
            let _guard = self.registration.lock().await;
            let all = self.plugins.iter().map(|p| Arc::clone(p.value())).collect();
            self.plugins.clear();
            self.step_types.clear();
            all
        };

        let mut errors = Vec::new();
        for plugin in plugins {
            if let Err(e) = plugin.shutdown().await {
                tracing::warn!(plugin = plugin.name(), error = %e, "plugin shutdown failed");
                errors.push(e);
            }
        }
        errors
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Registered plugin names, sorted.
    pub fn plugin_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
