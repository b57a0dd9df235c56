//! Builds plugins from configuration entries.
//!
//! Plugin kinds are registered as constructor closures; `create` validates a
//! `PluginConfig` and hands it to the constructor for its kind.

use std::collections::HashMap;
use std::sync::Arc;

use conductor_types::plugin::PluginConfig;

use super::registry::PluginRegistry;
use super::{Plugin, PluginError};
use crate::workflow::definition::is_valid_identifier;

/// Constructor for one plugin kind.
pub type PluginConstructor =
    Arc<dyn Fn(&PluginConfig) -> Result<Arc<dyn Plugin>, PluginError> + Send + Sync>;

/// Kind-indexed table of plugin constructors.
#[derive(Default, Clone)]
pub struct PluginFactory {
    constructors: HashMap<String, PluginConstructor>,
}

impl PluginFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the constructor for `kind`.
    pub fn register_kind<F>(&mut self, kind: impl Into<String>, constructor: F)
    where
        F: Fn(&PluginConfig) -> Result<Arc<dyn Plugin>, PluginError> + Send + Sync + 'static,
    {
        self.constructors.insert(kind.into(), Arc::new(constructor));
    }

    /// Known kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.constructors.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Validate `config` and build the plugin it describes.
    pub fn create(&self, config: &PluginConfig) -> Result<Arc<dyn Plugin>, PluginError> {
        let invalid = |reason: String| PluginError::InvalidConfig {
            name: config.name.clone(),
            reason,
        };

        if !is_valid_identifier(&config.name) {
            return Err(invalid("name may only contain [a-zA-Z0-9_-]".to_string()));
        }
        let constructor = self
            .constructors
            .get(&config.kind)
            .ok_or_else(|| PluginError::UnknownKind(config.kind.clone()))?;
        semver::Version::parse(&config.version)
            .map_err(|e| invalid(format!("version '{}' is not semver: {e}", config.version)))?;
        if config.step_types.is_empty() {
            return Err(invalid("at least one step type is required".to_string()));
        }
        if let Some(policy) = &config.sandbox {
            policy.validate().map_err(|e| invalid(e.to_string()))?;
        }

        let plugin = constructor(config)?;
        tracing::debug!(plugin = config.name.as_str(), kind = config.kind.as_str(), "created plugin");
        Ok(plugin)
    }

    /// Create and register every enabled plugin in `configs`.
    ///
    /// Stops at the first failure; plugins registered before it stay loaded.
    pub async fn register_all(
        &self,
        registry: &PluginRegistry,
        configs: &[PluginConfig],
    ) -> Result<usize, PluginError> {
        let mut loaded = 0;
        for config in configs.iter().filter(|c| c.enabled) {
            let plugin = self.create(config)?;
            registry.register(plugin, config.allow_override).await?;
            loaded += 1;
        }
        Ok(loaded)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
