//! Engine configuration types for Conductor.
//!
//! `EngineConfig` represents the `config.toml` in the data directory that
//! controls concurrency, timeouts, persistence, and shutdown behaviour. All
//! fields have sensible defaults.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::plugin::{PluginConfig, SandboxPolicy};

/// What happens to the rest of a run when a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip only the failed step's dependents; independent branches continue.
    #[default]
    IsolateBranches,
    /// Stop dispatching entirely after the first non-tolerated failure.
    FailFast,
}

/// How concurrent steps write shared variables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableWriteMode {
    /// Plain writes; the last writer wins.
    #[default]
    LastWriteWins,
    /// Read-modify-write updates are serialized through a lock.
    Serialized,
}

/// Top-level configuration for the engine.
///
/// Loaded from `~/.conductor/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on steps executing at once within one run.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Step timeout used when a step declares none.
    #[serde(default = "default_step_timeout_ms")]
    pub default_step_timeout_ms: u64,

    /// Run timeout used when a definition declares none.
    #[serde(default = "default_workflow_timeout_ms")]
    pub workflow_timeout_ms: u64,

    /// Where run state documents are kept. Defaults to `{data_dir}/state`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// Number of rotating backups kept per state document.
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,

    /// Age after which `cleanup` removes state documents.
    #[serde(default = "default_max_state_age_ms")]
    pub max_state_age_ms: u64,

    /// How long graceful shutdown waits for in-flight steps.
    #[serde(default = "default_shutdown_grace_period_ms")]
    pub shutdown_grace_period_ms: u64,

    /// Bound on each shutdown handler notification.
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,

    #[serde(default)]
    pub failure_policy: FailurePolicy,

    #[serde(default)]
    pub variable_write_mode: VariableWriteMode,

    /// Slots per named resource tag. Unlisted tags get one slot.
    #[serde(default)]
    pub resource_limits: HashMap<String, usize>,

    /// Maximum number of registered plugins.
    #[serde(default = "default_max_plugins")]
    pub max_plugins: usize,

    /// Policy applied to plugins that do not declare their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_sandbox: Option<SandboxPolicy>,

    /// Plugins loaded at startup.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<PluginConfig>,

    /// External command that answers `agent` steps. Without it, `agent`
    /// steps fail validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentCommandConfig>,
}

/// `[agent]` table: the program invoked for `agent` steps.
///
/// The prompt is written to the program's stdin; its stdout is the reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCommandConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the agent process.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_step_timeout_ms() -> u64 {
    300_000
}

fn default_workflow_timeout_ms() -> u64 {
    1_800_000
}

fn default_max_backups() -> usize {
    3
}

fn default_max_state_age_ms() -> u64 {
    7 * 24 * 60 * 60 * 1000
}

fn default_shutdown_grace_period_ms() -> u64 {
    10_000
}

fn default_handler_timeout_ms() -> u64 {
    2_000
}

fn default_max_plugins() -> usize {
    32
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            default_step_timeout_ms: default_step_timeout_ms(),
            workflow_timeout_ms: default_workflow_timeout_ms(),
            state_dir: None,
            max_backups: default_max_backups(),
            max_state_age_ms: default_max_state_age_ms(),
            shutdown_grace_period_ms: default_shutdown_grace_period_ms(),
            handler_timeout_ms: default_handler_timeout_ms(),
            failure_policy: FailurePolicy::default(),
            variable_write_mode: VariableWriteMode::default(),
            resource_limits: HashMap::new(),
            max_plugins: default_max_plugins(),
            default_sandbox: None,
            plugins: Vec::new(),
            agent: None,
        }
    }
}

impl EngineConfig {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrency",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_backups == 0 {
            return Err(ConfigError::Invalid {
                field: "max_backups",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.shutdown_grace_period_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "shutdown_grace_period_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.default_step_timeout_ms == 0 || self.workflow_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "timeouts",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.agent.as_ref().is_some_and(|a| a.command.trim().is_empty()) {
            return Err(ConfigError::Invalid {
                field: "agent.command",
                reason: "must not be empty".to_string(),
            });
        }
        if let Some((tag, _)) = self.resource_limits.iter().find(|(_, slots)| **slots == 0) {
            return Err(ConfigError::Invalid {
                field: "resource_limits",
                reason: format!("resource '{tag}' has zero slots"),
            });
        }
        Ok(())
    }

    /// Slots for a resource tag (1 when unlisted).
    pub fn resource_slots(&self, tag: &str) -> usize {
        self.resource_limits.get(tag).copied().unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.default_step_timeout_ms, 300_000);
        assert_eq!(config.workflow_timeout_ms, 1_800_000);
        assert_eq!(config.max_backups, 3);
        assert_eq!(config.max_state_age_ms, 604_800_000);
        assert_eq!(config.failure_policy, FailurePolicy::IsolateBranches);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
max_concurrency = 8
failure_policy = "fail_fast"
variable_write_mode = "serialized"
state_dir = "/tmp/conductor-state"

[resource_limits]
gpu = 2

[[plugins]]
name = "lint"
kind = "shell"
version = "1.0.0"
step_types = ["lint"]
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.failure_policy, FailurePolicy::FailFast);
        assert_eq!(config.variable_write_mode, VariableWriteMode::Serialized);
        assert_eq!(config.resource_slots("gpu"), 2);
        assert_eq!(config.resource_slots("db"), 1);
        assert_eq!(config.plugins.len(), 1);
        assert!(config.plugins[0].enabled);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = EngineConfig {
            max_concurrency: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "max_concurrency", .. })
        ));

        let config = EngineConfig {
            shutdown_grace_period_ms: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.resource_limits.insert("db".to_string(), 0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("db"));
    }
}
