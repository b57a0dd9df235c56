//! Plugin declarations and sandbox policy.
//!
//! A plugin contributes executors for one or more step types. Plugins are
//! declared in configuration (`[[plugins]]` tables) and built by a factory
//! keyed on `kind`. Every plugin may carry a `SandboxPolicy` bounding what its
//! executors are allowed to do.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

/// Capability names checked by the sandbox guard.
pub mod capability {
    pub const FILESYSTEM: &str = "filesystem";
    pub const NETWORK: &str = "network";
    pub const PROCESS: &str = "process";
    pub const ENV: &str = "env";
}

/// One plugin entry from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    /// Factory key (e.g. "shell").
    pub kind: String,
    /// Semantic version string.
    pub version: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Step types this plugin claims.
    #[serde(default)]
    pub step_types: Vec<String>,
    /// Kind-specific options.
    #[serde(default)]
    pub options: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxPolicy>,
    /// Allow claiming step types another plugin already owns.
    #[serde(default)]
    pub allow_override: bool,
}

fn default_enabled() -> bool {
    true
}

/// Limits applied to every execution of a sandboxed plugin's executors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxPolicy {
    /// Hard wall-clock limit per execution.
    #[serde(default = "default_sandbox_timeout_ms")]
    pub timeout_ms: u64,
    /// Memory ceiling checked by polling; `None` disables the check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_bytes: Option<u64>,
    #[serde(default = "default_memory_poll_interval_ms")]
    pub memory_poll_interval_ms: u64,
    /// When set, only these capabilities are granted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_capabilities: Option<Vec<String>>,
    /// Always denied, even if also allowed.
    #[serde(default)]
    pub blocked_capabilities: Vec<String>,
    /// Path prefixes readable by the plugin.
    #[serde(default)]
    pub read_paths: Vec<PathBuf>,
    /// Path prefixes writable by the plugin.
    #[serde(default)]
    pub write_paths: Vec<PathBuf>,
}

fn default_sandbox_timeout_ms() -> u64 {
    60_000
}

fn default_memory_poll_interval_ms() -> u64 {
    100
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: default_sandbox_timeout_ms(),
            max_memory_bytes: None,
            memory_poll_interval_ms: default_memory_poll_interval_ms(),
            allowed_capabilities: None,
            blocked_capabilities: Vec::new(),
            read_paths: Vec::new(),
            write_paths: Vec::new(),
        }
    }
}

impl SandboxPolicy {
    /// Sanity checks run when a plugin is created.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::Sandbox("timeoutMs must be greater than zero".into()));
        }
        if self.memory_poll_interval_ms == 0 {
            return Err(ConfigError::Sandbox(
                "memoryPollIntervalMs must be greater than zero".into(),
            ));
        }
        if self.max_memory_bytes == Some(0) {
            return Err(ConfigError::Sandbox("maxMemoryBytes must be greater than zero".into()));
        }
        for path in self.read_paths.iter().chain(&self.write_paths) {
            if !path.is_absolute() {
                return Err(ConfigError::Sandbox(format!(
                    "sandbox path '{}' must be absolute",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    /// Whether `name` is granted under this policy.
    pub fn allows_capability(&self, name: &str) -> bool {
        if self.blocked_capabilities.iter().any(|c| c == name) {
            return false;
        }
        match &self.allowed_capabilities {
            Some(allowed) => allowed.iter().any(|c| c == name),
            None => true,
        }
    }

    pub fn allows_read(&self, path: &Path) -> bool {
        // Writable paths are readable too.
        path_within(path, &self.read_paths) || path_within(path, &self.write_paths)
    }

    pub fn allows_write(&self, path: &Path) -> bool {
        path_within(path, &self.write_paths)
    }
}

/// Component-wise prefix check; `..` segments are never accepted.
fn path_within(path: &Path, roots: &[PathBuf]) -> bool {
    if path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return false;
    }
    roots.iter().any(|root| path.starts_with(root))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_blocklist_wins() {
        let policy = SandboxPolicy {
            allowed_capabilities: Some(vec![
                capability::PROCESS.to_string(),
                capability::NETWORK.to_string(),
            ]),
            blocked_capabilities: vec![capability::NETWORK.to_string()],
            ..SandboxPolicy::default()
        };
        assert!(policy.allows_capability(capability::PROCESS));
        assert!(!policy.allows_capability(capability::NETWORK));
        assert!(!policy.allows_capability(capability::ENV));
    }

    #[test]
    fn test_no_allowlist_grants_everything_not_blocked() {
        let policy = SandboxPolicy {
            blocked_capabilities: vec![capability::ENV.to_string()],
            ..SandboxPolicy::default()
        };
        assert!(policy.allows_capability(capability::FILESYSTEM));
        assert!(!policy.allows_capability(capability::ENV));
    }

    #[test]
    fn test_path_checks() {
        let policy = SandboxPolicy {
            read_paths: vec![PathBuf::from("/srv/data")],
            write_paths: vec![PathBuf::from("/tmp/out")],
            ..SandboxPolicy::default()
        };
        assert!(policy.allows_read(Path::new("/srv/data/a.txt")));
        assert!(policy.allows_read(Path::new("/tmp/out/b.txt")));
        assert!(!policy.allows_read(Path::new("/srv/database")));
        assert!(!policy.allows_read(Path::new("/srv/data/../../etc/passwd")));
        assert!(policy.allows_write(Path::new("/tmp/out/b.txt")));
        assert!(!policy.allows_write(Path::new("/srv/data/a.txt")));
    }

    #[test]
    fn test_policy_validation() {
        assert!(SandboxPolicy::default().validate().is_ok());
        let bad = SandboxPolicy {
            read_paths: vec![PathBuf::from("relative/dir")],
            ..SandboxPolicy::default()
        };
        assert!(bad.validate().is_err());
        let bad = SandboxPolicy {
            max_memory_bytes: Some(0),
            ..SandboxPolicy::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_plugin_config_defaults() {
        let config: PluginConfig = serde_json::from_value(serde_json::json!({
            "name": "lint",
            "kind": "shell",
            "version": "0.1.0",
            "step_types": ["lint"]
        }))
        .unwrap();
        assert!(config.enabled);
        assert!(!config.allow_override);
        assert!(config.sandbox.is_none());
    }
}
