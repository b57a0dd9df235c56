//! The `shell` plugin kind: step types backed by command templates.
//!
//! ```toml
//! [[plugins]]
//! name = "rust-tools"
//! kind = "shell"
//! version = "1.0.0"
//! step_types = ["lint", "fmt-check"]
//!
//! [plugins.options.commands]
//! lint = "cargo clippy --all-targets -- -D warnings"
//! fmt-check = "cargo fmt --check"
//! ```
//!
//! A single `command` option serves every step type. Steps of a shell type
//! accept the same `cwd`, `env`, `timeout`, and `parseJson` config as
//! `script` steps; the command itself always comes from the plugin.

use std::collections::HashMap;
use std::sync::Arc;

use conductor_core::plugin::factory::PluginFactory;
use conductor_core::plugin::{Plugin, PluginError};
use conductor_core::workflow::error::WorkflowError;
use conductor_core::workflow::executor::{BoxStepExecutor, StepExecutor, StepScope, ValidationReport};
use conductor_types::plugin::{PluginConfig, SandboxPolicy};
use conductor_types::workflow::WorkflowStep;
use serde_json::Value;

use crate::script::ScriptExecutor;

pub const SHELL_KIND: &str = "shell";

pub struct ShellPlugin {
    name: String,
    version: semver::Version,
    step_types: Vec<String>,
    templates: HashMap<String, String>,
    sandbox: Option<SandboxPolicy>,
}

impl ShellPlugin {
    pub fn from_config(config: &PluginConfig) -> Result<Self, PluginError> {
        let invalid = |reason: String| PluginError::InvalidConfig {
            name: config.name.clone(),
            reason,
        };

        let version = semver::Version::parse(&config.version)
            .map_err(|e| invalid(format!("version '{}' is not semver: {e}", config.version)))?;
        let shared = config.options.get("command").and_then(Value::as_str);
        let per_type = config.options.get("commands").and_then(Value::as_object);

        let mut templates = HashMap::new();
        for step_type in &config.step_types {
            let template = per_type
                .and_then(|m| m.get(step_type))
                .and_then(Value::as_str)
                .or(shared)
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| invalid(format!("no command configured for step type '{step_type}'")))?;
            templates.insert(step_type.clone(), template.to_string());
        }

        Ok(Self {
            name: config.name.clone(),
            version,
            step_types: config.step_types.clone(),
            templates,
            sandbox: config.sandbox.clone(),
        })
    }
}

impl Plugin for ShellPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &semver::Version {
        &self.version
    }

    fn step_types(&self) -> &[String] {
        &self.step_types
    }

    fn executor(&self, step_type: &str) -> Option<BoxStepExecutor> {
        let template = self.templates.get(step_type)?;
        Some(BoxStepExecutor::new(ShellStepExecutor {
            step_type: step_type.to_string(),
            template: template.clone(),
        }))
    }

    fn sandbox_policy(&self) -> Option<&SandboxPolicy> {
        self.sandbox.as_ref()
    }
}

/// Register the `shell` kind with `factory`.
pub fn register_shell_kind(factory: &mut PluginFactory) {
    factory.register_kind(SHELL_KIND, |config: &PluginConfig| {
        Ok(Arc::new(ShellPlugin::from_config(config)?) as Arc<dyn Plugin>)
    });
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

struct ShellStepExecutor {
    step_type: String,
    template: String,
}

impl ShellStepExecutor {
    /// The step with the plugin's command in place of any configured one.
    fn as_script_step(&self, step: &WorkflowStep) -> WorkflowStep {
        let mut script = step.clone();
        let mut config = match &step.config {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        config.insert("command".into(), Value::String(self.template.clone()));
        config.remove("args");
        config.remove("shell");
        script.config = Value::Object(config);
        script
    }
}

impl StepExecutor for ShellStepExecutor {
    fn supported_type(&self) -> &str {
        &self.step_type
    }

    fn validate(&self, step: &WorkflowStep) -> ValidationReport {
        let mut errors = Vec::new();
        if !(step.config.is_object() || step.config.is_null()) {
            errors.push("config must be an object".to_string());
        }
        if step.config.get("command").is_some() {
            errors.push(format!(
                "config.command is not allowed; '{}' steps run the plugin's command",
                self.step_type
            ));
        }
        ValidationReport::from_errors(errors)
    }

    async fn execute(&self, step: &WorkflowStep, scope: &StepScope) -> Result<Value, WorkflowError> {
        let script = self.as_script_step(step);
        let spec = ScriptExecutor::command_spec(&script, scope)?;
        ScriptExecutor::run_spec(&script, scope, &spec).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
