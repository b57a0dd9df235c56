//! Built-in `script` step executor.
//!
//! Step config:
//!
//! ```json
//! { "command": "cargo test", "args": ["--release"], "shell": false,
//!   "cwd": "/repo", "env": { "RUST_LOG": "info" }, "timeout": 60000,
//!   "parseJson": false }
//! ```
//!
//! `command`, `args`, `cwd`, and `env` values are interpolated against the
//! run context. Without `args` the command runs through the shell unless
//! `shell` is `false`. The step output is
//! `{stdout, stderr, exitCode, durationMs}` plus `json` when `parseJson` is
//! set; a non-zero exit code fails the step.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use conductor_core::workflow::builtin::BuiltinStepType;
use conductor_core::workflow::error::WorkflowError;
use conductor_core::workflow::executor::{StepExecutor, StepScope, ValidationReport};
use conductor_types::plugin::capability;
use conductor_types::workflow::WorkflowStep;
use serde_json::{Value, json};

use crate::process::{self, CommandSpec, ProcessError};

/// Longest stderr excerpt carried into a failure message.
const STDERR_EXCERPT_CHARS: usize = 500;

#[derive(Debug, Clone, Default)]
pub struct ScriptExecutor;

impl ScriptExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Build the command for `step`, interpolating against the run context.
    pub fn command_spec(step: &WorkflowStep, scope: &StepScope) -> Result<CommandSpec, WorkflowError> {
        let ctx = &scope.context;
        let command = step
            .config_str("command")
            .map(|c| ctx.interpolate(c))
            .ok_or_else(|| WorkflowError::step(&step.id, "config.command is required"))?;
        let args: Option<Vec<String>> = step.config.get("args").and_then(Value::as_array).map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(|s| ctx.interpolate(s))
                .collect()
        });
        let use_shell = step
            .config
            .get("shell")
            .and_then(Value::as_bool)
            .unwrap_or(args.is_none());

        let mut spec = match (use_shell, args) {
            (true, Some(args)) => {
                let mut line = command;
                for arg in args {
                    line.push(' ');
                    line.push_str(&arg);
                }
                CommandSpec::shell(line)
            }
            (true, None) => CommandSpec::shell(command),
            (false, args) => CommandSpec::program(command, args.unwrap_or_default()),
        };

        spec.cwd = step
            .config_str("cwd")
            .map(|cwd| PathBuf::from(ctx.interpolate(cwd)));
        let mut env: BTreeMap<String, String> = ctx.environment();
        if let Some(vars) = step.config.get("env").and_then(Value::as_object) {
            for (name, value) in vars {
                let value = match value {
                    Value::String(s) => ctx.interpolate(s),
                    other => other.to_string(),
                };
                env.insert(name.clone(), value);
            }
        }
        env.insert("CONDUCTOR_RUN_ID".to_string(), ctx.run_id().to_string());
        env.insert("CONDUCTOR_STEP_ID".to_string(), step.id.clone());
        spec.env = env;
        Ok(spec)
    }

    /// Run `spec` for `step` and shape the result into a step output.
    pub async fn run_spec(
        step: &WorkflowStep,
        scope: &StepScope,
        spec: &CommandSpec,
    ) -> Result<Value, WorkflowError> {
        scope.sandbox.check_capability(capability::PROCESS)?;
        if let Some(cwd) = &spec.cwd {
            scope.sandbox.check_read(cwd)?;
        }
        let timeout = step
            .config
            .get("timeout")
            .and_then(Value::as_u64)
            .map(Duration::from_millis);

        tracing::debug!(step_id = step.id.as_str(), command = %spec.display(), "running script");
        let output = process::run(spec, None, timeout, &scope.cancel)
            .await
            .map_err(|e| match e {
                ProcessError::Timeout(timeout_ms) => WorkflowError::Timeout {
                    operation: format!("script step '{}'", step.id),
                    timeout_ms,
                },
                ProcessError::Cancelled => WorkflowError::Cancelled {
                    reason: format!("script step '{}' cancelled", step.id),
                },
                other => WorkflowError::step(&step.id, other.to_string()),
            })?;

        if !output.success() {
            let code = output
                .exit_code
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            let stderr: String = output.stderr.trim().chars().take(STDERR_EXCERPT_CHARS).collect();
            let message = if stderr.is_empty() {
                format!("exit code {code}")
            } else {
                format!("exit code {code}: {stderr}")
            };
            return Err(WorkflowError::step(&step.id, message));
        }

        let mut result = json!({
            "stdout": output.stdout.trim_end(),
            "stderr": output.stderr.trim_end(),
            "exitCode": output.exit_code,
            "durationMs": output.duration_ms,
        });
        if step.config.get("parseJson").and_then(Value::as_bool) == Some(true) {
            let parsed: Value = serde_json::from_str(output.stdout.trim()).map_err(|e| {
                WorkflowError::step(&step.id, format!("stdout is not valid JSON: {e}"))
            })?;
            result["json"] = parsed;
        }
        Ok(result)
    }
}

impl StepExecutor for ScriptExecutor {
    fn supported_type(&self) -> &str {
        BuiltinStepType::Script.as_str()
    }

    fn validate(&self, step: &WorkflowStep) -> ValidationReport {
        let mut errors = Vec::new();
        if step.config_str("command").is_none_or(|c| c.trim().is_empty()) {
            errors.push("config.command is required".to_string());
        }
        if let Some(args) = step.config.get("args") {
            let all_strings = args
                .as_array()
                .is_some_and(|a| a.iter().all(Value::is_string));
            if !all_strings {
                errors.push("config.args must be an array of strings".to_string());
            }
        }
        if step.config.get("env").is_some_and(|e| !e.is_object()) {
            errors.push("config.env must be an object".to_string());
        }
        if let Some(timeout) = step.config.get("timeout") {
            if timeout.as_u64().is_none_or(|t| t == 0) {
                errors.push("config.timeout must be a positive number of milliseconds".to_string());
            }
        }
        ValidationReport::from_errors(errors)
    }

    async fn execute(&self, step: &WorkflowStep, scope: &StepScope) -> Result<Value, WorkflowError> {
        let spec = Self::command_spec(step, scope)?;
        Self::run_spec(step, scope, &spec).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use conductor_core::plugin::registry::PluginRegistry;
    use conductor_core::state::{InMemoryStateStore, StateStore as _};
    use conductor_core::workflow::builtin::ExecutorRegistry;
    use conductor_core::workflow::context::WorkflowContext;
    use conductor_core::workflow::executor::BoxStepExecutor;
    use conductor_core::workflow::runner::{RunOptions, WorkflowRunner};
    use conductor_types::config::{EngineConfig, VariableWriteMode};
    use conductor_types::workflow::{SkipReason, StepStatus, WorkflowDefinition, WorkflowStatus};

    fn step(config: Value) -> WorkflowStep {
        serde_json::from_value(json!({ "id": "s", "type": "script", "config": config })).unwrap()
    }

    fn scope() -> StepScope {
        let ctx = WorkflowContext::new("run-9", "flow", VariableWriteMode::LastWriteWins);
        ctx.set_variable("name", json!("conductor"));
        ctx.set_env("STAGE", "test");
        StepScope::new(Arc::new(ctx), "s")
    }

    fn runner() -> WorkflowRunner<InMemoryStateStore> {
        let mut executors = ExecutorRegistry::new();
        executors
            .register_builtin(BoxStepExecutor::new(ScriptExecutor::new()))
            .unwrap();
        WorkflowRunner::new(
            InMemoryStateStore::new(),
            executors,
            Arc::new(PluginRegistry::new(4)),
            EngineConfig::default(),
        )
    }

    #[test]
    fn test_validate_config() {
        let exec = ScriptExecutor::new();
        assert!(exec.validate(&step(json!({ "command": "ls" }))).valid);
        let report = exec.validate(&step(json!({ "args": [1], "timeout": 0, "env": "x" })));
        assert_eq!(report.errors.len(), 4);
    }

    #[tokio::test]
    async fn test_runs_with_interpolation_and_env() {
        let output = ScriptExecutor::new()
            .execute(
                &step(json!({
                    "command": "echo {{vars.name}} $STAGE $EXTRA $CONDUCTOR_RUN_ID",
                    "env": { "EXTRA": "x-{{vars.name}}" }
                })),
                &scope(),
            )
            .await
            .unwrap();
        assert_eq!(output["stdout"], "conductor test x-conductor run-9");
        assert_eq!(output["exitCode"], 0);
    }

    #[tokio::test]
    async fn test_program_mode_passes_args_verbatim() {
        let output = ScriptExecutor::new()
            .execute(
                &step(json!({ "command": "printf", "args": ["%s|%s", "a b", "c"] })),
                &scope(),
            )
            .await
            .unwrap();
        assert_eq!(output["stdout"], "a b|c");
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_with_stderr() {
        let err = ScriptExecutor::new()
            .execute(&step(json!({ "command": "echo nope >&2; exit 4" })), &scope())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "step 's' failed: exit code 4: nope");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_parse_json_output() {
        let output = ScriptExecutor::new()
            .execute(
                &step(json!({ "command": "echo '{\"count\": 3}'", "parseJson": true })),
                &scope(),
            )
            .await
            .unwrap();
        assert_eq!(output["json"]["count"], 3);
    }

    #[tokio::test]
    async fn test_script_timeout_fails_fast_and_skips_dependents() {
        let runner = runner();
        let def: WorkflowDefinition = serde_json::from_value(json!({
            "name": "slow-flow",
            "version": "1.0.0",
            "steps": [
                { "id": "sleepy", "type": "script",
                  "config": { "command": "sleep 5", "timeout": 100 } },
                { "id": "after", "type": "script", "dependsOn": ["sleepy"],
                  "config": { "command": "echo never" } }
            ]
        }))
        .unwrap();

        let started = std::time::Instant::now();
        let options = RunOptions {
            run_id: Some("slow".into()),
            ..RunOptions::default()
        };
        let result = runner.run(&def, HashMap::new(), options).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(result.status, WorkflowStatus::Failed);
        let failure = result.step_results["sleepy"].error.clone().unwrap();
        assert!(failure.contains("timed out after 100ms"), "{failure}");

        let state = runner.checkpoint().store().load("slow").await.unwrap().unwrap();
        assert_eq!(state.step_status("after"), Some(StepStatus::Skipped));
        assert_eq!(
            state.step_states["after"].skip_reason,
            Some(SkipReason::DependencyFailed)
        );
    }
}
