//! Workflow domain types for Conductor.
//!
//! `WorkflowDefinition` is the already-validated input the engine consumes
//! (file loading, schema checks, and template inheritance happen upstream).
//! This module also holds the per-step result and status types produced
//! while a workflow runs, and the `WorkflowResult` handed back to callers.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::ConditionSpec;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A declarative workflow: named steps wired together by `depends_on` edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Human-readable workflow name.
    pub name: String,
    /// Semantic version string (e.g. "1.0.0").
    pub version: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Workflow-level timeout in milliseconds (overrides the engine default).
    #[serde(default, rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Environment overlay applied to every step of a run.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Extensible metadata, carried through untouched.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    /// Ordered list of steps forming the workflow DAG.
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    /// Look up a step by ID.
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Parse `version` as a semantic version.
    pub fn semver(&self) -> Result<semver::Version, semver::Error> {
        semver::Version::parse(&self.version)
    }
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single unit of work in a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    /// Step ID, unique within the workflow, matching `[a-zA-Z0-9_-]+`.
    pub id: String,
    /// Human-readable step name. Falls back to the ID when empty.
    #[serde(default)]
    pub name: String,
    /// Step type: a built-in (`script`, `agent`, `condition`) or a
    /// plugin-registered type.
    #[serde(rename = "type")]
    pub step_type: String,
    /// Type-specific configuration payload.
    #[serde(default)]
    pub config: Value,
    /// Step IDs this step depends on (DAG edges).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Gate evaluated before the step runs; false skips the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionSpec>,
    /// Keep going when this step (or one of its dependencies) fails.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Step-level timeout in milliseconds.
    #[serde(default, rename = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Parallel execution settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<ParallelConfig>,
    /// Retry settings for retryable failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

impl WorkflowStep {
    /// Display name, defaulting to the ID.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Whether this step may share a parallel group with its siblings.
    pub fn is_parallel(&self) -> bool {
        self.parallel.as_ref().is_some_and(|p| p.enabled)
    }

    /// Named resource tag capping concurrency across groups, if any.
    pub fn resource_tag(&self) -> Option<&str> {
        self.parallel.as_ref().and_then(|p| p.resource.as_deref())
    }

    /// Explicit per-group concurrency cap, if set.
    pub fn max_concurrency(&self) -> Option<usize> {
        self.parallel.as_ref().and_then(|p| p.max_concurrency)
    }

    /// Read a string field from `config`.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

/// Parallel execution settings for a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelConfig {
    /// Whether the step may run concurrently with its group.
    #[serde(default)]
    pub enabled: bool,
    /// Maximum concurrently running steps of the group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    /// Named resource tag (a shared counting semaphore).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

/// Retry configuration for a workflow step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt in milliseconds (default 1000).
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Multiplier applied to the delay after each attempt (default 2.0).
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Delay before attempt number `attempt + 1` (`attempt` is 1-based).
    pub fn delay_after(&self, attempt: u32) -> std::time::Duration {
        let factor = self
            .backoff_multiplier
            .max(1.0)
            .powi(attempt.saturating_sub(1) as i32);
        std::time::Duration::from_millis((self.backoff_ms as f64 * factor) as u64)
    }
}

// ---------------------------------------------------------------------------
// Execution Status
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal states never transition again without a resume.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Status of an individual step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Why a step was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The step's condition evaluated to false.
    Condition,
    /// A dependency failed and the step does not continue on error.
    DependencyFailed,
    /// The run stopped dispatching (fail-fast, timeout, cancellation).
    RunAborted,
}

// ---------------------------------------------------------------------------
// Step Result
// ---------------------------------------------------------------------------

/// The outcome of one step in one run attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock execution time in milliseconds.
    #[serde(rename = "executionTime")]
    pub execution_time_ms: u64,
    /// Index of the parallel group the step ran in, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<usize>,
    /// Number of attempts made (retries included).
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_attempts() -> u32 {
    1
}

impl StepResult {
    /// A successful result carrying `output`.
    pub fn succeeded(output: Value, execution_time_ms: u64) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
            execution_time_ms,
            parallel_group: None,
            attempts: 1,
            started_at: None,
            completed_at: Some(Utc::now()),
        }
    }

    /// A failed result carrying an error message.
    pub fn failed(error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            execution_time_ms,
            parallel_group: None,
            attempts: 1,
            started_at: None,
            completed_at: Some(Utc::now()),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow Result
// ---------------------------------------------------------------------------

/// Concurrency statistics for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelStats {
    /// Number of parallel groups dispatched.
    pub groups: usize,
    /// Steps that ran inside a parallel group.
    pub parallel_steps: usize,
    /// Highest number of steps observed executing at once.
    pub max_observed_concurrency: usize,
}

/// What `run` / `resume` hand back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResult {
    pub run_id: String,
    pub status: WorkflowStatus,
    pub success: bool,
    pub step_results: BTreeMap<String, StepResult>,
    /// Wall-clock run time in milliseconds.
    #[serde(rename = "executionTime")]
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_stats: Option<ParallelStats>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_definition_json_camel_case() {
        let raw = json!({
            "name": "build",
            "version": "1.2.0",
            "timeout": 60000,
            "steps": [
                {
                    "id": "compile",
                    "name": "Compile",
                    "type": "script",
                    "config": { "command": "make" },
                    "continueOnError": true,
                    "parallel": { "enabled": true, "maxConcurrency": 2, "resource": "cpu" }
                },
                {
                    "id": "test",
                    "type": "script",
                    "dependsOn": ["compile"],
                    "timeout": 100
                }
            ]
        });

        let def: WorkflowDefinition = serde_json::from_value(raw).unwrap();
        assert_eq!(def.timeout_ms, Some(60_000));
        assert_eq!(def.steps.len(), 2);

        let compile = def.step("compile").unwrap();
        assert!(compile.continue_on_error);
        assert!(compile.is_parallel());
        assert_eq!(compile.max_concurrency(), Some(2));
        assert_eq!(compile.resource_tag(), Some("cpu"));
        assert_eq!(compile.config_str("command"), Some("make"));

        let test = def.step("test").unwrap();
        assert_eq!(test.depends_on, vec!["compile"]);
        assert_eq!(test.timeout_ms, Some(100));
        assert_eq!(test.display_name(), "test");
        assert!(!test.is_parallel());
    }

    #[test]
    fn test_definition_yaml_parses() {
        let yaml = r#"
name: nightly
version: 0.3.1
env:
  RUST_LOG: debug
steps:
  - id: fetch
    name: Fetch
    type: agent
    config:
      agent: researcher
      prompt: "Find news"
"#;
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(def.env.get("RUST_LOG").map(String::as_str), Some("debug"));
        assert_eq!(def.semver().unwrap(), semver::Version::new(0, 3, 1));
    }

    #[test]
    fn test_retry_backoff_grows() {
        let retry = RetryConfig {
            max_attempts: 4,
            backoff_ms: 100,
            backoff_multiplier: 2.0,
        };
        assert_eq!(retry.delay_after(1).as_millis(), 100);
        assert_eq!(retry.delay_after(2).as_millis(), 200);
        assert_eq!(retry.delay_after(3).as_millis(), 400);
    }

    #[test]
    fn test_status_serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&WorkflowStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
        assert_eq!(
            serde_json::to_string(&SkipReason::DependencyFailed).unwrap(),
            "\"dependency_failed\""
        );
        let status: StepStatus = serde_json::from_str("\"skipped\"").unwrap();
        assert_eq!(status, StepStatus::Skipped);
    }

    #[test]
    fn test_step_result_execution_time_key() {
        let result = StepResult::succeeded(json!({"ok": true}), 42);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["executionTime"], json!(42));
        assert_eq!(value["success"], json!(true));
        assert!(value.get("error").is_none());
    }
}
