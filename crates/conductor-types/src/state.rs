//! Persisted run state.
//!
//! `WorkflowState` is the durable projection of a run: it is created when a
//! run starts, rewritten on every step transition, and is the only object
//! read back on resume. The JSON shape is camelCase:
//!
//! ```json
//! {
//!   "workflowId": "...", "workflowName": "...", "status": "running",
//!   "executionOrder": ["a", "b"],
//!   "stepStates": { "a": { "status": "completed", "result": { ... } } },
//!   "resumeCount": 0,
//!   "executionMetadata": { "createdAt": "2026-01-01T00:00:00Z", ... },
//!   "context": { ... }
//! }
//! ```
//!
//! Timestamps are typed `DateTime<Utc>` values, written as RFC 3339 strings
//! and parsed back into dates on load.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::{SkipReason, StepResult, StepStatus, WorkflowStatus};

// ---------------------------------------------------------------------------
// Step state
// ---------------------------------------------------------------------------

/// Persisted status of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
}

impl StepState {
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            result: None,
            skip_reason: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// One resume of a persisted run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRecord {
    pub reason: String,
    pub resumed_at: DateTime<Utc>,
    /// Status the run had when it was resumed.
    pub previous_status: WorkflowStatus,
}

/// Why and when a run was interrupted (pause or shutdown).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptionRecord {
    pub reason: String,
    pub at: DateTime<Utc>,
    /// Steps that were still executing when the run was interrupted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interrupted_steps: Vec<String>,
}

/// Timestamps and bookkeeping carried alongside the run state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resume_history: Vec<ResumeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interruption: Option<InterruptionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Definition version the run was started with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_version: Option<String>,
}

impl ExecutionMetadata {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            resume_history: Vec::new(),
            interruption: None,
            error: None,
            workflow_version: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Context snapshot
// ---------------------------------------------------------------------------

/// Severity of a run log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One line of the run-scoped log buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub message: String,
}

/// Immutable copy of a workflow context, taken at persistence points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    pub workflow_name: String,
    pub run_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    #[serde(default)]
    pub step_outputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

// ---------------------------------------------------------------------------
// WorkflowState
// ---------------------------------------------------------------------------

/// Durable snapshot of a run, keyed by `workflow_id` (the run ID).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    /// Run identifier, unique per run.
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    /// Topological order the resolver produced.
    pub execution_order: Vec<String>,
    pub step_states: BTreeMap<String, StepState>,
    #[serde(default)]
    pub resume_count: u32,
    pub execution_metadata: ExecutionMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextSnapshot>,
}

impl WorkflowState {
    /// Fresh `Pending` state with every step pending.
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_name: impl Into<String>,
        execution_order: Vec<String>,
    ) -> Self {
        let step_states = execution_order
            .iter()
            .map(|id| (id.clone(), StepState::pending()))
            .collect();
        Self {
            workflow_id: workflow_id.into(),
            workflow_name: workflow_name.into(),
            status: WorkflowStatus::Pending,
            execution_order,
            step_states,
            resume_count: 0,
            execution_metadata: ExecutionMetadata::new(Utc::now()),
            context: None,
        }
    }

    /// A run can be resumed unless it completed or was cancelled.
    pub fn can_resume(&self) -> bool {
        !matches!(
            self.status,
            WorkflowStatus::Completed | WorkflowStatus::Cancelled
        )
    }

    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.step_states.get(step_id).map(|s| s.status)
    }

    /// IDs of steps that completed, in execution order.
    pub fn completed_steps(&self) -> Vec<String> {
        self.steps_with(StepStatus::Completed)
    }

    /// IDs of steps that failed, in execution order.
    pub fn failed_steps(&self) -> Vec<String> {
        self.steps_with(StepStatus::Failed)
    }

    /// IDs of steps currently marked running, in execution order.
    pub fn running_steps(&self) -> Vec<String> {
        self.steps_with(StepStatus::Running)
    }

    fn steps_with(&self, status: StepStatus) -> Vec<String> {
        self.execution_order
            .iter()
            .filter(|id| self.step_status(id) == Some(status))
            .cloned()
            .collect()
    }

    /// Bump `updated_at`.
    pub fn touch(&mut self) {
        self.execution_metadata.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_state() -> WorkflowState {
        let mut state = WorkflowState::new(
            "run-1",
            "nightly",
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
        );
        state.status = WorkflowStatus::Running;
        state.step_states.insert(
            "a".to_string(),
            StepState {
                status: StepStatus::Completed,
                result: Some(StepResult::succeeded(json!({"ok": true}), 12)),
                skip_reason: None,
            },
        );
        state.step_states.insert(
            "b".to_string(),
            StepState {
                status: StepStatus::Skipped,
                result: None,
                skip_reason: Some(SkipReason::Condition),
            },
        );
        state.execution_metadata.started_at = Some(Utc::now());
        state.execution_metadata.resume_history.push(ResumeRecord {
            reason: "restart".to_string(),
            resumed_at: Utc::now(),
            previous_status: WorkflowStatus::Paused,
        });
        state
    }

    #[test]
    fn test_state_json_roundtrip_preserves_dates() {
        let state = sample_state();
        let json = serde_json::to_string(&state).unwrap();
        let restored: WorkflowState = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, state);
        assert_eq!(
            restored.execution_metadata.created_at,
            state.execution_metadata.created_at
        );
        // Second serialization is byte-identical.
        assert_eq!(serde_json::to_string(&restored).unwrap(), json);
    }

    #[test]
    fn test_state_document_shape() {
        let value = serde_json::to_value(sample_state()).unwrap();
        for key in [
            "workflowId",
            "workflowName",
            "status",
            "executionOrder",
            "stepStates",
            "resumeCount",
            "executionMetadata",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["stepStates"]["b"]["skipReason"], json!("condition"));
        assert!(value["executionMetadata"]["createdAt"].is_string());
    }

    #[test]
    fn test_can_resume_by_status() {
        let mut state = sample_state();
        for (status, expected) in [
            (WorkflowStatus::Pending, true),
            (WorkflowStatus::Running, true),
            (WorkflowStatus::Paused, true),
            (WorkflowStatus::Failed, true),
            (WorkflowStatus::Completed, false),
            (WorkflowStatus::Cancelled, false),
        ] {
            state.status = status;
            assert_eq!(state.can_resume(), expected, "status {status}");
        }
    }

    #[test]
    fn test_step_queries_follow_execution_order() {
        let state = sample_state();
        assert_eq!(state.completed_steps(), vec!["a"]);
        assert!(state.failed_steps().is_empty());
        assert_eq!(state.step_status("c"), Some(StepStatus::Pending));
        assert_eq!(state.step_status("zzz"), None);
    }
}
