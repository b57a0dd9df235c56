//! Error taxonomy for workflow runs.
//!
//! Every failure the engine produces is a `WorkflowError`. Step failures end
//! up as `StepResult.error` strings; everything else is surfaced to the
//! caller of `run` / `resume`.

use thiserror::Error;

use crate::state::StateStoreError;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while validating or running a workflow.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkflowError {
    /// Structural validation failure (ids, versions, executor checks).
    #[error("validation error: {0}")]
    Validation(String),

    /// A step references an unknown or invalid dependency.
    #[error("dependency error: {0}")]
    Dependency(String),

    /// The dependency graph contains a cycle.
    #[error("circular dependency: {}", path.join(" -> "))]
    CircularDependency { path: Vec<String> },

    /// A step failed while executing.
    #[error("step '{step_id}' failed: {message}")]
    Step { step_id: String, message: String },

    /// A step, sandbox, or whole run exceeded its time budget.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Execution was cancelled.
    #[error("cancelled: {reason}")]
    Cancelled { reason: String },

    /// No executor is available for a step type, or it rejected the step.
    #[error("executor error for step type '{step_type}': {message}")]
    Executor { step_type: String, message: String },

    /// Engine configuration is unusable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// One or more steps of a parallel group failed.
    #[error("{} step(s) failed in parallel group", failures.len())]
    ParallelExecution { failures: Vec<(String, String)> },

    /// A resource ceiling (memory, slots) was exceeded.
    #[error("resource '{resource}' exceeded limit {limit}")]
    Resource { resource: String, limit: u64 },

    /// A condition expression could not be parsed or evaluated.
    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    /// A sandboxed executor attempted a denied operation.
    #[error("sandbox violation: {0}")]
    SandboxViolation(String),

    /// The primary state document could not be written or read.
    #[error("persistence error: {0}")]
    Persistence(String),
}

/// Coarse classification of a `WorkflowError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Dependency,
    CircularDependency,
    Step,
    Timeout,
    Cancelled,
    Executor,
    Configuration,
    ParallelExecution,
    Resource,
    InvalidExpression,
    SandboxViolation,
    Persistence,
}

/// Lower-cased fragments that mark a transient, network-flavoured failure.
const TRANSIENT_PATTERNS: &[&str] = &[
    "connection reset",
    "connection refused",
    "connection aborted",
    "broken pipe",
    "econnreset",
    "econnrefused",
    "enotfound",
    "etimedout",
    "dns",
    "timed out",
    "timeout",
    "rate limit",
    "rate-limit",
    "too many requests",
    "service unavailable",
    "bad gateway",
    "gateway timeout",
];

/// HTTP status codes treated as transient.
const TRANSIENT_STATUS_CODES: &[&str] = &["429", "502", "503", "504"];

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::Validation(_) => ErrorKind::Validation,
            WorkflowError::Dependency(_) => ErrorKind::Dependency,
            WorkflowError::CircularDependency { .. } => ErrorKind::CircularDependency,
            WorkflowError::Step { .. } => ErrorKind::Step,
            WorkflowError::Timeout { .. } => ErrorKind::Timeout,
            WorkflowError::Cancelled { .. } => ErrorKind::Cancelled,
            WorkflowError::Executor { .. } => ErrorKind::Executor,
            WorkflowError::Configuration(_) => ErrorKind::Configuration,
            WorkflowError::ParallelExecution { .. } => ErrorKind::ParallelExecution,
            WorkflowError::Resource { .. } => ErrorKind::Resource,
            WorkflowError::InvalidExpression(_) => ErrorKind::InvalidExpression,
            WorkflowError::SandboxViolation(_) => ErrorKind::SandboxViolation,
            WorkflowError::Persistence(_) => ErrorKind::Persistence,
        }
    }

    /// Whether retrying the failed operation might succeed.
    ///
    /// Timeouts and step failures whose message looks like a transient
    /// network problem are retryable. Everything else is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkflowError::Timeout { .. } => true,
            WorkflowError::Step { message, .. } => is_transient_message(message),
            _ => false,
        }
    }

    /// Shorthand for a step failure.
    pub fn step(step_id: impl Into<String>, message: impl Into<String>) -> Self {
        WorkflowError::Step {
            step_id: step_id.into(),
            message: message.into(),
        }
    }
}

/// Match a failure message against the transient patterns.
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return true;
    }
    lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| TRANSIENT_STATUS_CODES.contains(&token))
}

impl From<StateStoreError> for WorkflowError {
    fn from(err: StateStoreError) -> Self {
        WorkflowError::Persistence(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
