//! Built-in step types and the table that maps them to executors.
//!
//! `condition` and `agent` live here; `script` needs process spawning and is
//! registered by the infrastructure layer.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use conductor_types::condition::ConditionSpec;
use conductor_types::workflow::WorkflowStep;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::error::WorkflowError;
use super::executor::{BoxStepExecutor, StepExecutor, StepScope, ValidationReport};
use super::expression::{ConditionEvaluator, compile};

// ---------------------------------------------------------------------------
// Step type enum
// ---------------------------------------------------------------------------

/// Step types the engine ships with. Plugins may not claim these names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinStepType {
    Script,
    Agent,
    Condition,
}

impl BuiltinStepType {
    pub const ALL: [BuiltinStepType; 3] = [
        BuiltinStepType::Script,
        BuiltinStepType::Agent,
        BuiltinStepType::Condition,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "script" => Some(BuiltinStepType::Script),
            "agent" => Some(BuiltinStepType::Agent),
            "condition" => Some(BuiltinStepType::Condition),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuiltinStepType::Script => "script",
            BuiltinStepType::Agent => "agent",
            BuiltinStepType::Condition => "condition",
        }
    }
}

impl fmt::Display for BuiltinStepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ExecutorRegistry
// ---------------------------------------------------------------------------

/// Executors for the built-in step types.
#[derive(Debug, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<BuiltinStepType, BoxStepExecutor>,
}

impl ExecutorRegistry {
    /// Registry with the `condition` executor preinstalled.
    pub fn new() -> Self {
        let mut executors = HashMap::new();
        executors.insert(
            BuiltinStepType::Condition,
            BoxStepExecutor::new(ConditionExecutor::default()),
        );
        Self { executors }
    }

    /// Install the executor for a built-in type, replacing any previous one.
    ///
    /// Rejects executors whose `supported_type` is not a built-in.
    pub fn register_builtin(&mut self, executor: BoxStepExecutor) -> Result<(), WorkflowError> {
        let kind = BuiltinStepType::parse(executor.supported_type()).ok_or_else(|| {
            WorkflowError::Executor {
                step_type: executor.supported_type().to_string(),
                message: "not a built-in step type".to_string(),
            }
        })?;
        self.executors.insert(kind, executor);
        Ok(())
    }

    pub fn get(&self, step_type: &str) -> Option<BoxStepExecutor> {
        BuiltinStepType::parse(step_type).and_then(|kind| self.executors.get(&kind).cloned())
    }

    pub fn contains(&self, kind: BuiltinStepType) -> bool {
        self.executors.contains_key(&kind)
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// condition
// ---------------------------------------------------------------------------

/// Evaluates `config.expression` and outputs `{result, expression}`.
///
/// With `config.failOnFalse` a false result fails the step.
#[derive(Debug, Default)]
pub struct ConditionExecutor {
    evaluator: ConditionEvaluator,
}

fn condition_spec(step: &WorkflowStep) -> Result<ConditionSpec, String> {
    let raw = step
        .config
        .get("expression")
        .ok_or_else(|| "config.expression is required".to_string())?;
    serde_json::from_value(raw.clone())
        .map_err(|e| format!("config.expression is not a condition: {e}"))
}

impl StepExecutor for ConditionExecutor {
    fn supported_type(&self) -> &str {
        BuiltinStepType::Condition.as_str()
    }

    fn validate(&self, step: &WorkflowStep) -> ValidationReport {
        let errors = match condition_spec(step).and_then(|spec| {
            compile(&spec).map(|_| ()).map_err(|e| e.to_string())
        }) {
            Ok(()) => Vec::new(),
            Err(e) => vec![e],
        };
        ValidationReport::from_errors(errors)
    }

    async fn execute(&self, step: &WorkflowStep, scope: &StepScope) -> Result<Value, WorkflowError> {
        let spec = condition_spec(step).map_err(|e| WorkflowError::step(&step.id, e))?;
        let outcome = self.evaluator.evaluate(&spec, &scope.context);
        if let Some(error) = &outcome.error {
            tracing::warn!(step_id = step.id.as_str(), error = %error, "condition evaluated as false");
        }

        let fail_on_false = step
            .config
            .get("failOnFalse")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if fail_on_false && !outcome.result {
            return Err(WorkflowError::step(
                &step.id,
                format!("condition is false: {}", outcome.rendered),
            ));
        }

        Ok(json!({
            "result": outcome.result,
            "expression": outcome.rendered,
        }))
    }
}

// ---------------------------------------------------------------------------
// agent
// ---------------------------------------------------------------------------

/// One agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRequest {
    pub agent: String,
    /// Prompt with context references already interpolated.
    pub prompt: String,
    pub model: Option<String>,
    pub run_id: String,
    pub step_id: String,
}

/// Collaborator that talks to an AI agent and returns its reply text.
///
/// Object-safe so the runner can hold it behind `Arc<dyn AgentInvoker>`.
pub trait AgentInvoker: Send + Sync {
    fn invoke<'a>(
        &'a self,
        request: &'a AgentRequest,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<String, WorkflowError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn from_config(step: &WorkflowStep) -> Result<Self, String> {
        match step.config_str("outputFormat") {
            None | Some("text") => Ok(OutputFormat::Text),
            Some("json") => Ok(OutputFormat::Json),
            Some(other) => Err(format!("unsupported outputFormat '{other}'")),
        }
    }
}

/// Runs `agent` steps through an `AgentInvoker`.
pub struct AgentExecutor {
    invoker: Arc<dyn AgentInvoker>,
}

impl AgentExecutor {
    pub fn new(invoker: Arc<dyn AgentInvoker>) -> Self {
        Self { invoker }
    }
}

/// Strip a surrounding markdown code fence, if any.
fn unfence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
    body.strip_suffix("```").unwrap_or(body).trim()
}

impl StepExecutor for AgentExecutor {
    fn supported_type(&self) -> &str {
        BuiltinStepType::Agent.as_str()
    }

    fn validate(&self, step: &WorkflowStep) -> ValidationReport {
        let mut errors = Vec::new();
        if step.config_str("agent").is_none_or(|a| a.trim().is_empty()) {
            errors.push("config.agent is required".to_string());
        }
        if step.config_str("prompt").is_none() {
            errors.push("config.prompt is required".to_string());
        }
        if let Err(e) = OutputFormat::from_config(step) {
            errors.push(e);
        }
        ValidationReport::from_errors(errors)
    }

    async fn execute(&self, step: &WorkflowStep, scope: &StepScope) -> Result<Value, WorkflowError> {
        let format = OutputFormat::from_config(step).map_err(|e| WorkflowError::step(&step.id, e))?;
        let agent = step
            .config_str("agent")
            .ok_or_else(|| WorkflowError::step(&step.id, "config.agent is required"))?;
        let prompt = step
            .config_str("prompt")
            .ok_or_else(|| WorkflowError::step(&step.id, "config.prompt is required"))?;

        let request = AgentRequest {
            agent: agent.to_string(),
            prompt: scope.context.interpolate(prompt),
            model: step.config_str("model").map(str::to_string),
            run_id: scope.context.run_id().to_string(),
            step_id: step.id.clone(),
        };
        tracing::debug!(step_id = step.id.as_str(), agent, "invoking agent");
        let reply = self.invoker.invoke(&request, &scope.cancel).await?;

        let response = match format {
            OutputFormat::Text => Value::String(reply),
            OutputFormat::Json => serde_json::from_str(unfence(&reply)).map_err(|e| {
                WorkflowError::step(&step.id, format!("agent reply is not valid JSON: {e}"))
            })?,
        };

        Ok(json!({
            "agent": request.agent,
            "model": request.model,
            "response": response,
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
