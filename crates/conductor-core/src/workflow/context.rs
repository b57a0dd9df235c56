//! Run-scoped execution context with step output tracking and template
//! resolution.
//!
//! One `WorkflowContext` is created per run and shared (`Arc`) by every step
//! task of that run. Step outputs are write-once. Variables are last-write-
//! wins across concurrent steps unless the run uses
//! `VariableWriteMode::Serialized`, in which case `update_variable` holds a
//! lock across its read-modify-write.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{LazyLock, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use conductor_types::config::VariableWriteMode;
use conductor_types::state::{ContextSnapshot, LogEntry, LogLevel};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use regex::Regex;
use serde_json::{Value, json};

use super::error::WorkflowError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single step output (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum number of log lines kept per run; older lines are dropped.
pub const MAX_LOG_ENTRIES: usize = 10_000;

/// `{{ path }}` template references.
static TEMPLATE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").ok());

// ---------------------------------------------------------------------------
// WorkflowContext
// ---------------------------------------------------------------------------

/// Shared state of one run.
#[derive(Debug)]
pub struct WorkflowContext {
    run_id: String,
    workflow_name: String,
    start_time: DateTime<Utc>,
    variables: DashMap<String, Value>,
    step_outputs: DashMap<String, Value>,
    environment: DashMap<String, String>,
    logs: Mutex<VecDeque<LogEntry>>,
    write_mode: VariableWriteMode,
    variable_lock: Mutex<()>,
}

impl WorkflowContext {
    pub fn new(
        run_id: impl Into<String>,
        workflow_name: impl Into<String>,
        write_mode: VariableWriteMode,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            workflow_name: workflow_name.into(),
            start_time: Utc::now(),
            variables: DashMap::new(),
            step_outputs: DashMap::new(),
            environment: DashMap::new(),
            logs: Mutex::new(VecDeque::new()),
            write_mode,
            variable_lock: Mutex::new(()),
        }
    }

    /// Rebuild a context from a persisted snapshot.
    pub fn restore(snapshot: ContextSnapshot, write_mode: VariableWriteMode) -> Self {
        Self {
            run_id: snapshot.run_id,
            workflow_name: snapshot.workflow_name,
            start_time: snapshot.start_time,
            variables: snapshot.variables.into_iter().collect(),
            step_outputs: snapshot.step_outputs.into_iter().collect(),
            environment: snapshot.environment.into_iter().collect(),
            logs: Mutex::new(snapshot.logs.into()),
            write_mode,
            variable_lock: Mutex::new(()),
        }
    }

    /// Immutable, serializable copy of the current context.
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            workflow_name: self.workflow_name.clone(),
            run_id: self.run_id.clone(),
            start_time: self.start_time,
            variables: self.variables(),
            step_outputs: self.step_outputs(),
            environment: self.environment(),
            logs: self.logs(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn write_mode(&self) -> VariableWriteMode {
        self.write_mode
    }

    // -----------------------------------------------------------------------
    // Variables
    // -----------------------------------------------------------------------

    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.variables.get(name).map(|v| v.value().clone())
    }

    pub fn variables(&self) -> BTreeMap<String, Value> {
        self.variables
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Read-modify-write a variable and return the new value.
    ///
    /// Under `LastWriteWins` the read and the write are separate operations,
    /// so concurrent updates of the same name can lose writes. Under
    /// `Serialized` the whole update runs under the context's variable lock.
    pub fn update_variable<F>(&self, name: &str, update: F) -> Value
    where
        F: FnOnce(Option<&Value>) -> Value,
    {
        let _guard = match self.write_mode {
            VariableWriteMode::Serialized => Some(lock(&self.variable_lock)),
            VariableWriteMode::LastWriteWins => None,
        };
        let current = self.get_variable(name);
        let next = update(current.as_ref());
        self.variables.insert(name.to_string(), next.clone());
        next
    }

    // -----------------------------------------------------------------------
    // Step outputs
    // -----------------------------------------------------------------------

    /// Record the output of a completed step. Each step may record once.
    ///
    /// Outputs larger than `MAX_STEP_OUTPUT_SIZE` are replaced by a
    /// truncation marker.
    pub fn set_step_output(&self, step_id: &str, output: Value) -> Result<(), WorkflowError> {
        let serialized_len = serde_json::to_vec(&output)
            .map_err(|e| WorkflowError::step(step_id, format!("output is not serializable: {e}")))?
            .len();

        let stored = if serialized_len > MAX_STEP_OUTPUT_SIZE {
            tracing::warn!(
                run_id = %self.run_id,
                step_id,
                size = serialized_len,
                max = MAX_STEP_OUTPUT_SIZE,
                "step output exceeds size limit, truncating"
            );
            json!({
                "_truncated": true,
                "_original_size": serialized_len,
                "_message": format!(
                    "output exceeded {MAX_STEP_OUTPUT_SIZE} byte limit and was truncated"
                )
            })
        } else {
            output
        };

        match self.step_outputs.entry(step_id.to_string()) {
            Entry::Occupied(_) => Err(WorkflowError::step(
                step_id,
                "output already recorded for this run",
            )),
            Entry::Vacant(slot) => {
                slot.insert(stored);
                Ok(())
            }
        }
    }

    pub fn get_step_output(&self, step_id: &str) -> Option<Value> {
        self.step_outputs.get(step_id).map(|v| v.value().clone())
    }

    pub fn has_step_output(&self, step_id: &str) -> bool {
        self.step_outputs.contains_key(step_id)
    }

    /// Drop a recorded output (used when a resumed run re-executes a step).
    pub fn forget_step_output(&self, step_id: &str) {
        self.step_outputs.remove(step_id);
    }

    pub fn step_outputs(&self) -> BTreeMap<String, Value> {
        self.step_outputs
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Environment
    // -----------------------------------------------------------------------

    pub fn set_env(&self, name: impl Into<String>, value: impl Into<String>) {
        self.environment.insert(name.into(), value.into());
    }

    pub fn extend_env<I, K, V>(&self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.set_env(k, v);
        }
    }

    pub fn get_env(&self, name: &str) -> Option<String> {
        self.environment.get(name).map(|v| v.value().clone())
    }

    pub fn environment(&self) -> BTreeMap<String, String> {
        self.environment
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Release the environment overlay.
    pub fn clear_environment(&self) {
        self.environment.clear();
    }

    // -----------------------------------------------------------------------
    // Logs
    // -----------------------------------------------------------------------

    /// Append a line to the run log buffer.
    pub fn log(&self, level: LogLevel, step_id: Option<&str>, message: impl Into<String>) {
        let mut logs = lock(&self.logs);
        if logs.len() >= MAX_LOG_ENTRIES {
            logs.pop_front();
        }
        logs.push_back(LogEntry {
            timestamp: Utc::now(),
            level,
            step_id: step_id.map(str::to_string),
            message: message.into(),
        });
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        lock(&self.logs).iter().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Lookup and templates
    // -----------------------------------------------------------------------

    /// Resolve a dotted reference.
    ///
    /// Supported roots:
    /// - `steps.<id>[.output][.<path>]` -- a recorded step output
    /// - `variables.<path>` / `vars.<path>` -- a variable
    /// - `env.<NAME>` -- the environment overlay
    /// - `workflow.name`, `workflow.runId`
    /// - `<name>[.<path>]` -- shorthand for a variable
    pub fn get_path(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.').map(str::trim);
        let root = segments.next()?;

        match root {
            "steps" => {
                let step_id = segments.next()?;
                let output = self.get_step_output(step_id)?;
                let rest: Vec<&str> = segments.collect();
                let rest = match rest.split_first() {
                    // `output` names the recorded value itself unless the value
                    // has its own `output` field.
                    Some((&"output", tail)) if output.get("output").is_none() => tail,
                    _ => rest.as_slice(),
                };
                walk(&output, rest)
            }
            "variables" | "vars" => {
                let name = segments.next()?;
                let value = self.get_variable(name)?;
                let rest: Vec<&str> = segments.collect();
                walk(&value, &rest)
            }
            "env" => {
                let name = segments.next()?;
                if segments.next().is_some() {
                    return None;
                }
                self.get_env(name).map(Value::String)
            }
            "workflow" => match (segments.next()?, segments.next()) {
                ("name", None) => Some(Value::String(self.workflow_name.clone())),
                ("runId" | "run_id", None) => Some(Value::String(self.run_id.clone())),
                _ => None,
            },
            name => {
                let value = self.get_variable(name)?;
                let rest: Vec<&str> = segments.collect();
                walk(&value, &rest)
            }
        }
    }

    /// Replace every `{{ ref }}` in `template` with its resolved value.
    ///
    /// Unresolved references are left as-is (not an error).
    pub fn interpolate(&self, template: &str) -> String {
        let Some(re) = TEMPLATE_RE.as_ref() else {
            return template.to_string();
        };
        re.replace_all(template, |caps: &regex::Captures<'_>| {
            match self.get_path(&caps[1]) {
                Some(value) => value_to_string(&value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
    }

    /// Resolve a template to a typed value.
    ///
    /// A template that is exactly one `{{ ref }}` yields the referenced value
    /// unchanged (`None` when unresolved); anything else is interpolated into
    /// a string.
    pub fn resolve_template(&self, template: &str) -> Option<Value> {
        match single_reference(template) {
            Some(path) => self.get_path(path),
            None => Some(Value::String(self.interpolate(template))),
        }
    }
}

/// The reference inside `template` when it is a single `{{ ref }}`.
pub fn single_reference(template: &str) -> Option<&str> {
    let re = TEMPLATE_RE.as_ref()?;
    let trimmed = template.trim();
    let caps = re.captures(trimmed)?;
    let whole = caps.get(0)?;
    if whole.start() == 0 && whole.end() == trimmed.len() {
        caps.get(1).map(|m| m.as_str())
    } else {
        None
    }
}

/// Whether `text` contains any `{{ ref }}`.
pub fn has_reference(text: &str) -> bool {
    TEMPLATE_RE.as_ref().is_some_and(|re| re.is_match(text))
}

/// Render a value for string interpolation (strings unquoted).
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn walk(value: &Value, path: &[&str]) -> Option<Value> {
    let mut current = value;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
