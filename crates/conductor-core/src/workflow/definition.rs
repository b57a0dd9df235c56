//! Structural validation of workflow definitions.
//!
//! The engine consumes definitions that were schema-checked upstream, but
//! re-checks the invariants it depends on before resolving a plan: unique
//! step ids, valid id tokens, known dependencies, sane numeric settings, and
//! well-formed condition trees. Cycles are reported by the resolver.

use std::collections::HashSet;

use conductor_types::condition::{Condition, ConditionSpec};
use conductor_types::workflow::WorkflowDefinition;

use super::error::WorkflowError;

/// Whether `s` is a valid step / run identifier (`[a-zA-Z0-9_-]+`).
pub fn is_valid_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty and version is a semantic version
/// - At least one step exists
/// - Step IDs are valid tokens and unique
/// - Every `depends_on` reference exists and is not the step itself
/// - Timeouts, retry attempts, and parallel limits are positive
/// - Structured `not` conditions have exactly one operand
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.name.trim().is_empty() {
        return Err(WorkflowError::Validation(
            "workflow name must not be empty".to_string(),
        ));
    }

    def.semver().map_err(|e| {
        WorkflowError::Validation(format!(
            "workflow version '{}' is not a semantic version: {e}",
            def.version
        ))
    })?;

    if def.steps.is_empty() {
        return Err(WorkflowError::Validation(
            "workflow must have at least one step".to_string(),
        ));
    }

    if def.timeout_ms == Some(0) {
        return Err(WorkflowError::Validation(
            "workflow timeout must be greater than zero".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if !is_valid_identifier(&step.id) {
            return Err(WorkflowError::Validation(format!(
                "step ID '{}' contains invalid characters (only [a-zA-Z0-9_-] allowed)",
                step.id
            )));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(WorkflowError::Validation(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
        if step.step_type.trim().is_empty() {
            return Err(WorkflowError::Validation(format!(
                "step '{}' has an empty type",
                step.id
            )));
        }
    }

    for step in &def.steps {
        for dep in &step.depends_on {
            if dep == &step.id {
                return Err(WorkflowError::Dependency(format!(
                    "step '{}' depends on itself",
                    step.id
                )));
            }
            if !seen_ids.contains(dep.as_str()) {
                return Err(WorkflowError::Dependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                )));
            }
        }

        if step.timeout_ms == Some(0) {
            return Err(WorkflowError::Validation(format!(
                "step '{}' timeout must be greater than zero",
                step.id
            )));
        }

        if let Some(retry) = &step.retry {
            if retry.max_attempts == 0 {
                return Err(WorkflowError::Validation(format!(
                    "step '{}' retry.maxAttempts must be at least 1",
                    step.id
                )));
            }
        }

        if step.max_concurrency() == Some(0) {
            return Err(WorkflowError::Validation(format!(
                "step '{}' parallel.maxConcurrency must be at least 1",
                step.id
            )));
        }

        if let Some(ConditionSpec::Tree(tree)) = &step.condition {
            validate_condition_tree(&step.id, tree)?;
        }
    }

    Ok(())
}

fn validate_condition_tree(step_id: &str, condition: &Condition) -> Result<(), WorkflowError> {
    match condition {
        Condition::Compare(cmp) => {
            if !cmp.operator.is_unary() && cmp.right.is_none() {
                return Err(WorkflowError::Validation(format!(
                    "step '{step_id}': operator '{}' needs a right operand",
                    cmp.operator.symbol()
                )));
            }
            Ok(())
        }
        Condition::And(children) | Condition::Or(children) => {
            if children.is_empty() {
                return Err(WorkflowError::Validation(format!(
                    "step '{step_id}': and/or condition needs at least one operand"
                )));
            }
            children
                .iter()
                .try_for_each(|c| validate_condition_tree(step_id, c))
        }
        Condition::Not(children) => {
            if children.len() != 1 {
                return Err(WorkflowError::Validation(format!(
                    "step '{step_id}': not condition needs exactly one operand, got {}",
                    children.len()
                )));
            }
            validate_condition_tree(step_id, &children[0])
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
