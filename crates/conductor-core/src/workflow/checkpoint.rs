//! Durable checkpoint manager for workflow run state.
//!
//! Wraps a `StateStore` and applies run and step transitions (pending ->
//! running -> completed/failed/skipped) to the shared `WorkflowState`,
//! persisting after each one so an interrupted run can resume from its last
//! completed step.

use std::sync::Arc;

use chrono::Utc;
use conductor_types::state::{InterruptionRecord, StepState, WorkflowState};
use conductor_types::workflow::{SkipReason, StepResult, StepStatus, WorkflowStatus};
use tokio::sync::Mutex;

use super::context::WorkflowContext;
use super::error::WorkflowError;
use crate::state::StateStore;

/// Run state shared between the orchestrator, its step tasks, and the
/// shutdown manager.
pub type SharedState = Arc<Mutex<WorkflowState>>;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Applies transitions to run state and persists them.
///
/// Generic over `S: StateStore` so it works with any backend. The state lock
/// is held across the save, so documents are written in transition order.
pub struct CheckpointManager<S: StateStore> {
    store: S,
}

impl<S: StateStore> CheckpointManager<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Persist a state document as-is.
    pub async fn save(&self, state: &WorkflowState) -> Result<(), WorkflowError> {
        self.store.save(state).await.map_err(|e| {
            tracing::error!(run_id = %state.workflow_id, error = %e, "failed to persist run state");
            WorkflowError::from(e)
        })
    }

    pub async fn load(&self, run_id: &str) -> Result<Option<WorkflowState>, WorkflowError> {
        Ok(self.store.load(run_id).await?)
    }

    /// Lock, mutate, bump `updated_at`, and save.
    pub async fn update<F>(&self, shared: &SharedState, mutate: F) -> Result<(), WorkflowError>
    where
        F: FnOnce(&mut WorkflowState) + Send,
    {
        let mut state = shared.lock().await;
        mutate(&mut state);
        state.touch();
        self.save(&state).await
    }

    // -----------------------------------------------------------------------
    // Step-level checkpoints
    // -----------------------------------------------------------------------

    /// Mark a step `Running`.
    pub async fn step_started(&self, shared: &SharedState, step_id: &str) -> Result<(), WorkflowError> {
        self.update(shared, |state| {
            state.step_states.insert(
                step_id.to_string(),
                StepState {
                    status: StepStatus::Running,
                    result: None,
                    skip_reason: None,
                },
            );
        })
        .await?;
        tracing::debug!(step_id, "checkpointed step start");
        Ok(())
    }

    /// Record a step's final result.
    ///
    /// The context is not snapshotted here; outputs of completed steps are
    /// also kept in their results and restored from there on resume.
    pub async fn step_finished(
        &self,
        shared: &SharedState,
        step_id: &str,
        result: StepResult,
    ) -> Result<(), WorkflowError> {
        let status = if result.success {
            StepStatus::Completed
        } else {
            StepStatus::Failed
        };
        self.update(shared, |state| {
            state.step_states.insert(
                step_id.to_string(),
                StepState {
                    status,
                    result: Some(result),
                    skip_reason: None,
                },
            );
        })
        .await?;
        tracing::debug!(step_id, %status, "checkpointed step result");
        Ok(())
    }

    pub async fn step_skipped(
        &self,
        shared: &SharedState,
        step_id: &str,
        reason: SkipReason,
    ) -> Result<(), WorkflowError> {
        self.update(shared, |state| {
            state.step_states.insert(
                step_id.to_string(),
                StepState {
                    status: StepStatus::Skipped,
                    result: None,
                    skip_reason: Some(reason),
                },
            );
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Run-level checkpoints
    // -----------------------------------------------------------------------

    /// Mark the run `Running` and record its start.
    pub async fn run_started(
        &self,
        shared: &SharedState,
        context: &WorkflowContext,
    ) -> Result<(), WorkflowError> {
        self.update(shared, |state| {
            state.status = WorkflowStatus::Running;
            state.execution_metadata.started_at.get_or_insert_with(Utc::now);
            state.execution_metadata.completed_at = None;
            state.context = Some(context.snapshot());
        })
        .await
    }

    /// Snapshot the context once every step of a batch has settled.
    pub async fn batch_finished(
        &self,
        shared: &SharedState,
        context: &WorkflowContext,
    ) -> Result<(), WorkflowError> {
        self.update(shared, |state| {
            state.context = Some(context.snapshot());
        })
        .await
    }

    /// Record the final (or paused) status of a run.
    pub async fn run_finished(
        &self,
        shared: &SharedState,
        status: WorkflowStatus,
        error: Option<String>,
        interruption: Option<InterruptionRecord>,
        context: &WorkflowContext,
    ) -> Result<(), WorkflowError> {
        self.update(shared, |state| {
            state.status = status;
            state.execution_metadata.error = error;
            state.execution_metadata.interruption = interruption;
            if status.is_terminal() {
                state.execution_metadata.completed_at = Some(Utc::now());
            }
            state.context = Some(context.snapshot());
        })
        .await?;
        tracing::debug!(%status, "checkpointed run status");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InMemoryStateStore;
    use conductor_types::config::VariableWriteMode;
    use serde_json::json;

    fn setup() -> (CheckpointManager<InMemoryStateStore>, SharedState, WorkflowContext) {
        let state = WorkflowState::new("run-1", "flow", vec!["a".into(), "b".into()]);
        let ctx = WorkflowContext::new("run-1", "flow", VariableWriteMode::LastWriteWins);
        (
            CheckpointManager::new(InMemoryStateStore::new()),
            Arc::new(Mutex::new(state)),
            ctx,
        )
    }

    #[tokio::test]
    async fn test_step_transitions_are_persisted() {
        let (mgr, shared, ctx) = setup();
        mgr.run_started(&shared, &ctx).await.unwrap();
        mgr.step_started(&shared, "a").await.unwrap();

        let saved = mgr.load("run-1").await.unwrap().unwrap();
        assert_eq!(saved.status, WorkflowStatus::Running);
        assert_eq!(saved.step_status("a"), Some(StepStatus::Running));
        assert!(saved.execution_metadata.started_at.is_some());

        ctx.set_step_output("a", json!({"n": 1})).unwrap();
        mgr.step_finished(&shared, "a", StepResult::succeeded(json!({"n": 1}), 5))
            .await
            .unwrap();
        mgr.step_skipped(&shared, "b", SkipReason::Condition).await.unwrap();

        let saved = mgr.load("run-1").await.unwrap().unwrap();
        assert_eq!(saved.completed_steps(), vec!["a"]);
        assert_eq!(saved.step_states["b"].skip_reason, Some(SkipReason::Condition));
        assert_eq!(saved.step_states["a"].result.as_ref().unwrap().output, Some(json!({"n": 1})));
        assert!(!saved.context.unwrap().step_outputs.contains_key("a"));

        mgr.batch_finished(&shared, &ctx).await.unwrap();
        let saved = mgr.load("run-1").await.unwrap().unwrap();
        assert_eq!(saved.context.unwrap().step_outputs["a"], json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_run_finished_sets_completion_only_when_terminal() {
        let (mgr, shared, ctx) = setup();
        mgr.run_finished(&shared, WorkflowStatus::Paused, None, None, &ctx)
            .await
            .unwrap();
        let saved = mgr.load("run-1").await.unwrap().unwrap();
        assert!(saved.execution_metadata.completed_at.is_none());

        mgr.run_finished(
            &shared,
            WorkflowStatus::Failed,
            Some("step 'a' failed: boom".into()),
            None,
            &ctx,
        )
        .await
        .unwrap();
        let saved = mgr.load("run-1").await.unwrap().unwrap();
        assert!(saved.execution_metadata.completed_at.is_some());
        assert_eq!(
            saved.execution_metadata.error.as_deref(),
            Some("step 'a' failed: boom")
        );
    }

    #[tokio::test]
    async fn test_save_rejects_bad_run_id() {
        let (mgr, _, _) = setup();
        let state = WorkflowState::new("../escape", "flow", vec![]);
        assert!(matches!(
            mgr.save(&state).await,
            Err(WorkflowError::Persistence(_))
        ));
    }
}
