//! Workflow runner: batch-based parallel execution with durable checkpointing.
//!
//! The `WorkflowRunner` walks the batches of a resolved `ExecutionPlan`.
//! Steps of one batch run concurrently via `tokio::JoinSet`, bounded by a
//! run-wide semaphore, a per-group semaphore, and named resource semaphores.
//! Every step transition is checkpointed through `CheckpointManager` so an
//! interrupted run can resume from its last completed step.
//!
//! # Execution flow
//!
//! 1. Validate the definition, resolve the plan, resolve every executor.
//! 2. Create the run state and context, register a `RunHandle`, save.
//! 3. For each batch: skip steps blocked by failed dependencies or false
//!    conditions, spawn the rest, collect their outcomes.
//! 4. Decide the final status, persist it, release the environment overlay.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use conductor_types::config::{EngineConfig, FailurePolicy};
use conductor_types::state::{
    InterruptionRecord, LogLevel, ResumeRecord, StepState, WorkflowState,
};
use conductor_types::workflow::{
    ParallelStats, SkipReason, StepResult, StepStatus, WorkflowDefinition, WorkflowResult,
    WorkflowStatus, WorkflowStep,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::builtin::ExecutorRegistry;
use super::checkpoint::{CheckpointManager, SharedState};
use super::context::WorkflowContext;
use super::dag::{self, Batch, ExecutionPlan};
use super::definition::validate_definition;
use super::error::WorkflowError;
use super::executor::{BoxStepExecutor, StepScope, execute_with_hooks};
use super::expression::ConditionEvaluator;
use crate::plugin::registry::PluginRegistry;
use crate::state::{StateStore, validate_run_id};

// ---------------------------------------------------------------------------
// Run options
// ---------------------------------------------------------------------------

/// Per-invocation options for `run` / `resume`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Explicit run ID; a UUIDv7 is generated when absent.
    pub run_id: Option<String>,
    /// Environment overlay, applied on top of the definition's `env`.
    pub env: HashMap<String, String>,
    /// Overrides `EngineConfig::max_concurrency` for this run.
    pub max_concurrency: Option<usize>,
    /// Recorded in the resume history.
    pub resume_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Run handles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptKind {
    Pause,
    Cancel,
}

/// An external request to stop a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interrupt {
    pub kind: InterruptKind,
    pub reason: String,
}

/// Live view of one executing run, shared with the shutdown manager.
///
/// Token hierarchy: the runner's root token -> `abort` (cancels in-flight
/// steps) -> `stop` (stops dispatching new steps). Aborting always stops.
pub struct RunHandle {
    run_id: String,
    workflow_name: String,
    state: SharedState,
    context: Arc<WorkflowContext>,
    in_flight: DashMap<String, DateTime<Utc>>,
    interrupt: StdMutex<Option<Interrupt>>,
    abort: CancellationToken,
    stop: CancellationToken,
    done: CancellationToken,
}

impl RunHandle {
    fn new(
        run_id: String,
        workflow_name: String,
        state: SharedState,
        context: Arc<WorkflowContext>,
        root: &CancellationToken,
    ) -> Self {
        let abort = root.child_token();
        let stop = abort.child_token();
        Self {
            run_id,
            workflow_name,
            state,
            context,
            in_flight: DashMap::new(),
            interrupt: StdMutex::new(None),
            abort,
            stop,
            done: CancellationToken::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn context(&self) -> &Arc<WorkflowContext> {
        &self.context
    }

    pub fn interrupt(&self) -> Option<Interrupt> {
        lock(&self.interrupt).clone()
    }

    /// Stop dispatching; in-flight steps run to completion.
    pub fn request_pause(&self, reason: impl Into<String>) {
        {
            let mut slot = lock(&self.interrupt);
            if slot.is_none() {
                *slot = Some(Interrupt {
                    kind: InterruptKind::Pause,
                    reason: reason.into(),
                });
            }
        }
        self.stop.cancel();
    }

    /// Stop dispatching and cancel in-flight steps. Overrides a pause.
    pub fn request_cancel(&self, reason: impl Into<String>) {
        *lock(&self.interrupt) = Some(Interrupt {
            kind: InterruptKind::Cancel,
            reason: reason.into(),
        });
        self.abort.cancel();
    }

    /// Cancel in-flight steps without changing the interrupt kind. A paused
    /// run stays resumable; its interrupted steps are reset to pending.
    pub fn abort_in_flight(&self) {
        self.abort.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Steps currently executing, sorted.
    pub fn in_flight_steps(&self) -> Vec<String> {
        let mut steps: Vec<String> = self.in_flight.iter().map(|e| e.key().clone()).collect();
        steps.sort();
        steps
    }

    /// Resolves once the orchestrator has persisted the final state.
    pub async fn wait_finished(&self) {
        self.done.cancelled().await
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_cancelled()
    }

    fn mark_finished(&self) {
        self.done.cancel();
    }
}

/// The process-wide collection of executing runs.
///
/// Owned by the entry point and shared by the runner and the shutdown
/// manager.
#[derive(Clone, Default)]
pub struct ActiveRuns {
    runs: Arc<DashMap<String, Arc<RunHandle>>>,
}

impl ActiveRuns {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_insert(&self, handle: Arc<RunHandle>) -> bool {
        match self.runs.entry(handle.run_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(handle);
                true
            }
        }
    }

    fn remove(&self, run_id: &str) {
        self.runs.remove(run_id);
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<RunHandle>> {
        self.runs.get(run_id).map(|h| Arc::clone(h.value()))
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.runs.contains_key(run_id)
    }

    /// Handles of all active runs, ordered by run ID.
    pub fn handles(&self) -> Vec<Arc<RunHandle>> {
        let mut handles: Vec<Arc<RunHandle>> =
            self.runs.iter().map(|h| Arc::clone(h.value())).collect();
        handles.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        handles
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Step tasks
// ---------------------------------------------------------------------------

/// Tracks how many steps of a run execute at once.
#[derive(Default)]
struct ConcurrencyGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    fn enter(self: &Arc<Self>, handle: &Arc<RunHandle>, step_id: &str) -> FlightGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        handle.in_flight.insert(step_id.to_string(), Utc::now());
        FlightGuard {
            gauge: Arc::clone(self),
            handle: Arc::clone(handle),
            step_id: step_id.to_string(),
        }
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct FlightGuard {
    gauge: Arc<ConcurrencyGauge>,
    handle: Arc<RunHandle>,
    step_id: String,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
        self.handle.in_flight.remove(&self.step_id);
    }
}

enum TaskOutcome {
    Finished {
        step_id: String,
        result: StepResult,
        error: Option<WorkflowError>,
    },
    /// Dispatch stopped before the step acquired its permits.
    NotStarted(String),
    /// The run aborted while the step was executing.
    Interrupted(String),
}

impl TaskOutcome {
    fn step_id(&self) -> &str {
        match self {
            TaskOutcome::Finished { step_id, .. }
            | TaskOutcome::NotStarted(step_id)
            | TaskOutcome::Interrupted(step_id) => step_id,
        }
    }
}

struct StepTask<S: StateStore> {
    step: WorkflowStep,
    executor: BoxStepExecutor,
    handle: Arc<RunHandle>,
    checkpoint: Arc<CheckpointManager<S>>,
    halt: CancellationToken,
    /// Acquired in order: resource, group, run.
    semaphores: Vec<Arc<Semaphore>>,
    timeout: Duration,
    group: Option<usize>,
    gauge: Arc<ConcurrencyGauge>,
}

impl<S: StateStore + 'static> StepTask<S> {
    /// Returns `Err` only when the step's start could not be persisted.
    async fn run(self) -> Result<TaskOutcome, WorkflowError> {
        let step_id = self.step.id.clone();

        let mut permits: Vec<OwnedSemaphorePermit> = Vec::with_capacity(self.semaphores.len());
        for semaphore in &self.semaphores {
            let acquired = tokio::select! {
                biased;
                () = self.halt.cancelled() => None,
                permit = Arc::clone(semaphore).acquire_owned() => permit.ok(),
            };
            match acquired {
                Some(permit) => permits.push(permit),
                None => return Ok(TaskOutcome::NotStarted(step_id)),
            }
        }
        if self.halt.is_cancelled() {
            return Ok(TaskOutcome::NotStarted(step_id));
        }

        self.checkpoint
            .step_started(self.handle.state(), &step_id)
            .await?;
        let _flight = self.gauge.enter(&self.handle, &step_id);
        let context = Arc::clone(self.handle.context());
        let abort = self.handle.abort.clone();

        tracing::info!(
            run_id = self.handle.run_id(),
            step_id = step_id.as_str(),
            step_type = self.step.step_type.as_str(),
            "step started"
        );
        context.log(LogLevel::Info, Some(step_id.as_str()), "step started");

        let max_attempts = self.step.retry.as_ref().map_or(1, |r| r.max_attempts.max(1));
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut attempt = 0;

        let result = loop {
            attempt += 1;
            let scope = StepScope::new(Arc::clone(&context), step_id.as_str())
                .with_cancel(abort.child_token())
                .with_timeout(Some(self.timeout))
                .with_attempt(attempt);

            let result = match execute_with_hooks(&self.executor, &self.step, &scope).await {
                Ok(output) => context
                    .set_step_output(&step_id, output.clone())
                    .map(|()| output),
                Err(e) => Err(e),
            };

            match result {
                Ok(output) => break Ok(output),
                Err(_) if abort.is_cancelled() => return Ok(TaskOutcome::Interrupted(step_id)),
                Err(e) if attempt < max_attempts && e.is_retryable() => {
                    let delay = self
                        .step
                        .retry
                        .as_ref()
                        .map(|r| r.delay_after(attempt))
                        .unwrap_or_default();
                    tracing::warn!(
                        run_id = self.handle.run_id(),
                        step_id = step_id.as_str(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying step"
                    );
                    context.log(
                        LogLevel::Warn,
                        Some(step_id.as_str()),
                        format!("attempt {attempt} failed, retrying: {e}"),
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = abort.cancelled() => return Ok(TaskOutcome::Interrupted(step_id)),
                    }
                }
                Err(e) => break Err(e),
            }
        };
        drop(permits);

        let elapsed = clock.elapsed().as_millis() as u64;
        let (mut step_result, error) = match result {
            Ok(output) => (StepResult::succeeded(output, elapsed), None),
            Err(e) => (StepResult::failed(e.to_string(), elapsed), Some(e)),
        };
        step_result.attempts = attempt;
        step_result.started_at = Some(started_at);
        step_result.parallel_group = self.group;

        Ok(TaskOutcome::Finished {
            step_id,
            result: step_result,
            error,
        })
    }
}

// ---------------------------------------------------------------------------
// Run bookkeeping
// ---------------------------------------------------------------------------

/// Mutable bookkeeping of one `execute` pass.
struct RunPass<'a> {
    definition: &'a [WorkflowStep],
    steps: HashMap<&'a str, &'a WorkflowStep>,
    halt: CancellationToken,
    errors: Vec<WorkflowError>,
    hard_failure: bool,
    fail_fast: bool,
    timed_out: bool,
    interrupted: Vec<String>,
    fatal: Option<WorkflowError>,
    stats: ParallelStats,
}

impl RunPass<'_> {
    fn set_fatal(&mut self, error: WorkflowError, handle: &RunHandle) {
        tracing::error!(run_id = handle.run_id(), error = %error, "aborting run");
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
        self.halt.cancel();
        handle.abort_in_flight();
    }
}

// ---------------------------------------------------------------------------
// WorkflowRunner
// ---------------------------------------------------------------------------

/// Batch-based workflow runner with durable checkpointing.
///
/// Generic over `S: StateStore` for storage flexibility.
pub struct WorkflowRunner<S: StateStore> {
    checkpoint: Arc<CheckpointManager<S>>,
    executors: Arc<ExecutorRegistry>,
    plugins: Arc<PluginRegistry>,
    config: Arc<EngineConfig>,
    evaluator: ConditionEvaluator,
    active: ActiveRuns,
    cancel: CancellationToken,
    /// Named resource semaphores, shared by every run of this runner.
    resources: DashMap<String, Arc<Semaphore>>,
}

impl<S: StateStore + 'static> WorkflowRunner<S> {
    pub fn new(
        store: S,
        executors: ExecutorRegistry,
        plugins: Arc<PluginRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            checkpoint: Arc::new(CheckpointManager::new(store)),
            executors: Arc::new(executors),
            plugins,
            config: Arc::new(config),
            evaluator: ConditionEvaluator::new(),
            active: ActiveRuns::new(),
            cancel: CancellationToken::new(),
            resources: DashMap::new(),
        }
    }

    /// Use `token` as the root cancellation signal for every run.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Register runs in a collection owned by the caller.
    pub fn with_active_runs(mut self, active: ActiveRuns) -> Self {
        self.active = active;
        self
    }

    pub fn checkpoint(&self) -> &Arc<CheckpointManager<S>> {
        &self.checkpoint
    }

    pub fn active_runs(&self) -> &ActiveRuns {
        &self.active
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Validate a definition and resolve its execution plan without running.
    pub fn validate(&self, definition: &WorkflowDefinition) -> Result<ExecutionPlan, WorkflowError> {
        self.prepare(definition).map(|(plan, _)| plan)
    }

    fn executor_for(&self, step_type: &str) -> Option<BoxStepExecutor> {
        self.executors
            .get(step_type)
            .or_else(|| self.plugins.lookup(step_type))
    }

    fn prepare(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<(ExecutionPlan, HashMap<String, BoxStepExecutor>), WorkflowError> {
        validate_definition(definition)?;
        let plan = dag::resolve(&definition.steps)?;

        let mut executors: HashMap<String, BoxStepExecutor> = HashMap::new();
        for step in &definition.steps {
            let executor = match executors.get(&step.step_type) {
                Some(executor) => executor.clone(),
                None => {
                    let executor = self.executor_for(&step.step_type).ok_or_else(|| {
                        WorkflowError::Executor {
                            step_type: step.step_type.clone(),
                            message: format!("no executor registered (step '{}')", step.id),
                        }
                    })?;
                    executors.insert(step.step_type.clone(), executor.clone());
                    executor
                }
            };
            let report = executor.validate(step);
            if !report.valid {
                return Err(WorkflowError::Validation(format!(
                    "step '{}': {}",
                    step.id,
                    report.errors.join("; ")
                )));
            }
        }
        Ok((plan, executors))
    }

    fn run_limit(&self, options: &RunOptions) -> Result<usize, WorkflowError> {
        match options.max_concurrency.unwrap_or(self.config.max_concurrency) {
            0 => Err(WorkflowError::Configuration(
                "maxConcurrency must be at least 1".to_string(),
            )),
            n => Ok(n),
        }
    }

    fn resource_semaphore(&self, tag: &str) -> Arc<Semaphore> {
        let entry = self
            .resources
            .entry(tag.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.resource_slots(tag))));
        Arc::clone(entry.value())
    }

    // -----------------------------------------------------------------------
    // Public API
    // -----------------------------------------------------------------------

    /// Execute a workflow from the beginning.
    ///
    /// Returns `Err` when the definition is invalid or the primary state
    /// document cannot be written; every other outcome (including failed,
    /// timed out, paused, and cancelled runs) is an `Ok(WorkflowResult)`.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        variables: HashMap<String, Value>,
        options: RunOptions,
    ) -> Result<WorkflowResult, WorkflowError> {
        let (plan, executors) = self.prepare(definition)?;
        let limit = self.run_limit(&options)?;

        let run_id = options
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        validate_run_id(&run_id).map_err(|e| WorkflowError::Validation(e.to_string()))?;

        let context = WorkflowContext::new(
            run_id.as_str(),
            definition.name.as_str(),
            self.config.variable_write_mode,
        );
        for (name, value) in variables {
            context.set_variable(name, value);
        }

        let mut state = WorkflowState::new(
            run_id.as_str(),
            definition.name.as_str(),
            plan.order.clone(),
        );
        state.execution_metadata.workflow_version = Some(definition.version.clone());

        tracing::info!(
            run_id = run_id.as_str(),
            workflow = definition.name.as_str(),
            steps = plan.order.len(),
            batches = plan.batches.len(),
            "starting workflow run"
        );
        self.execute(definition, &plan, &executors, state, Arc::new(context), &options, limit)
            .await
    }

    /// Continue a persisted run.
    ///
    /// Completed steps keep their results and outputs; every other step is
    /// reset to pending and executed again.
    pub async fn resume(
        &self,
        definition: &WorkflowDefinition,
        saved: WorkflowState,
        options: RunOptions,
    ) -> Result<WorkflowResult, WorkflowError> {
        if !saved.can_resume() {
            return Err(WorkflowError::Validation(format!(
                "run '{}' is {} and cannot be resumed",
                saved.workflow_id, saved.status
            )));
        }
        if saved.workflow_name != definition.name {
            return Err(WorkflowError::Validation(format!(
                "run '{}' belongs to workflow '{}', not '{}'",
                saved.workflow_id, saved.workflow_name, definition.name
            )));
        }
        let (plan, executors) = self.prepare(definition)?;
        let limit = self.run_limit(&options)?;

        let mut state = saved;
        let previous_status = state.status;
        let mode = self.config.variable_write_mode;
        let context = match state.context.take() {
            Some(snapshot) => WorkflowContext::restore(snapshot, mode),
            None => WorkflowContext::new(
                state.workflow_id.as_str(),
                state.workflow_name.as_str(),
                mode,
            ),
        };

        let known: HashSet<&str> = plan.order.iter().map(String::as_str).collect();
        state.step_states.retain(|id, _| known.contains(id.as_str()));
        for id in &plan.order {
            let kept_output = state
                .step_states
                .get(id)
                .filter(|s| s.status == StepStatus::Completed)
                .map(|s| s.result.as_ref().and_then(|r| r.output.clone()));
            match kept_output {
                Some(output) => {
                    if let (false, Some(output)) = (context.has_step_output(id), output) {
                        if let Err(e) = context.set_step_output(id, output) {
                            tracing::warn!(step_id = id.as_str(), error = %e, "could not restore step output");
                        }
                    }
                }
                None => {
                    state.step_states.insert(id.clone(), StepState::pending());
                    context.forget_step_output(id);
                }
            }
        }

        state.execution_order = plan.order.clone();
        state.resume_count += 1;
        let meta = &mut state.execution_metadata;
        meta.resume_history.push(ResumeRecord {
            reason: options
                .resume_reason
                .clone()
                .unwrap_or_else(|| "resumed".to_string()),
            resumed_at: Utc::now(),
            previous_status,
        });
        meta.interruption = None;
        meta.error = None;
        meta.completed_at = None;
        meta.workflow_version = Some(definition.version.clone());

        tracing::info!(
            run_id = state.workflow_id.as_str(),
            resume_count = state.resume_count,
            completed = state.completed_steps().len(),
            previous = %previous_status,
            "resuming workflow run"
        );
        self.execute(definition, &plan, &executors, state, Arc::new(context), &options, limit)
            .await
    }

    /// Stop dispatching new steps of `run_id`; in-flight steps finish and
    /// the run is persisted as `Paused`.
    pub fn pause(&self, run_id: &str, reason: impl Into<String>) -> Result<(), WorkflowError> {
        let handle = self.active_handle(run_id)?;
        let reason = reason.into();
        tracing::info!(run_id, reason = reason.as_str(), "pausing workflow run");
        handle.request_pause(reason);
        Ok(())
    }

    /// Cancel `run_id`: in-flight steps are cancelled and the run is
    /// persisted as `Cancelled`.
    pub fn cancel(&self, run_id: &str, reason: impl Into<String>) -> Result<(), WorkflowError> {
        let handle = self.active_handle(run_id)?;
        let reason = reason.into();
        tracing::info!(run_id, reason = reason.as_str(), "cancelling workflow run");
        handle.request_cancel(reason);
        Ok(())
    }

    fn active_handle(&self, run_id: &str) -> Result<Arc<RunHandle>, WorkflowError> {
        self.active
            .get(run_id)
            .ok_or_else(|| WorkflowError::Validation(format!("run '{run_id}' is not active")))
    }

    // -----------------------------------------------------------------------
    // Orchestration
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        definition: &WorkflowDefinition,
        plan: &ExecutionPlan,
        executors: &HashMap<String, BoxStepExecutor>,
        state: WorkflowState,
        context: Arc<WorkflowContext>,
        options: &RunOptions,
        limit: usize,
    ) -> Result<WorkflowResult, WorkflowError> {
        let run_id = state.workflow_id.clone();
        context.extend_env(definition.env.clone());
        context.extend_env(options.env.clone());

        let handle = Arc::new(RunHandle::new(
            run_id.clone(),
            definition.name.clone(),
            Arc::new(Mutex::new(state)),
            Arc::clone(&context),
            &self.cancel,
        ));
        if !self.active.try_insert(Arc::clone(&handle)) {
            return Err(WorkflowError::Validation(format!(
                "run '{run_id}' is already active"
            )));
        }

        let outcome = self.drive(definition, plan, executors, &handle, limit).await;

        context.clear_environment();
        self.active.remove(&run_id);
        handle.mark_finished();
        outcome
    }

    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        plan: &ExecutionPlan,
        executors: &HashMap<String, BoxStepExecutor>,
        handle: &Arc<RunHandle>,
        limit: usize,
    ) -> Result<WorkflowResult, WorkflowError> {
        let clock = Instant::now();
        let context = handle.context();
        let shared = handle.state();
        self.checkpoint.run_started(shared, context).await?;

        let timeout_ms = definition
            .timeout_ms
            .unwrap_or(self.config.workflow_timeout_ms);
        let deadline = clock + Duration::from_millis(timeout_ms);
        let run_permits = Arc::new(Semaphore::new(limit));
        let gauge = Arc::new(ConcurrencyGauge::default());

        let mut pass = RunPass {
            definition: &definition.steps,
            steps: definition.steps.iter().map(|s| (s.id.as_str(), s)).collect(),
            halt: handle.stop.child_token(),
            errors: Vec::new(),
            hard_failure: false,
            fail_fast: false,
            timed_out: false,
            interrupted: Vec::new(),
            fatal: None,
            stats: ParallelStats::default(),
        };

        for batch in &plan.batches {
            if pass.halt.is_cancelled() {
                break;
            }
            if Instant::now() >= deadline {
                self.trip_timeout(&mut pass, handle);
                break;
            }

            let launch = match self.admit(batch, &mut pass, handle).await {
                Ok(launch) => launch,
                Err(e) => {
                    pass.set_fatal(e, handle);
                    break;
                }
            };
            if launch.is_empty() {
                continue;
            }

            let group = batch.group_index().filter(|_| launch.len() > 1);
            let group_permits = group.map(|_| {
                let size = launch
                    .iter()
                    .filter_map(|s| s.max_concurrency())
                    .min()
                    .unwrap_or(limit);
                Arc::new(Semaphore::new(size))
            });
            if group.is_some() {
                pass.stats.groups += 1;
                pass.stats.parallel_steps += launch.len();
            }
            tracing::debug!(
                run_id = handle.run_id(),
                steps = launch.len(),
                group = ?group,
                "dispatching batch"
            );

            let mut tasks = JoinSet::new();
            let mut pending: HashSet<String> = HashSet::new();
            for step in launch {
                let Some(executor) = executors.get(&step.step_type).cloned() else {
                    pass.set_fatal(
                        WorkflowError::Executor {
                            step_type: step.step_type.clone(),
                            message: "executor disappeared after validation".to_string(),
                        },
                        handle,
                    );
                    break;
                };
                let mut semaphores = Vec::with_capacity(3);
                if let Some(tag) = step.resource_tag() {
                    semaphores.push(self.resource_semaphore(tag));
                }
                if let Some(permits) = &group_permits {
                    semaphores.push(Arc::clone(permits));
                }
                semaphores.push(Arc::clone(&run_permits));

                pending.insert(step.id.clone());
                let task = StepTask {
                    step: step.clone(),
                    executor,
                    handle: Arc::clone(handle),
                    checkpoint: Arc::clone(&self.checkpoint),
                    halt: pass.halt.clone(),
                    semaphores,
                    timeout: Duration::from_millis(
                        step.timeout_ms
                            .unwrap_or(self.config.default_step_timeout_ms),
                    ),
                    group,
                    gauge: Arc::clone(&gauge),
                };
                tasks.spawn(task.run());
            }

            let mut batch_failures: Vec<(String, WorkflowError)> = Vec::new();
            loop {
                tokio::select! {
                    joined = tasks.join_next() => {
                        let Some(joined) = joined else { break };
                        match joined {
                            Ok(Ok(outcome)) => {
                                pending.remove(outcome.step_id());
                                self.settle(outcome, &mut pass, &mut batch_failures, handle).await;
                            }
                            Ok(Err(e)) => pass.set_fatal(e, handle),
                            Err(e) => tracing::error!(
                                run_id = handle.run_id(),
                                error = %e,
                                "step task terminated unexpectedly"
                            ),
                        }
                    }
                    () = tokio::time::sleep_until(deadline), if !pass.timed_out => {
                        self.trip_timeout(&mut pass, handle);
                    }
                }
            }

            // Tasks that died without reporting (panics outside the executor).
            for step_id in pending {
                if pass.fatal.is_some() || pass.timed_out {
                    continue;
                }
                let failure = StepResult::failed("step task terminated unexpectedly", 0);
                let outcome = TaskOutcome::Finished {
                    step_id: step_id.clone(),
                    result: failure,
                    error: Some(WorkflowError::step(&step_id, "step task terminated unexpectedly")),
                };
                self.settle(outcome, &mut pass, &mut batch_failures, handle).await;
            }

            if group.is_some() && batch_failures.len() > 1 {
                pass.errors.push(WorkflowError::ParallelExecution {
                    failures: batch_failures
                        .into_iter()
                        .map(|(id, e)| (id, e.to_string()))
                        .collect(),
                });
            } else {
                pass.errors.extend(batch_failures.into_iter().map(|(_, e)| e));
            }

            if pass.fatal.is_none() {
                if let Err(e) = self.checkpoint.batch_finished(shared, context).await {
                    pass.set_fatal(e, handle);
                }
            }
        }

        pass.stats.max_observed_concurrency = gauge.peak();
        self.finish(definition, plan, handle, pass, timeout_ms, clock)
            .await
    }

    fn trip_timeout(&self, pass: &mut RunPass<'_>, handle: &RunHandle) {
        tracing::warn!(run_id = handle.run_id(), "workflow timed out, aborting in-flight steps");
        pass.timed_out = true;
        pass.halt.cancel();
        handle.abort_in_flight();
    }

    /// Apply skip rules to a batch; returns the steps to launch.
    async fn admit<'a>(
        &self,
        batch: &Batch,
        pass: &mut RunPass<'a>,
        handle: &RunHandle,
    ) -> Result<Vec<&'a WorkflowStep>, WorkflowError> {
        let statuses: BTreeMap<String, StepState> = handle.state().lock().await.step_states.clone();
        let context = handle.context();
        let mut launch = Vec::new();

        for step_id in batch.step_ids() {
            let Some(&step) = pass.steps.get(step_id.as_str()) else {
                continue;
            };
            if statuses.get(step_id).map(|s| s.status) == Some(StepStatus::Completed) {
                tracing::debug!(step_id = step_id.as_str(), "skipping completed step");
                continue;
            }

            let skip = if pass.fail_fast {
                Some(SkipReason::RunAborted)
            } else if let Some(dep) = blocking_dependency(step, &pass.steps, &statuses) {
                tracing::info!(
                    run_id = handle.run_id(),
                    step_id = step_id.as_str(),
                    dependency = dep,
                    "skipping step after dependency failure"
                );
                Some(SkipReason::DependencyFailed)
            } else if let Some(condition) = &step.condition {
                let outcome = self.evaluator.evaluate(condition, context);
                if let Some(error) = &outcome.error {
                    tracing::warn!(
                        run_id = handle.run_id(),
                        step_id = step_id.as_str(),
                        error = %error,
                        "condition could not be evaluated, treating as false"
                    );
                    context.log(
                        LogLevel::Warn,
                        Some(step_id.as_str()),
                        format!("condition error: {error}"),
                    );
                }
                (!outcome.result).then(|| {
                    context.log(
                        LogLevel::Info,
                        Some(step_id.as_str()),
                        format!("condition false: {}", outcome.rendered),
                    );
                    SkipReason::Condition
                })
            } else {
                None
            };

            match skip {
                Some(reason) => {
                    self.checkpoint
                        .step_skipped(handle.state(), step_id, reason)
                        .await?;
                }
                None => launch.push(step),
            }
        }
        Ok(launch)
    }

    /// Record one task outcome.
    async fn settle(
        &self,
        outcome: TaskOutcome,
        pass: &mut RunPass<'_>,
        batch_failures: &mut Vec<(String, WorkflowError)>,
        handle: &RunHandle,
    ) {
        let (step_id, result, error) = match outcome {
            TaskOutcome::Finished {
                step_id,
                result,
                error,
            } => (step_id, result, error),
            TaskOutcome::NotStarted(_) => return,
            TaskOutcome::Interrupted(step_id) => {
                tracing::info!(run_id = handle.run_id(), step_id = step_id.as_str(), "step interrupted");
                pass.interrupted.push(step_id);
                return;
            }
        };

        let context = handle.context();
        let duration_ms = result.execution_time_ms;
        if let Err(e) = self
            .checkpoint
            .step_finished(handle.state(), &step_id, result)
            .await
        {
            pass.set_fatal(e, handle);
            return;
        }

        let Some(error) = error else {
            tracing::info!(
                run_id = handle.run_id(),
                step_id = step_id.as_str(),
                duration_ms,
                "step completed"
            );
            context.log(LogLevel::Info, Some(step_id.as_str()), "step completed");
            return;
        };

        context.log(LogLevel::Error, Some(step_id.as_str()), error.to_string());
        let tolerated = pass
            .steps
            .get(step_id.as_str())
            .is_some_and(|s| s.continue_on_error);
        if tolerated {
            tracing::warn!(
                run_id = handle.run_id(),
                step_id = step_id.as_str(),
                error = %error,
                "step failed, continuing"
            );
            return;
        }

        let blocked = dag::dependents(&step_id, pass.definition);
        tracing::error!(
            run_id = handle.run_id(),
            step_id = step_id.as_str(),
            error = %error,
            blocked = ?blocked,
            "step failed"
        );
        if !blocked.is_empty() {
            context.log(
                LogLevel::Warn,
                Some(step_id.as_str()),
                format!("failure affects dependents: {}", blocked.join(", ")),
            );
        }
        pass.hard_failure = true;
        if self.config.failure_policy == FailurePolicy::FailFast && !pass.fail_fast {
            pass.fail_fast = true;
            pass.halt.cancel();
        }
        batch_failures.push((step_id, error));
    }

    /// Decide the final status, mark leftover steps, persist, and build the
    /// result.
    async fn finish(
        &self,
        definition: &WorkflowDefinition,
        plan: &ExecutionPlan,
        handle: &RunHandle,
        pass: RunPass<'_>,
        timeout_ms: u64,
        clock: Instant,
    ) -> Result<WorkflowResult, WorkflowError> {
        let context = handle.context();
        let shared = handle.state();

        if let Some(fatal) = pass.fatal {
            if let Err(e) = self
                .checkpoint
                .run_finished(shared, WorkflowStatus::Failed, Some(fatal.to_string()), None, context)
                .await
            {
                tracing::warn!(run_id = handle.run_id(), error = %e, "could not record failed run");
            }
            return Err(fatal);
        }

        let interrupt = handle.interrupt();
        let cancelled = match &interrupt {
            Some(i) => i.kind == InterruptKind::Cancel,
            None => handle.abort.is_cancelled() && !pass.timed_out,
        };

        let (status, error) = if cancelled {
            let reason = interrupt
                .as_ref()
                .map(|i| i.reason.clone())
                .unwrap_or_else(|| "engine cancelled".to_string());
            let error = WorkflowError::Cancelled { reason };
            (WorkflowStatus::Cancelled, Some(error))
        } else if pass.timed_out {
            let error = WorkflowError::Timeout {
                operation: format!("workflow '{}'", definition.name),
                timeout_ms,
            };
            (WorkflowStatus::Failed, Some(error))
        } else if interrupt.is_some() {
            (WorkflowStatus::Paused, None)
        } else if pass.hard_failure {
            (WorkflowStatus::Failed, pass.errors.into_iter().next())
        } else {
            (WorkflowStatus::Completed, None)
        };

        let error_text = error.as_ref().map(|e| e.to_string());
        let mut interrupted: Vec<String> = plan
            .order
            .iter()
            .filter(|id| pass.interrupted.contains(id))
            .cloned()
            .collect();
        interrupted.dedup();

        self.checkpoint
            .update(shared, |state| {
                for id in &plan.order {
                    let Some(entry) = state.step_states.get_mut(id) else {
                        continue;
                    };
                    if !matches!(entry.status, StepStatus::Pending | StepStatus::Running) {
                        continue;
                    }
                    let was_running = entry.status == StepStatus::Running;
                    *entry = match (status, &error_text) {
                        (WorkflowStatus::Paused, _) => StepState::pending(),
                        (_, Some(message)) if was_running => StepState {
                            status: StepStatus::Failed,
                            result: Some(StepResult::failed(message.clone(), 0)),
                            skip_reason: None,
                        },
                        _ => StepState {
                            status: StepStatus::Skipped,
                            result: None,
                            skip_reason: Some(SkipReason::RunAborted),
                        },
                    };
                }
            })
            .await?;

        let interruption = interrupt.map(|i| InterruptionRecord {
            reason: i.reason,
            at: Utc::now(),
            interrupted_steps: interrupted,
        });
        self.checkpoint
            .run_finished(shared, status, error_text.clone(), interruption, context)
            .await?;

        let execution_time_ms = clock.elapsed().as_millis() as u64;
        tracing::info!(
            run_id = handle.run_id(),
            workflow = definition.name.as_str(),
            %status,
            duration_ms = execution_time_ms,
            "workflow run finished"
        );

        let step_results = shared
            .lock()
            .await
            .step_states
            .iter()
            .filter_map(|(id, s)| s.result.clone().map(|r| (id.clone(), r)))
            .collect();

        Ok(WorkflowResult {
            run_id: handle.run_id().to_string(),
            status,
            success: status == WorkflowStatus::Completed,
            step_results,
            execution_time_ms,
            error: error_text,
            parallel_stats: (plan.group_count() > 0).then_some(pass.stats),
        })
    }
}

/// The first dependency whose failure blocks `step`, if any.
///
/// A dependency blocks when it failed without `continueOnError`, or when it
/// was itself skipped because of a failure. Condition skips never block.
fn blocking_dependency<'s>(
    step: &'s WorkflowStep,
    steps: &HashMap<&str, &WorkflowStep>,
    statuses: &BTreeMap<String, StepState>,
) -> Option<&'s str> {
    if step.continue_on_error {
        return None;
    }
    step.depends_on
        .iter()
        .find(|dep| match statuses.get(dep.as_str()) {
            Some(s) if s.status == StepStatus::Failed => steps
                .get(dep.as_str())
                .is_none_or(|d| !d.continue_on_error),
            Some(s) if s.status == StepStatus::Skipped => matches!(
                s.skip_reason,
                Some(SkipReason::DependencyFailed | SkipReason::RunAborted)
            ),
            _ => false,
        })
        .map(String::as_str)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::plugin::{Plugin, PluginError};
    use crate::state::InMemoryStateStore;
    use crate::workflow::executor::StepExecutor;
    use futures_util::future::BoxFuture;
    use serde_json::json;

    // -- Mock executor -------------------------------------------------------

    /// Executor for `mock` steps, driven by step config:
    /// `sleepMs`, `fail`, `failTimes`, `error`, `output`.
    #[derive(Clone, Default)]
    pub(crate) struct Mock {
        calls: Arc<StdMutex<Vec<String>>>,
        attempts: Arc<DashMap<String, u32>>,
    }

    impl Mock {
        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl StepExecutor for Mock {
        fn supported_type(&self) -> &str {
            "mock"
        }

        async fn execute(
            &self,
            step: &WorkflowStep,
            _scope: &StepScope,
        ) -> Result<Value, WorkflowError> {
            self.calls.lock().unwrap().push(step.id.clone());
            let attempt = {
                let mut n = self.attempts.entry(step.id.clone()).or_insert(0);
                *n += 1;
                *n
            };
            if let Some(ms) = step.config.get("sleepMs").and_then(Value::as_u64) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            let message = step.config_str("error").unwrap_or("boom").to_string();
            let fail_times = step.config.get("failTimes").and_then(Value::as_u64).unwrap_or(0);
            if u64::from(attempt) <= fail_times
                || step.config.get("fail").and_then(Value::as_bool) == Some(true)
            {
                return Err(WorkflowError::step(&step.id, message));
            }
            Ok(step
                .config
                .get("output")
                .cloned()
                .unwrap_or_else(|| json!({ "step": step.id })))
        }
    }

    struct MockPlugin {
        version: semver::Version,
        types: Vec<String>,
        executor: BoxStepExecutor,
    }

    impl Plugin for MockPlugin {
        fn name(&self) -> &str {
            "mock"
        }

        fn version(&self) -> &semver::Version {
            &self.version
        }

        fn step_types(&self) -> &[String] {
            &self.types
        }

        fn executor(&self, step_type: &str) -> Option<BoxStepExecutor> {
            (step_type == "mock").then(|| self.executor.clone())
        }

        fn initialize(&self) -> BoxFuture<'_, Result<(), PluginError>> {
            Box::pin(async { Ok(()) })
        }
    }

    pub(crate) async fn runner_with(config: EngineConfig) -> (WorkflowRunner<InMemoryStateStore>, Mock) {
        let mock = Mock::default();
        let plugins = Arc::new(PluginRegistry::new(4));
        plugins
            .register(
                Arc::new(MockPlugin {
                    version: semver::Version::new(1, 0, 0),
                    types: vec!["mock".to_string()],
                    executor: BoxStepExecutor::new(mock.clone()),
                }),
                false,
            )
            .await
            .unwrap();
        let runner = WorkflowRunner::new(
            InMemoryStateStore::new(),
            ExecutorRegistry::new(),
            plugins,
            config,
        );
        (runner, mock)
    }

    async fn runner() -> (WorkflowRunner<InMemoryStateStore>, Mock) {
        runner_with(EngineConfig::default()).await
    }

    pub(crate) fn definition(steps: Value) -> WorkflowDefinition {
        serde_json::from_value(json!({
            "name": "test-flow",
            "version": "1.0.0",
            "steps": steps
        }))
        .unwrap()
    }

    pub(crate) fn options(run_id: &str) -> RunOptions {
        RunOptions {
            run_id: Some(run_id.to_string()),
            ..RunOptions::default()
        }
    }

    async fn saved(runner: &WorkflowRunner<InMemoryStateStore>, run_id: &str) -> WorkflowState {
        runner.checkpoint().load(run_id).await.unwrap().unwrap()
    }

    pub(crate) async fn wait_for_in_flight(runner: &WorkflowRunner<InMemoryStateStore>, run_id: &str, step: &str) {
        for _ in 0..200 {
            if runner
                .active_runs()
                .get(run_id)
                .is_some_and(|h| h.in_flight_steps().iter().any(|s| s == step))
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("step {step} never started");
    }

    // -- Scenarios -----------------------------------------------------------

    #[tokio::test]
    async fn test_condition_skip_does_not_block_dependents() {
        let (runner, mock) = runner().await;
        let def = definition(json!([
            { "id": "A", "type": "mock", "config": { "output": { "value": 1 } } },
            { "id": "B", "type": "mock", "dependsOn": ["A"],
              "condition": "{{steps.A.output.value}} > 5" },
            { "id": "C", "type": "mock", "dependsOn": ["B"] }
        ]));

        let result = runner.run(&def, HashMap::new(), options("abc")).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert!(result.success);
        assert_eq!(mock.calls(), vec!["A", "C"]);

        let state = saved(&runner, "abc").await;
        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(state.step_status("B"), Some(StepStatus::Skipped));
        assert_eq!(state.step_states["B"].skip_reason, Some(SkipReason::Condition));
        assert_eq!(state.step_status("C"), Some(StepStatus::Completed));
        assert!(!state.can_resume());
    }

    #[tokio::test]
    async fn test_condition_skip_leaves_parallel_sibling_running() {
        let (runner, mock) = runner().await;
        let def = definition(json!([
            { "id": "A", "type": "mock", "config": { "output": { "ok": false } } },
            { "id": "B", "type": "mock", "dependsOn": ["A"],
              "condition": "{{steps.A.ok}} equals true",
              "parallel": { "enabled": true } },
            { "id": "C", "type": "mock", "dependsOn": ["A"],
              "parallel": { "enabled": true } }
        ]));

        let result = runner.run(&def, HashMap::new(), options("siblings")).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert!(result.success);
        assert_eq!(mock.calls(), vec!["A", "C"]);
        assert!(result.step_results["C"].success);

        let state = saved(&runner, "siblings").await;
        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(state.step_status("B"), Some(StepStatus::Skipped));
        assert_eq!(state.step_states["B"].skip_reason, Some(SkipReason::Condition));
        assert_eq!(state.step_status("C"), Some(StepStatus::Completed));
    }

    #[tokio::test]
    async fn test_cycle_fails_before_execution() {
        let (runner, mock) = runner().await;
        let def = definition(json!([
            { "id": "X", "type": "mock", "dependsOn": ["Y"] },
            { "id": "Y", "type": "mock", "dependsOn": ["X"] }
        ]));

        let err = runner.run(&def, HashMap::new(), options("cyc")).await.unwrap_err();
        assert!(matches!(err, WorkflowError::CircularDependency { .. }));
        assert!(mock.calls().is_empty());
        assert!(runner.checkpoint().store().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_step_type_rejected() {
        let (runner, _) = runner().await;
        let def = definition(json!([{ "id": "a", "type": "teleport" }]));
        assert!(matches!(
            runner.validate(&def),
            Err(WorkflowError::Executor { step_type, .. }) if step_type == "teleport"
        ));
    }

    #[tokio::test]
    async fn test_executor_validation_runs_before_execution() {
        let (runner, mock) = runner().await;
        let def = definition(json!([
            { "id": "a", "type": "mock" },
            { "id": "gate", "type": "condition" }
        ]));
        let err = runner.run(&def, HashMap::new(), options("val")).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(msg) if msg.contains("gate")));
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failure_blocks_only_dependents() {
        let (runner, mock) = runner().await;
        let def = definition(json!([
            { "id": "a", "type": "mock", "config": { "fail": true } },
            { "id": "b", "type": "mock", "dependsOn": ["a"] },
            { "id": "c", "type": "mock", "dependsOn": ["b"] },
            { "id": "d", "type": "mock" }
        ]));

        let result = runner.run(&def, HashMap::new(), options("iso")).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(result.error.unwrap().contains("step 'a' failed"));
        assert_eq!(mock.calls(), vec!["a", "d"]);

        let state = saved(&runner, "iso").await;
        assert_eq!(state.step_states["b"].skip_reason, Some(SkipReason::DependencyFailed));
        assert_eq!(state.step_states["c"].skip_reason, Some(SkipReason::DependencyFailed));
        assert_eq!(state.step_status("d"), Some(StepStatus::Completed));
        assert!(state.can_resume());

        let logs = state.context.unwrap().logs;
        assert!(logs.iter().any(|entry| entry.step_id.as_deref() == Some("a")
            && entry.level == LogLevel::Warn
            && entry.message == "failure affects dependents: b, c"));
    }

    #[tokio::test]
    async fn test_continue_on_error_is_tolerated() {
        let (runner, mock) = runner().await;
        let def = definition(json!([
            { "id": "a", "type": "mock", "continueOnError": true, "config": { "fail": true } },
            { "id": "b", "type": "mock", "dependsOn": ["a"] }
        ]));

        let result = runner.run(&def, HashMap::new(), options("tol")).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert!(!result.step_results["a"].success);
        assert!(result.step_results["b"].success);
        assert_eq!(mock.calls(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_fail_fast_skips_unstarted_steps() {
        let config = EngineConfig {
            failure_policy: FailurePolicy::FailFast,
            ..EngineConfig::default()
        };
        let (runner, mock) = runner_with(config).await;
        let def = definition(json!([
            { "id": "a", "type": "mock", "config": { "fail": true } },
            { "id": "b", "type": "mock", "dependsOn": ["a"], "continueOnError": true },
            { "id": "c", "type": "mock", "dependsOn": ["a"], "continueOnError": true }
        ]));

        let result = runner.run(&def, HashMap::new(), options("ff")).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(mock.calls(), vec!["a"]);
        let state = saved(&runner, "ff").await;
        assert_eq!(state.step_states["b"].skip_reason, Some(SkipReason::RunAborted));
        assert_eq!(state.step_states["c"].skip_reason, Some(SkipReason::RunAborted));
    }

    #[tokio::test]
    async fn test_retryable_errors_are_retried() {
        let (runner, mock) = runner().await;
        let def = definition(json!([
            { "id": "flaky", "type": "mock",
              "config": { "failTimes": 2, "error": "connection reset by peer" },
              "retry": { "maxAttempts": 3, "backoffMs": 1 } },
            { "id": "broken", "type": "mock",
              "config": { "fail": true, "error": "exit code 2" },
              "retry": { "maxAttempts": 3, "backoffMs": 1 } }
        ]));

        let result = runner.run(&def, HashMap::new(), options("retry")).await.unwrap();
        assert!(result.step_results["flaky"].success);
        assert_eq!(result.step_results["flaky"].attempts, 3);
        assert!(!result.step_results["broken"].success);
        assert_eq!(result.step_results["broken"].attempts, 1);
        assert_eq!(mock.calls().iter().filter(|s| *s == "flaky").count(), 3);
    }

    #[tokio::test]
    async fn test_parallel_group_respects_max_concurrency() {
        let (runner, _) = runner().await;
        let steps: Vec<Value> = (0..4)
            .map(|i| {
                json!({
                    "id": format!("p{i}"),
                    "type": "mock",
                    "config": { "sleepMs": 50 },
                    "parallel": { "enabled": true, "maxConcurrency": 2 }
                })
            })
            .collect();
        let def = definition(Value::Array(steps));

        let result = runner.run(&def, HashMap::new(), options("par")).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        let stats = result.parallel_stats.unwrap();
        assert_eq!(stats.groups, 1);
        assert_eq!(stats.parallel_steps, 4);
        assert_eq!(stats.max_observed_concurrency, 2);
        assert!(result.step_results.values().all(|r| r.parallel_group == Some(0)));
    }

    #[tokio::test]
    async fn test_resource_limit_serializes_steps() {
        let (runner, _) = runner().await;
        let steps: Vec<Value> = (0..3)
            .map(|i| {
                json!({
                    "id": format!("gpu{i}"),
                    "type": "mock",
                    "config": { "sleepMs": 20 },
                    "parallel": { "enabled": true, "resource": "gpu" }
                })
            })
            .collect();
        let result = runner
            .run(&definition(Value::Array(steps)), HashMap::new(), options("res"))
            .await
            .unwrap();
        assert_eq!(result.parallel_stats.unwrap().max_observed_concurrency, 1);
    }

    #[tokio::test]
    async fn test_step_timeout_fails_and_blocks_dependents() {
        let (runner, _) = runner().await;
        let def = definition(json!([
            { "id": "slow", "type": "mock", "timeout": 50, "config": { "sleepMs": 5000 } },
            { "id": "after", "type": "mock", "dependsOn": ["slow"] }
        ]));

        let started = std::time::Instant::now();
        let result = runner.run(&def, HashMap::new(), options("slow")).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(result.step_results["slow"].error.as_deref().unwrap().contains("timed out"));

        let state = saved(&runner, "slow").await;
        assert_eq!(state.step_states["after"].skip_reason, Some(SkipReason::DependencyFailed));
    }

    #[tokio::test]
    async fn test_workflow_timeout_aborts_run() {
        let (runner, _) = runner().await;
        let mut def = definition(json!([
            { "id": "long", "type": "mock", "config": { "sleepMs": 5000 } },
            { "id": "next", "type": "mock", "dependsOn": ["long"] }
        ]));
        def.timeout_ms = Some(50);

        let result = runner.run(&def, HashMap::new(), options("wto")).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(result.error.unwrap().contains("timed out after 50ms"));

        let state = saved(&runner, "wto").await;
        assert_eq!(state.step_status("long"), Some(StepStatus::Failed));
        assert_eq!(state.step_states["next"].skip_reason, Some(SkipReason::RunAborted));
    }

    #[tokio::test]
    async fn test_variables_and_env_overlay() {
        let (runner, mock) = runner().await;
        let def = definition(json!([
            { "id": "gate", "type": "condition",
              "config": { "expression": "{{vars.region}} == 'eu' && {{env.STAGE}} == 'prod'" } },
            { "id": "deploy", "type": "mock", "dependsOn": ["gate"],
              "condition": "{{steps.gate.result}} == true" }
        ]));
        let mut opts = options("vars");
        opts.env.insert("STAGE".to_string(), "prod".to_string());
        let vars = HashMap::from([("region".to_string(), json!("eu"))]);

        let result = runner.run(&def, vars, opts).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(mock.calls(), vec!["deploy"]);
        assert!(runner.active_runs().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_marks_run_cancelled() {
        let (runner, _) = runner().await;
        let runner = Arc::new(runner);
        let def = definition(json!([
            { "id": "long", "type": "mock", "config": { "sleepMs": 5000 } },
            { "id": "next", "type": "mock", "dependsOn": ["long"] }
        ]));

        let task = {
            let runner = Arc::clone(&runner);
            let def = def.clone();
            tokio::spawn(async move { runner.run(&def, HashMap::new(), options("can")).await })
        };
        wait_for_in_flight(&runner, "can", "long").await;
        runner.cancel("can", "user request").unwrap();

        let result = task.await.unwrap().unwrap();
        assert_eq!(result.status, WorkflowStatus::Cancelled);
        assert!(result.error.unwrap().contains("user request"));

        let state = saved(&runner, "can").await;
        assert_eq!(state.status, WorkflowStatus::Cancelled);
        assert!(!state.can_resume());
        assert_eq!(state.step_status("long"), Some(StepStatus::Failed));
        assert_eq!(state.step_states["next"].skip_reason, Some(SkipReason::RunAborted));
        assert!(runner.cancel("can", "again").is_err());
    }

    #[tokio::test]
    async fn test_pause_then_resume_skips_completed_steps() {
        let (runner, mock) = runner().await;
        let runner = Arc::new(runner);
        let def = definition(json!([
            { "id": "a", "type": "mock" },
            { "id": "b", "type": "mock", "dependsOn": ["a"], "config": { "sleepMs": 100 } },
            { "id": "c", "type": "mock", "dependsOn": ["b"] }
        ]));

        let task = {
            let runner = Arc::clone(&runner);
            let def = def.clone();
            tokio::spawn(async move { runner.run(&def, HashMap::new(), options("pz")).await })
        };
        wait_for_in_flight(&runner, "pz", "b").await;
        runner.pause("pz", "maintenance").unwrap();

        let paused = task.await.unwrap().unwrap();
        assert_eq!(paused.status, WorkflowStatus::Paused);
        let state = saved(&runner, "pz").await;
        assert_eq!(state.completed_steps(), vec!["a", "b"]);
        assert_eq!(state.step_status("c"), Some(StepStatus::Pending));
        assert_eq!(
            state.execution_metadata.interruption.as_ref().unwrap().reason,
            "maintenance"
        );
        assert!(state.can_resume());

        let mut opts = options("pz");
        opts.resume_reason = Some("maintenance over".to_string());
        let resumed = runner.resume(&def, state, opts).await.unwrap();
        assert_eq!(resumed.status, WorkflowStatus::Completed);
        assert_eq!(mock.calls(), vec!["a", "b", "c"]);

        let state = saved(&runner, "pz").await;
        assert_eq!(state.resume_count, 1);
        assert_eq!(state.execution_metadata.resume_history.len(), 1);
        assert_eq!(
            state.execution_metadata.resume_history[0].previous_status,
            WorkflowStatus::Paused
        );
        assert!(state.execution_metadata.interruption.is_none());
    }

    #[tokio::test]
    async fn test_resume_reruns_failed_steps_with_restored_outputs() {
        let (runner, mock) = runner().await;
        let def = definition(json!([
            { "id": "fetch", "type": "mock", "config": { "output": { "count": 4 } } },
            { "id": "use", "type": "mock", "dependsOn": ["fetch"],
              "condition": "{{steps.fetch.count}} == 4", "config": { "fail": true } }
        ]));
        let first = runner.run(&def, HashMap::new(), options("rr")).await.unwrap();
        assert_eq!(first.status, WorkflowStatus::Failed);

        let fixed = definition(json!([
            { "id": "fetch", "type": "mock", "config": { "output": { "count": 4 } } },
            { "id": "use", "type": "mock", "dependsOn": ["fetch"],
              "condition": "{{steps.fetch.count}} == 4" }
        ]));
        let state = saved(&runner, "rr").await;
        let second = runner.resume(&fixed, state, options("rr")).await.unwrap();
        assert_eq!(second.status, WorkflowStatus::Completed);
        assert_eq!(mock.calls(), vec!["fetch", "use", "use"]);
    }

    #[tokio::test]
    async fn test_resume_rejects_terminal_and_foreign_states() {
        let (runner, _) = runner().await;
        let def = definition(json!([{ "id": "a", "type": "mock" }]));
        runner.run(&def, HashMap::new(), options("done")).await.unwrap();
        let state = saved(&runner, "done").await;
        assert!(matches!(
            runner.resume(&def, state.clone(), options("done")).await,
            Err(WorkflowError::Validation(_))
        ));

        let mut foreign = state;
        foreign.status = WorkflowStatus::Failed;
        foreign.workflow_name = "other".to_string();
        assert!(runner.resume(&def, foreign, options("done")).await.is_err());
    }

    #[test]
    fn test_blocking_dependency_rules() {
        let steps: Vec<WorkflowStep> = serde_json::from_value(json!([
            { "id": "a", "type": "mock" },
            { "id": "t", "type": "mock", "continueOnError": true },
            { "id": "x", "type": "mock", "dependsOn": ["a"] },
            { "id": "y", "type": "mock", "dependsOn": ["t"] },
            { "id": "z", "type": "mock", "dependsOn": ["a"], "continueOnError": true }
        ]))
        .unwrap();
        let by_id: HashMap<&str, &WorkflowStep> = steps.iter().map(|s| (s.id.as_str(), s)).collect();
        let failed = StepState {
            status: StepStatus::Failed,
            result: None,
            skip_reason: None,
        };
        let statuses = BTreeMap::from([("a".to_string(), failed.clone()), ("t".to_string(), failed)]);

        assert_eq!(blocking_dependency(&steps[2], &by_id, &statuses), Some("a"));
        assert_eq!(blocking_dependency(&steps[3], &by_id, &statuses), None);
        assert_eq!(blocking_dependency(&steps[4], &by_id, &statuses), None);
    }
}
