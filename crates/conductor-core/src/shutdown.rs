//! Graceful and forced shutdown of active workflow runs.
//!
//! `ShutdownManager` walks the process-wide `ActiveRuns` collection. A
//! graceful shutdown stops dispatch, waits up to the grace period for
//! in-flight steps, aborts whatever is still running, and leaves every run
//! persisted as `Paused` so it can be resumed. A forced shutdown cancels
//! everything at once and persists runs as `Cancelled`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use conductor_types::config::EngineConfig;
use conductor_types::state::{InterruptionRecord, StepState, WorkflowState};
use conductor_types::workflow::{StepResult, StepStatus, WorkflowStatus};
use futures_util::future::{BoxFuture, join_all};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::state::StateStore;
use crate::workflow::checkpoint::CheckpointManager;
use crate::workflow::runner::{ActiveRuns, RunHandle};

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Observer of the shutdown sequence. Every hook is optional.
///
/// Each hook invocation is bounded by the manager's handler timeout; a hook
/// that overruns is abandoned with a warning.
pub trait ShutdownHandler: Send + Sync {
    fn name(&self) -> &str {
        "shutdown-handler"
    }

    fn on_shutdown_started<'a>(&'a self, _reason: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }

    /// A step was still running when the grace period expired.
    fn on_step_interrupted<'a>(&'a self, _run_id: &'a str, _step_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }

    /// A run's final state document has been written.
    fn on_state_saved<'a>(&'a self, _state: &'a WorkflowState) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }

    fn on_shutdown_complete<'a>(&'a self, _report: &'a ShutdownReport) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// What happened to one run during shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunShutdown {
    pub run_id: String,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    /// Steps aborted because they outlived the grace period.
    pub interrupted_steps: Vec<String>,
    /// `false` when the run's orchestrator never finished and the manager
    /// wrote the state itself.
    pub finished_cleanly: bool,
    /// `false` when the state could not be persisted at all.
    pub persisted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    pub reason: String,
    pub forced: bool,
    pub runs: Vec<RunShutdown>,
    pub duration_ms: u64,
}

impl ShutdownReport {
    pub fn interrupted_step_count(&self) -> usize {
        self.runs.iter().map(|r| r.interrupted_steps.len()).sum()
    }
}

// ---------------------------------------------------------------------------
// ShutdownManager
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Event<'a> {
    Started(&'a str),
    StepInterrupted { run_id: &'a str, step_id: &'a str },
    StateSaved(&'a WorkflowState),
    Complete(&'a ShutdownReport),
}

impl Event<'_> {
    fn name(&self) -> &'static str {
        match self {
            Event::Started(_) => "started",
            Event::StepInterrupted { .. } => "step_interrupted",
            Event::StateSaved(_) => "state_saved",
            Event::Complete(_) => "complete",
        }
    }
}

pub struct ShutdownManager<S: StateStore> {
    active: ActiveRuns,
    checkpoint: Arc<CheckpointManager<S>>,
    handlers: RwLock<Vec<Arc<dyn ShutdownHandler>>>,
    grace_period: Duration,
    handler_timeout: Duration,
    /// Cancelled on forced shutdown; share it with the runner via
    /// `WorkflowRunner::with_cancellation` so new runs start cancelled.
    root: CancellationToken,
    started: AtomicBool,
    report: Mutex<Option<ShutdownReport>>,
    complete: CancellationToken,
}

impl<S: StateStore> ShutdownManager<S> {
    pub fn new(
        active: ActiveRuns,
        checkpoint: Arc<CheckpointManager<S>>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            active,
            checkpoint,
            handlers: RwLock::new(Vec::new()),
            grace_period: Duration::from_millis(config.shutdown_grace_period_ms),
            handler_timeout: Duration::from_millis(config.handler_timeout_ms),
            root: CancellationToken::new(),
            started: AtomicBool::new(false),
            report: Mutex::new(None),
            complete: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.root = token;
        self
    }

    pub fn register_handler(&self, handler: Arc<dyn ShutdownHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handler);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Resolves when a shutdown (graceful or forced) has finished.
    pub async fn wait_complete(&self) {
        self.complete.cancelled().await
    }

    fn handlers(&self) -> Vec<Arc<dyn ShutdownHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Deliver `event` to every handler, each bounded by the handler timeout.
    async fn notify(&self, event: Event<'_>) {
        for handler in self.handlers() {
            let hook = match event {
                Event::Started(reason) => handler.on_shutdown_started(reason),
                Event::StepInterrupted { run_id, step_id } => {
                    handler.on_step_interrupted(run_id, step_id)
                }
                Event::StateSaved(state) => handler.on_state_saved(state),
                Event::Complete(report) => handler.on_shutdown_complete(report),
            };
            if tokio::time::timeout(self.handler_timeout, hook).await.is_err() {
                tracing::warn!(
                    handler = handler.name(),
                    event = event.name(),
                    timeout_ms = self.handler_timeout.as_millis() as u64,
                    "shutdown handler timed out"
                );
            }
        }
    }

    /// Stop every active run and persist it as resumable.
    ///
    /// Idempotent: later (or concurrent) calls wait for the first one and
    /// return its report.
    pub async fn shutdown(&self, reason: &str) -> ShutdownReport {
        let mut slot = self.report.lock().await;
        if let Some(report) = slot.as_ref() {
            return report.clone();
        }
        self.started.store(true, Ordering::SeqCst);
        let clock = Instant::now();
        let handles = self.active.handles();
        tracing::info!(reason, runs = handles.len(), "graceful shutdown started");

        self.notify(Event::Started(reason)).await;
        for handle in &handles {
            handle.request_pause(reason);
        }

        let drained = wait_all(&handles, self.grace_period).await;
        if !drained {
            tracing::warn!(
                grace_ms = self.grace_period.as_millis() as u64,
                "grace period expired, aborting in-flight steps"
            );
        }

        let mut interrupted: Vec<Vec<String>> = Vec::with_capacity(handles.len());
        for handle in &handles {
            let steps = if handle.is_finished() {
                Vec::new()
            } else {
                handle.in_flight_steps()
            };
            for step_id in &steps {
                tracing::warn!(run_id = handle.run_id(), step_id = step_id.as_str(), "interrupting step");
                self.notify(Event::StepInterrupted {
                    run_id: handle.run_id(),
                    step_id,
                })
                .await;
            }
            if !handle.is_finished() {
                handle.abort_in_flight();
            }
            interrupted.push(steps);
        }
        if !drained {
            wait_all(&handles, self.handler_timeout).await;
        }

        let mut runs = Vec::with_capacity(handles.len());
        for (handle, steps) in handles.iter().zip(interrupted) {
            runs.push(
                self.settle(handle, WorkflowStatus::Paused, reason, steps)
                    .await,
            );
        }

        let report = ShutdownReport {
            reason: reason.to_string(),
            forced: false,
            runs,
            duration_ms: clock.elapsed().as_millis() as u64,
        };
        self.notify(Event::Complete(&report)).await;
        tracing::info!(
            runs = report.runs.len(),
            interrupted = report.interrupted_step_count(),
            duration_ms = report.duration_ms,
            "graceful shutdown complete"
        );

        *slot = Some(report.clone());
        self.complete.cancel();
        report
    }

    /// Cancel every active run immediately.
    ///
    /// Does not wait for a graceful shutdown in progress; runs it has not yet
    /// released are cancelled underneath it.
    pub async fn force_shutdown(&self, reason: &str) -> ShutdownReport {
        self.started.store(true, Ordering::SeqCst);
        let clock = Instant::now();
        let handles = self.active.handles();
        tracing::warn!(reason, runs = handles.len(), "forced shutdown");

        let interrupted: Vec<Vec<String>> = handles.iter().map(|h| h.in_flight_steps()).collect();
        self.root.cancel();
        for handle in &handles {
            handle.request_cancel(reason);
        }
        wait_all(&handles, self.handler_timeout).await;

        let mut runs = Vec::with_capacity(handles.len());
        for (handle, steps) in handles.iter().zip(interrupted) {
            runs.push(
                self.settle(handle, WorkflowStatus::Cancelled, reason, steps)
                    .await,
            );
        }

        let report = ShutdownReport {
            reason: reason.to_string(),
            forced: true,
            runs,
            duration_ms: clock.elapsed().as_millis() as u64,
        };
        self.notify(Event::Complete(&report)).await;
        self.complete.cancel();
        report
    }

    /// Persist a run that did not finish on its own, release its
    /// environment overlay, and describe the outcome.
    async fn settle(
        &self,
        handle: &RunHandle,
        status: WorkflowStatus,
        reason: &str,
        interrupted_steps: Vec<String>,
    ) -> RunShutdown {
        let finished_cleanly = handle.is_finished();
        let persisted = if finished_cleanly {
            true
        } else {
            self.persist_fallback(handle, status, reason, &interrupted_steps)
                .await
        };
        handle.context().clear_environment();

        let state = handle.state().lock().await.clone();
        if persisted {
            self.notify(Event::StateSaved(&state)).await;
        }

        RunShutdown {
            run_id: handle.run_id().to_string(),
            workflow_name: handle.workflow_name().to_string(),
            status: state.status,
            interrupted_steps,
            finished_cleanly,
            persisted,
        }
    }

    async fn persist_fallback(
        &self,
        handle: &RunHandle,
        status: WorkflowStatus,
        reason: &str,
        interrupted_steps: &[String],
    ) -> bool {
        tracing::warn!(
            run_id = handle.run_id(),
            %status,
            "run did not stop in time, writing state directly"
        );
        let context = handle.context().snapshot();
        let result = self
            .checkpoint
            .update(handle.state(), |state| {
                for entry in state.step_states.values_mut() {
                    if entry.status != StepStatus::Running {
                        continue;
                    }
                    *entry = if status == WorkflowStatus::Paused {
                        StepState::pending()
                    } else {
                        StepState {
                            status: StepStatus::Failed,
                            result: Some(StepResult::failed(format!("cancelled: {reason}"), 0)),
                            skip_reason: None,
                        }
                    };
                }
                state.status = status;
                let meta = &mut state.execution_metadata;
                meta.interruption = Some(InterruptionRecord {
                    reason: reason.to_string(),
                    at: Utc::now(),
                    interrupted_steps: interrupted_steps.to_vec(),
                });
                if status.is_terminal() {
                    meta.completed_at = Some(Utc::now());
                }
                state.context = Some(context);
            })
            .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(run_id = handle.run_id(), error = %e, "could not persist run during shutdown");
                false
            }
        }
    }
}

/// Wait until every run has finished, up to `limit`. Returns `true` if all
/// finished in time.
async fn wait_all(handles: &[Arc<RunHandle>], limit: Duration) -> bool {
    let finished = join_all(handles.iter().map(|h| h.wait_finished()));
    tokio::time::timeout(limit, finished).await.is_ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InMemoryStateStore;
    use crate::workflow::runner::WorkflowRunner;
    use crate::workflow::runner::tests::{definition, options, runner_with, wait_for_in_flight};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        started: AtomicUsize,
        interrupted: std::sync::Mutex<Vec<String>>,
        saved: AtomicUsize,
        complete: AtomicUsize,
    }

    impl ShutdownHandler for Counting {
        fn on_shutdown_started<'a>(&'a self, _reason: &'a str) -> BoxFuture<'a, ()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }

        fn on_step_interrupted<'a>(&'a self, run_id: &'a str, step_id: &'a str) -> BoxFuture<'a, ()> {
            self.interrupted
                .lock()
                .unwrap()
                .push(format!("{run_id}/{step_id}"));
            Box::pin(async {})
        }

        fn on_state_saved<'a>(&'a self, _state: &'a WorkflowState) -> BoxFuture<'a, ()> {
            self.saved.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }

        fn on_shutdown_complete<'a>(&'a self, _report: &'a ShutdownReport) -> BoxFuture<'a, ()> {
            self.complete.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    struct Stuck;

    impl ShutdownHandler for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }

        fn on_shutdown_started<'a>(&'a self, _reason: &'a str) -> BoxFuture<'a, ()> {
            Box::pin(tokio::time::sleep(Duration::from_secs(30)))
        }
    }

    fn config(grace_ms: u64) -> EngineConfig {
        EngineConfig {
            shutdown_grace_period_ms: grace_ms,
            handler_timeout_ms: 200,
            ..EngineConfig::default()
        }
    }

    async fn setup(
        grace_ms: u64,
    ) -> (
        Arc<WorkflowRunner<InMemoryStateStore>>,
        ShutdownManager<InMemoryStateStore>,
    ) {
        let (runner, _) = runner_with(config(grace_ms)).await;
        let manager = ShutdownManager::new(
            runner.active_runs().clone(),
            Arc::clone(runner.checkpoint()),
            &config(grace_ms),
        );
        (Arc::new(runner), manager)
    }

    fn spawn_run(
        runner: &Arc<WorkflowRunner<InMemoryStateStore>>,
        run_id: &'static str,
        sleep_ms: u64,
    ) -> tokio::task::JoinHandle<()> {
        let runner = Arc::clone(runner);
        let def = definition(json!([
            { "id": "work", "type": "mock", "config": { "sleepMs": sleep_ms } },
            { "id": "after", "type": "mock", "dependsOn": ["work"] }
        ]));
        tokio::spawn(async move {
            let _ = runner.run(&def, HashMap::new(), options(run_id)).await;
        })
    }

    #[tokio::test]
    async fn test_no_active_runs() {
        let (_, manager) = setup(100).await;
        let report = manager.shutdown("idle").await;
        assert!(report.runs.is_empty());
        assert!(!report.forced);
        assert!(manager.is_shutting_down());
    }

    #[tokio::test]
    async fn test_graceful_waits_for_short_steps() {
        let (runner, manager) = setup(2_000).await;
        let counting = Arc::new(Counting::default());
        manager.register_handler(counting.clone());

        let task = spawn_run(&runner, "short", 50);
        wait_for_in_flight(&runner, "short", "work").await;

        let report = manager.shutdown("deploy").await;
        task.await.unwrap();

        assert_eq!(report.runs.len(), 1);
        let run = &report.runs[0];
        assert_eq!(run.status, WorkflowStatus::Paused);
        assert!(run.finished_cleanly);
        assert!(run.interrupted_steps.is_empty());

        let state = runner.checkpoint().load("short").await.unwrap().unwrap();
        assert_eq!(state.completed_steps(), vec!["work"]);
        assert_eq!(state.step_status("after"), Some(StepStatus::Pending));
        assert!(state.can_resume());

        assert_eq!(counting.started.load(Ordering::SeqCst), 1);
        assert_eq!(counting.saved.load(Ordering::SeqCst), 1);
        assert_eq!(counting.complete.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_grace_period_expiry_interrupts_steps() {
        let (runner, manager) = setup(50).await;
        let counting = Arc::new(Counting::default());
        manager.register_handler(counting.clone());

        let task = spawn_run(&runner, "long", 5_000);
        wait_for_in_flight(&runner, "long", "work").await;

        let report = manager.shutdown("sigterm").await;
        task.await.unwrap();

        let run = &report.runs[0];
        assert_eq!(run.interrupted_steps, vec!["work"]);
        assert_eq!(run.status, WorkflowStatus::Paused);
        assert_eq!(*counting.interrupted.lock().unwrap(), vec!["long/work"]);

        let state = runner.checkpoint().load("long").await.unwrap().unwrap();
        assert_eq!(state.status, WorkflowStatus::Paused);
        assert_eq!(state.step_status("work"), Some(StepStatus::Pending));
        let interruption = state.execution_metadata.interruption.unwrap();
        assert_eq!(interruption.reason, "sigterm");
        assert_eq!(interruption.interrupted_steps, vec!["work"]);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (_, manager) = setup(100).await;
        let counting = Arc::new(Counting::default());
        manager.register_handler(counting.clone());

        let first = manager.shutdown("one").await;
        let second = manager.shutdown("two").await;
        assert_eq!(first, second);
        assert_eq!(second.reason, "one");
        assert_eq!(counting.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_force_shutdown_cancels_runs() {
        let (runner, manager) = setup(10_000).await;
        let task = spawn_run(&runner, "forced", 5_000);
        wait_for_in_flight(&runner, "forced", "work").await;

        let report = manager.force_shutdown("second signal").await;
        task.await.unwrap();

        assert!(report.forced);
        assert_eq!(report.runs[0].status, WorkflowStatus::Cancelled);
        let state = runner.checkpoint().load("forced").await.unwrap().unwrap();
        assert_eq!(state.status, WorkflowStatus::Cancelled);
        assert!(!state.can_resume());
    }

    #[tokio::test]
    async fn test_slow_handler_is_bounded() {
        let (_, manager) = setup(100).await;
        manager.register_handler(Arc::new(Stuck));
        let started = std::time::Instant::now();
        manager.shutdown("bounded").await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
