//! Step executor trait, lifecycle hooks, and the object-safe boxed wrapper.
//!
//! `StepExecutor` uses RPITIT for its async methods. Because RPITIT traits
//! are not object-safe, the same blanket-impl pattern as the rest of the
//! workspace applies:
//! 1. `StepExecutorDyn` is an object-safe mirror with boxed futures
//! 2. every `T: StepExecutor` gets `StepExecutorDyn` for free
//! 3. `BoxStepExecutor` wraps `Arc<dyn StepExecutorDyn>` and delegates

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use conductor_types::workflow::WorkflowStep;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::context::WorkflowContext;
use super::error::WorkflowError;
use crate::plugin::sandbox::SandboxGuard;

// ---------------------------------------------------------------------------
// Validation report
// ---------------------------------------------------------------------------

/// Outcome of an executor's static check of a step definition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    /// Valid iff `errors` is empty.
    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

// ---------------------------------------------------------------------------
// StepScope
// ---------------------------------------------------------------------------

/// Everything an executor may touch while running one step attempt.
#[derive(Debug, Clone)]
pub struct StepScope {
    /// Shared run context.
    pub context: Arc<WorkflowContext>,
    pub step_id: String,
    /// Fires when the run is cancelled, the step times out, or shutdown
    /// aborts in-flight work.
    pub cancel: CancellationToken,
    /// Host-call checks for sandboxed executors.
    pub sandbox: SandboxGuard,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Wall-clock budget enforced by `execute_with_hooks`.
    pub timeout: Option<Duration>,
}

impl StepScope {
    pub fn new(context: Arc<WorkflowContext>, step_id: impl Into<String>) -> Self {
        Self {
            context,
            step_id: step_id.into(),
            cancel: CancellationToken::new(),
            sandbox: SandboxGuard::unrestricted(),
            attempt: 1,
            timeout: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxGuard) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

// ---------------------------------------------------------------------------
// StepExecutor trait
// ---------------------------------------------------------------------------

/// Runs steps of one type.
///
/// Only `supported_type` and `execute` are required. The hooks default to
/// no-ops; `execute_with_hooks` guarantees that exactly one of
/// `after_execute` / `on_error` follows each invocation.
pub trait StepExecutor: Send + Sync {
    /// The step `type` string this executor handles.
    fn supported_type(&self) -> &str;

    /// Static check of a step definition, run before the workflow starts.
    fn validate(&self, _step: &WorkflowStep) -> ValidationReport {
        ValidationReport::ok()
    }

    fn execute(
        &self,
        step: &WorkflowStep,
        scope: &StepScope,
    ) -> impl Future<Output = Result<Value, WorkflowError>> + Send;

    fn before_execute(
        &self,
        _step: &WorkflowStep,
        _scope: &StepScope,
    ) -> impl Future<Output = Result<(), WorkflowError>> + Send {
        async { Ok(()) }
    }

    fn after_execute(
        &self,
        _step: &WorkflowStep,
        _scope: &StepScope,
        _output: &Value,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn on_error(
        &self,
        _step: &WorkflowStep,
        _scope: &StepScope,
        _error: &WorkflowError,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Object-safe version of [`StepExecutor`] with boxed futures.
///
/// This trait exists solely to enable dynamic dispatch. A blanket
/// implementation is provided for all types implementing `StepExecutor`.
pub trait StepExecutorDyn: Send + Sync {
    fn supported_type(&self) -> &str;

    fn validate(&self, step: &WorkflowStep) -> ValidationReport;

    fn execute_boxed<'a>(
        &'a self,
        step: &'a WorkflowStep,
        scope: &'a StepScope,
    ) -> BoxFuture<'a, Result<Value, WorkflowError>>;

    fn before_execute_boxed<'a>(
        &'a self,
        step: &'a WorkflowStep,
        scope: &'a StepScope,
    ) -> BoxFuture<'a, Result<(), WorkflowError>>;

    fn after_execute_boxed<'a>(
        &'a self,
        step: &'a WorkflowStep,
        scope: &'a StepScope,
        output: &'a Value,
    ) -> BoxFuture<'a, ()>;

    fn on_error_boxed<'a>(
        &'a self,
        step: &'a WorkflowStep,
        scope: &'a StepScope,
        error: &'a WorkflowError,
    ) -> BoxFuture<'a, ()>;
}

impl<T: StepExecutor> StepExecutorDyn for T {
    fn supported_type(&self) -> &str {
        StepExecutor::supported_type(self)
    }

    fn validate(&self, step: &WorkflowStep) -> ValidationReport {
        StepExecutor::validate(self, step)
    }

    fn execute_boxed<'a>(
        &'a self,
        step: &'a WorkflowStep,
        scope: &'a StepScope,
    ) -> BoxFuture<'a, Result<Value, WorkflowError>> {
        Box::pin(StepExecutor::execute(self, step, scope))
    }

    fn before_execute_boxed<'a>(
        &'a self,
        step: &'a WorkflowStep,
        scope: &'a StepScope,
    ) -> BoxFuture<'a, Result<(), WorkflowError>> {
        Box::pin(StepExecutor::before_execute(self, step, scope))
    }

    fn after_execute_boxed<'a>(
        &'a self,
        step: &'a WorkflowStep,
        scope: &'a StepScope,
        output: &'a Value,
    ) -> BoxFuture<'a, ()> {
        Box::pin(StepExecutor::after_execute(self, step, scope, output))
    }

    fn on_error_boxed<'a>(
        &'a self,
        step: &'a WorkflowStep,
        scope: &'a StepScope,
        error: &'a WorkflowError,
    ) -> BoxFuture<'a, ()> {
        Box::pin(StepExecutor::on_error(self, step, scope, error))
    }
}

// ---------------------------------------------------------------------------
// BoxStepExecutor
// ---------------------------------------------------------------------------

/// Type-erased, cheaply cloneable step executor.
#[derive(Clone)]
pub struct BoxStepExecutor {
    inner: Arc<dyn StepExecutorDyn>,
}

impl BoxStepExecutor {
    /// Wrap a concrete `StepExecutor`.
    pub fn new<T: StepExecutor + 'static>(executor: T) -> Self {
        Self {
            inner: Arc::new(executor),
        }
    }

    pub fn supported_type(&self) -> &str {
        self.inner.supported_type()
    }

    pub fn validate(&self, step: &WorkflowStep) -> ValidationReport {
        self.inner.validate(step)
    }

    pub async fn execute(
        &self,
        step: &WorkflowStep,
        scope: &StepScope,
    ) -> Result<Value, WorkflowError> {
        self.inner.execute_boxed(step, scope).await
    }

    pub async fn before_execute(
        &self,
        step: &WorkflowStep,
        scope: &StepScope,
    ) -> Result<(), WorkflowError> {
        self.inner.before_execute_boxed(step, scope).await
    }

    pub async fn after_execute(&self, step: &WorkflowStep, scope: &StepScope, output: &Value) {
        self.inner.after_execute_boxed(step, scope, output).await
    }

    pub async fn on_error(&self, step: &WorkflowStep, scope: &StepScope, error: &WorkflowError) {
        self.inner.on_error_boxed(step, scope, error).await
    }
}

impl std::fmt::Debug for BoxStepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepExecutor")
            .field("supported_type", &self.supported_type())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Hook orchestration
// ---------------------------------------------------------------------------

/// Run one step attempt through the executor lifecycle.
///
/// `before_execute` then `execute`, raced against `scope.timeout` and
/// `scope.cancel`. On success `after_execute` runs; on any failure
/// (including one raised by `before_execute`, a timeout, or a panic)
/// `on_error` runs. Exactly one of the two is called per invocation.
pub async fn execute_with_hooks(
    executor: &BoxStepExecutor,
    step: &WorkflowStep,
    scope: &StepScope,
) -> Result<Value, WorkflowError> {
    let attempt = AssertUnwindSafe(async {
        executor.before_execute(step, scope).await?;
        executor.execute(step, scope).await
    })
    .catch_unwind();

    let guarded = async {
        match attempt.await {
            Ok(result) => result,
            Err(panic) => Err(WorkflowError::step(
                &step.id,
                format!("executor panicked: {}", panic_message(panic.as_ref())),
            )),
        }
    };

    let deadline = async {
        match scope.timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    let result = tokio::select! {
        result = guarded => result,
        () = deadline => {
            scope.cancel.cancel();
            Err(WorkflowError::Timeout {
                operation: format!("step '{}'", step.id),
                timeout_ms: scope.timeout.map(|d| d.as_millis() as u64).unwrap_or_default(),
            })
        }
        () = scope.cancel.cancelled() => Err(WorkflowError::Cancelled {
            reason: format!("step '{}' was cancelled", step.id),
        }),
    };

    match &result {
        Ok(output) => {
            guard_hook(step, "after_execute", executor.after_execute(step, scope, output)).await
        }
        Err(error) => guard_hook(step, "on_error", executor.on_error(step, scope, error)).await,
    }

    result
}

async fn guard_hook(step: &WorkflowStep, hook: &str, fut: impl Future<Output = ()>) {
    if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
        tracing::warn!(
            step_id = step.id.as_str(),
            hook,
            panic = %panic_message(panic.as_ref()),
            "step hook panicked"
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_types::config::VariableWriteMode;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        before: AtomicUsize,
        execute: AtomicUsize,
        after: AtomicUsize,
        on_error: AtomicUsize,
    }

    enum Mode {
        Succeed,
        Fail,
        FailBefore,
        Panic,
        Hang,
    }

    struct Probe {
        mode: Mode,
        counters: Arc<Counters>,
    }

    impl StepExecutor for Probe {
        fn supported_type(&self) -> &str {
            "probe"
        }

        async fn before_execute(
            &self,
            step: &WorkflowStep,
            _scope: &StepScope,
        ) -> Result<(), WorkflowError> {
            self.counters.before.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                Mode::FailBefore => Err(WorkflowError::step(&step.id, "not ready")),
                _ => Ok(()),
            }
        }

        async fn execute(
            &self,
            step: &WorkflowStep,
            _scope: &StepScope,
        ) -> Result<Value, WorkflowError> {
            self.counters.execute.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                Mode::Succeed => Ok(json!({"ok": true})),
                Mode::Fail | Mode::FailBefore => Err(WorkflowError::step(&step.id, "boom")),
                Mode::Panic => panic!("executor exploded"),
                Mode::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Value::Null)
                }
            }
        }

        async fn after_execute(&self, _step: &WorkflowStep, _scope: &StepScope, _output: &Value) {
            self.counters.after.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_error(&self, _step: &WorkflowStep, _scope: &StepScope, _error: &WorkflowError) {
            self.counters.on_error.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn step() -> WorkflowStep {
        serde_json::from_value(json!({ "id": "probe-step", "type": "probe" })).unwrap()
    }

    fn scope() -> StepScope {
        let ctx = Arc::new(WorkflowContext::new(
            "run",
            "flow",
            VariableWriteMode::LastWriteWins,
        ));
        StepScope::new(ctx, "probe-step")
    }

    async fn run(mode: Mode, scope: StepScope) -> (Result<Value, WorkflowError>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let executor = BoxStepExecutor::new(Probe {
            mode,
            counters: Arc::clone(&counters),
        });
        let result = execute_with_hooks(&executor, &step(), &scope).await;
        (result, counters)
    }

    fn hook_counts(c: &Counters) -> (usize, usize) {
        (c.after.load(Ordering::SeqCst), c.on_error.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_success_calls_after_only() {
        let (result, c) = run(Mode::Succeed, scope()).await;
        assert_eq!(result.unwrap(), json!({"ok": true}));
        assert_eq!(hook_counts(&c), (1, 0));
        assert_eq!(c.before.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_calls_on_error_only() {
        let (result, c) = run(Mode::Fail, scope()).await;
        assert!(result.is_err());
        assert_eq!(hook_counts(&c), (0, 1));
    }

    #[tokio::test]
    async fn test_before_execute_failure_skips_execute() {
        let (result, c) = run(Mode::FailBefore, scope()).await;
        assert!(matches!(result, Err(WorkflowError::Step { message, .. }) if message == "not ready"));
        assert_eq!(c.execute.load(Ordering::SeqCst), 0);
        assert_eq!(hook_counts(&c), (0, 1));
    }

    #[tokio::test]
    async fn test_panic_becomes_step_error() {
        let (result, c) = run(Mode::Panic, scope()).await;
        match result {
            Err(WorkflowError::Step { step_id, message }) => {
                assert_eq!(step_id, "probe-step");
                assert!(message.contains("executor exploded"));
            }
            other => panic!("expected step error, got {other:?}"),
        }
        assert_eq!(hook_counts(&c), (0, 1));
    }

    #[tokio::test]
    async fn test_timeout_calls_on_error_and_cancels_scope() {
        let scope = scope().with_timeout(Some(Duration::from_millis(20)));
        let token = scope.cancel.clone();
        let (result, c) = run(Mode::Hang, scope).await;
        assert!(matches!(result, Err(WorkflowError::Timeout { timeout_ms: 20, .. })));
        assert!(token.is_cancelled());
        assert_eq!(hook_counts(&c), (0, 1));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_execute() {
        let token = CancellationToken::new();
        let scope = scope().with_cancel(token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let (result, c) = run(Mode::Hang, scope).await;
        canceller.await.unwrap();
        assert!(matches!(result, Err(WorkflowError::Cancelled { .. })));
        assert_eq!(hook_counts(&c), (0, 1));
    }

    #[test]
    fn test_validation_report() {
        assert!(ValidationReport::ok().valid);
        assert!(ValidationReport::from_errors(vec![]).valid);
        let report = ValidationReport::from_errors(vec!["missing command".into()]);
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 1);
    }
}
