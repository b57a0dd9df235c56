//! Resource and capability enforcement for plugin executors.
//!
//! Capabilities and path grants are advisory: executors ask the
//! `SandboxGuard` in their `StepScope` before touching a host facility.
//! Timeouts and the memory ceiling are enforced here by racing the wrapped
//! executor against a deadline and a memory watcher.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use conductor_types::plugin::SandboxPolicy;
use conductor_types::workflow::WorkflowStep;
use serde_json::Value;

use crate::workflow::error::WorkflowError;
use crate::workflow::executor::{BoxStepExecutor, StepExecutor, StepScope, ValidationReport};

// ---------------------------------------------------------------------------
// Memory probe
// ---------------------------------------------------------------------------

/// Source of the current memory usage used for the sandbox ceiling.
///
/// Plugins run in-process, so the figure is process-wide.
pub trait MemoryProbe: Send + Sync {
    /// Resident bytes, or `None` when the platform cannot tell.
    fn current_usage_bytes(&self) -> Option<u64>;
}

/// Probe that never reports a figure; memory ceilings become no-ops.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMemoryProbe;

impl MemoryProbe for NoopMemoryProbe {
    fn current_usage_bytes(&self) -> Option<u64> {
        None
    }
}

// ---------------------------------------------------------------------------
// SandboxGuard
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct GuardInner {
    plugin: String,
    policy: SandboxPolicy,
}

/// Capability and path checks handed to executors through `StepScope`.
#[derive(Debug, Clone, Default)]
pub struct SandboxGuard {
    inner: Option<Arc<GuardInner>>,
}

impl SandboxGuard {
    /// Guard that grants everything (built-in executors).
    pub fn unrestricted() -> Self {
        Self { inner: None }
    }

    pub fn for_policy(plugin: impl Into<String>, policy: SandboxPolicy) -> Self {
        Self {
            inner: Some(Arc::new(GuardInner {
                plugin: plugin.into(),
                policy,
            })),
        }
    }

    pub fn is_restricted(&self) -> bool {
        self.inner.is_some()
    }

    pub fn policy(&self) -> Option<&SandboxPolicy> {
        self.inner.as_ref().map(|g| &g.policy)
    }

    pub fn check_capability(&self, capability: &str) -> Result<(), WorkflowError> {
        match &self.inner {
            Some(g) if !g.policy.allows_capability(capability) => {
                Err(WorkflowError::SandboxViolation(format!(
                    "plugin '{}' is not granted capability '{capability}'",
                    g.plugin
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn check_read(&self, path: &Path) -> Result<(), WorkflowError> {
        match &self.inner {
            Some(g) if !g.policy.allows_read(path) => Err(WorkflowError::SandboxViolation(
                format!("plugin '{}' may not read '{}'", g.plugin, path.display()),
            )),
            _ => Ok(()),
        }
    }

    pub fn check_write(&self, path: &Path) -> Result<(), WorkflowError> {
        match &self.inner {
            Some(g) if !g.policy.allows_write(path) => Err(WorkflowError::SandboxViolation(
                format!("plugin '{}' may not write '{}'", g.plugin, path.display()),
            )),
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// SandboxedExecutor
// ---------------------------------------------------------------------------

/// Wraps a plugin executor with its sandbox policy.
pub struct SandboxedExecutor {
    plugin: String,
    inner: BoxStepExecutor,
    policy: SandboxPolicy,
    guard: SandboxGuard,
    probe: Arc<dyn MemoryProbe>,
}

impl SandboxedExecutor {
    pub fn new(
        plugin: impl Into<String>,
        inner: BoxStepExecutor,
        policy: SandboxPolicy,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        let plugin = plugin.into();
        let guard = SandboxGuard::for_policy(plugin.clone(), policy.clone());
        Self {
            plugin,
            inner,
            policy,
            guard,
            probe,
        }
    }

    fn scoped(&self, scope: &StepScope) -> StepScope {
        scope.clone().with_sandbox(self.guard.clone())
    }

    /// Resolves only when the memory ceiling is crossed.
    async fn watch_memory(&self) -> WorkflowError {
        let Some(limit) = self.policy.max_memory_bytes else {
            return std::future::pending().await;
        };
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.policy.memory_poll_interval_ms));
        loop {
            ticker.tick().await;
            if let Some(used) = self.probe.current_usage_bytes() {
                if used > limit {
                    tracing::warn!(plugin = %self.plugin, used, limit, "sandbox memory ceiling exceeded");
                    return WorkflowError::Resource {
                        resource: "memory".to_string(),
                        limit,
                    };
                }
            }
        }
    }
}

impl StepExecutor for SandboxedExecutor {
    fn supported_type(&self) -> &str {
        self.inner.supported_type()
    }

    fn validate(&self, step: &WorkflowStep) -> ValidationReport {
        self.inner.validate(step)
    }

    async fn before_execute(
        &self,
        step: &WorkflowStep,
        scope: &StepScope,
    ) -> Result<(), WorkflowError> {
        self.inner.before_execute(step, &self.scoped(scope)).await
    }

    async fn execute(&self, step: &WorkflowStep, scope: &StepScope) -> Result<Value, WorkflowError> {
        let cancel = scope.cancel.child_token();
        let sandboxed = self.scoped(scope).with_cancel(cancel.clone());
        let limit = Duration::from_millis(self.policy.timeout_ms);

        let result = tokio::select! {
            result = self.inner.execute(step, &sandboxed) => result,
            () = tokio::time::sleep(limit) => Err(WorkflowError::Timeout {
                operation: format!("plugin '{}' step '{}'", self.plugin, step.id),
                timeout_ms: self.policy.timeout_ms,
            }),
            err = self.watch_memory() => Err(err),
        };
        if result.is_err() {
            cancel.cancel();
        }
        result
    }

    async fn after_execute(&self, step: &WorkflowStep, scope: &StepScope, output: &Value) {
        self.inner.after_execute(step, &self.scoped(scope), output).await
    }

    async fn on_error(&self, step: &WorkflowStep, scope: &StepScope, error: &WorkflowError) {
        self.inner.on_error(step, &self.scoped(scope), error).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
