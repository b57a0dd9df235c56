//! Agent invoker backed by an external command.
//!
//! The configured program receives the prompt on stdin and answers on
//! stdout. Request metadata is exported through `CONDUCTOR_AGENT`,
//! `CONDUCTOR_MODEL`, `CONDUCTOR_RUN_ID`, and `CONDUCTOR_STEP_ID`.

use std::sync::Arc;

use conductor_core::workflow::builtin::{AgentInvoker, AgentRequest};
use conductor_core::workflow::error::WorkflowError;
use conductor_types::config::{AgentCommandConfig, EngineConfig};
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::process::{self, CommandSpec, ProcessError};

pub struct CommandAgentInvoker {
    config: AgentCommandConfig,
}

impl CommandAgentInvoker {
    pub fn new(config: AgentCommandConfig) -> Self {
        Self { config }
    }

    /// Invoker for the `[agent]` table, if one is configured.
    pub fn from_config(config: &EngineConfig) -> Option<Arc<dyn AgentInvoker>> {
        config
            .agent
            .clone()
            .map(|agent| Arc::new(Self::new(agent)) as Arc<dyn AgentInvoker>)
    }

    fn command_for(&self, request: &AgentRequest) -> CommandSpec {
        let mut spec = CommandSpec::program(self.config.command.clone(), self.config.args.clone());
        spec.env.extend(self.config.env.clone());
        spec.env.insert("CONDUCTOR_AGENT".into(), request.agent.clone());
        if let Some(model) = &request.model {
            spec.env.insert("CONDUCTOR_MODEL".into(), model.clone());
        }
        spec.env.insert("CONDUCTOR_RUN_ID".into(), request.run_id.clone());
        spec.env.insert("CONDUCTOR_STEP_ID".into(), request.step_id.clone());
        spec
    }
}

impl AgentInvoker for CommandAgentInvoker {
    fn invoke<'a>(
        &'a self,
        request: &'a AgentRequest,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<String, WorkflowError>> {
        Box::pin(async move {
            let spec = self.command_for(request);
            tracing::info!(
                agent = request.agent.as_str(),
                run_id = request.run_id.as_str(),
                step_id = request.step_id.as_str(),
                "invoking agent"
            );

            // Step and plugin timeouts are enforced by the runner.
            let output = process::run(&spec, Some(request.prompt.clone()), None, cancel)
                .await
                .map_err(|e| match e {
                    ProcessError::Cancelled => WorkflowError::Cancelled {
                        reason: format!("agent '{}' cancelled", request.agent),
                    },
                    other => WorkflowError::Executor {
                        step_type: "agent".to_string(),
                        message: other.to_string(),
                    },
                })?;

            if !output.success() {
                let code = output
                    .exit_code
                    .map_or_else(|| "signal".to_string(), |c| c.to_string());
                return Err(WorkflowError::step(
                    &request.step_id,
                    format!("agent '{}' exited with {code}: {}", request.agent, output.stderr.trim()),
                ));
            }
            Ok(output.stdout.trim().to_string())
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn request(prompt: &str) -> AgentRequest {
        AgentRequest {
            agent: "reviewer".into(),
            prompt: prompt.into(),
            model: Some("large".into()),
            run_id: "run-1".into(),
            step_id: "review".into(),
        }
    }

    fn shell_agent(script: &str) -> CommandAgentInvoker {
        CommandAgentInvoker::new(AgentCommandConfig {
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            env: HashMap::from([("TONE".to_string(), "terse".to_string())]),
        })
    }

    #[tokio::test]
    async fn test_prompt_on_stdin_reply_on_stdout() {
        let agent = shell_agent("read p; echo \"$CONDUCTOR_AGENT/$CONDUCTOR_MODEL/$TONE: $p\"");
        let reply = agent
            .invoke(&request("check the diff"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply, "reviewer/large/terse: check the diff");
    }

    #[tokio::test]
    async fn test_failed_agent_reports_stderr() {
        let agent = shell_agent("echo 'quota exceeded' >&2; exit 2");
        let err = agent
            .invoke(&request("hi"), &CancellationToken::new())
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exited with 2"), "{message}");
        assert!(message.contains("quota exceeded"), "{message}");
    }

    #[tokio::test]
    async fn test_cancelled_agent() {
        let agent = shell_agent("sleep 5");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = agent.invoke(&request("hi"), &cancel).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Cancelled { .. }));
    }

    #[test]
    fn test_from_config_requires_agent_table() {
        let mut config = EngineConfig::default();
        assert!(CommandAgentInvoker::from_config(&config).is_none());
        config.agent = Some(AgentCommandConfig {
            command: "claude".into(),
            args: vec![],
            env: HashMap::new(),
        });
        assert!(CommandAgentInvoker::from_config(&config).is_some());
    }
}
