//! `run` and `resume`, with signal-driven shutdown.
//!
//! The first Ctrl-C / SIGTERM starts a graceful shutdown: dispatch stops,
//! in-flight steps get the configured grace period, and the run is saved as
//! paused. A second signal forces cancellation.

use std::collections::HashMap;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use console::style;
use serde_json::Value;

use conductor_core::shutdown::ShutdownManager;
use conductor_core::state::StateStore as _;
use conductor_core::workflow::runner::RunOptions;
use conductor_infra::definition::load_definition;
use conductor_infra::state::FsStateStore;
use conductor_types::workflow::{WorkflowResult, WorkflowStatus};

use super::parse_pair;
use super::render::{print_outcome, print_plan};
use crate::state::AppState;

pub struct RunArgs<'a> {
    pub file: &'a Path,
    pub vars: &'a [String],
    pub env: &'a [String],
    pub max_concurrency: Option<usize>,
    pub run_id: Option<String>,
    pub dry_run: bool,
}

/// Parse `--var` values: JSON when they parse as JSON, else strings.
pub fn parse_variables(raw: &[String]) -> Result<HashMap<String, Value>> {
    raw.iter()
        .map(|pair| {
            let (name, value) = parse_pair(pair)?;
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            Ok((name, value))
        })
        .collect()
}

pub async fn handle_run(state: &AppState, args: RunArgs<'_>, json: bool) -> Result<ExitCode> {
    let definition = load_definition(args.file).await?;
    let runner = &state.engine.runner;

    if args.dry_run {
        let plan = runner
            .validate(&definition)
            .with_context(|| format!("workflow '{}' is invalid", definition.name))?;
        print_plan(&plan, &definition.steps, json)?;
        return Ok(ExitCode::SUCCESS);
    }

    let variables = parse_variables(args.vars)?;
    let env = args
        .env
        .iter()
        .map(String::as_str)
        .map(parse_pair)
        .collect::<Result<HashMap<_, _>>>()?;
    let options = RunOptions {
        run_id: args.run_id,
        env,
        max_concurrency: args.max_concurrency,
        resume_reason: None,
    };

    if !json {
        println!();
        println!(
            "  {} Running '{}' v{} ({} steps)",
            style("▶").green().bold(),
            style(&definition.name).cyan(),
            definition.version,
            definition.steps.len()
        );
    }

    let signals = spawn_signal_listener(state.engine.shutdown.clone(), json);
    let outcome = runner.run(&definition, variables, options).await;
    finish(state, outcome, signals, json).await
}

pub async fn handle_resume(
    state: &AppState,
    run_id: &str,
    file: &Path,
    reason: String,
    max_concurrency: Option<usize>,
    json: bool,
) -> Result<ExitCode> {
    let definition = load_definition(file).await?;
    let saved = state
        .engine
        .store()
        .load(run_id)
        .await
        .with_context(|| format!("failed to load run '{run_id}'"))?
        .ok_or_else(|| anyhow::anyhow!("Run '{run_id}' not found"))?;
    if !saved.can_resume() {
        bail!("Run '{run_id}' is {} and cannot be resumed", saved.status);
    }

    if !json {
        println!();
        println!(
            "  {} Resuming '{}' ({} of {} steps already completed)",
            style("▶").green().bold(),
            style(run_id).cyan(),
            saved.completed_steps().len(),
            saved.execution_order.len()
        );
    }

    let options = RunOptions {
        run_id: Some(run_id.to_string()),
        max_concurrency,
        resume_reason: Some(reason),
        ..RunOptions::default()
    };
    let signals = spawn_signal_listener(state.engine.shutdown.clone(), json);
    let outcome = state.engine.runner.resume(&definition, saved, options).await;
    finish(state, outcome, signals, json).await
}

/// Wait out any shutdown in progress, then print the outcome.
async fn finish(
    state: &AppState,
    outcome: Result<WorkflowResult, conductor_core::workflow::error::WorkflowError>,
    signals: tokio::task::JoinHandle<()>,
    json: bool,
) -> Result<ExitCode> {
    if state.engine.shutdown.is_shutting_down() {
        state.engine.shutdown.wait_complete().await;
    }
    signals.abort();
    state.engine.close().await;

    let result = outcome?;
    let saved = state.engine.store().load(&result.run_id).await.ok().flatten();
    print_outcome(&result, saved.as_ref(), json)?;

    if result.status == WorkflowStatus::Paused && !json {
        println!(
            "  Resume with: {}",
            style(format!("conductor resume {} <file>", result.run_id)).dim()
        );
        println!();
    }
    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Resolve on Ctrl+C or SIGTERM. `None` if no handler could be installed.
async fn shutdown_signal() -> Option<&'static str> {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => Some("interrupt"),
            Err(e) => {
                tracing::warn!(error = %e, "failed to install Ctrl+C handler");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => sigterm.recv().await.map(|()| "terminate"),
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<&'static str>>();

    tokio::select! {
        signal = ctrl_c => signal,
        signal = terminate => signal,
    }
}

fn spawn_signal_listener(
    shutdown: Arc<ShutdownManager<FsStateStore>>,
    json: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(first) = shutdown_signal().await else {
            return;
        };
        if !json {
            eprintln!(
                "\n  {} Received {first}, stopping after in-flight steps (signal again to force)",
                style("!").yellow().bold()
            );
        }
        let graceful = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.shutdown(&format!("received {first} signal")).await })
        };

        tokio::select! {
            report = graceful => {
                if let Ok(report) = report {
                    tracing::info!(
                        runs = report.runs.len(),
                        interrupted = report.interrupted_step_count(),
                        "graceful shutdown finished"
                    );
                }
            }
            second = shutdown_signal() => {
                let Some(second) = second else { return };
                if !json {
                    eprintln!("  {} Received {second} again, cancelling", style("!").red().bold());
                }
                shutdown.force_shutdown(&format!("received second {second} signal")).await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_variables_prefers_json() {
        let vars = parse_variables(&[
            "count=3".to_string(),
            "flags={\"fast\":true}".to_string(),
            "name=release build".to_string(),
            "quoted=\"7\"".to_string(),
        ])
        .unwrap();
        assert_eq!(vars["count"], json!(3));
        assert_eq!(vars["flags"]["fast"], json!(true));
        assert_eq!(vars["name"], json!("release build"));
        assert_eq!(vars["quoted"], json!("7"));
    }

    #[test]
    fn test_parse_variables_rejects_missing_equals() {
        assert!(parse_variables(&["oops".to_string()]).is_err());
    }
}
