//! Terminal rendering shared by the run and state commands.

use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use conductor_core::workflow::dag::{Batch, ExecutionPlan, transitive_dependencies};
use conductor_types::state::{LogLevel, WorkflowState};
use conductor_types::workflow::{
    SkipReason, StepStatus, WorkflowResult, WorkflowStatus, WorkflowStep,
};
use serde_json::Value;

pub fn status_color(status: WorkflowStatus) -> Color {
    match status {
        WorkflowStatus::Completed => Color::Green,
        WorkflowStatus::Failed => Color::Red,
        WorkflowStatus::Cancelled => Color::DarkGrey,
        WorkflowStatus::Paused => Color::Yellow,
        WorkflowStatus::Running | WorkflowStatus::Pending => Color::Cyan,
    }
}

pub fn styled_status(status: WorkflowStatus) -> String {
    let text = status.to_string();
    match status {
        WorkflowStatus::Completed => style(text).green().bold().to_string(),
        WorkflowStatus::Failed => style(text).red().bold().to_string(),
        WorkflowStatus::Cancelled => style(text).dim().to_string(),
        WorkflowStatus::Paused => style(text).yellow().bold().to_string(),
        WorkflowStatus::Running | WorkflowStatus::Pending => style(text).cyan().to_string(),
    }
}

fn step_cell(status: StepStatus, skip: Option<SkipReason>) -> Cell {
    match status {
        StepStatus::Completed => Cell::new("completed").fg(Color::Green),
        StepStatus::Failed => Cell::new("failed").fg(Color::Red),
        StepStatus::Running => Cell::new("running").fg(Color::Cyan),
        StepStatus::Pending => Cell::new("pending"),
        StepStatus::Skipped => {
            let why = match skip {
                Some(SkipReason::Condition) => "skipped (condition)",
                Some(SkipReason::DependencyFailed) => "skipped (dependency)",
                Some(SkipReason::RunAborted) => "skipped (aborted)",
                None => "skipped",
            };
            Cell::new(why).fg(Color::DarkGrey)
        }
    }
}

/// `1.2s`, `340ms`, `2m 05s`.
pub fn format_duration(ms: u64) -> String {
    match ms {
        0..1_000 => format!("{ms}ms"),
        1_000..60_000 => format!("{:.1}s", ms as f64 / 1000.0),
        _ => format!("{}m {:02}s", ms / 60_000, (ms % 60_000) / 1000),
    }
}

fn truncate(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() > max {
        let cut: String = line.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    } else {
        line.to_string()
    }
}

/// Per-step table in execution order.
pub fn steps_table(state: &WorkflowState) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Time"),
            Cell::new("Detail"),
        ]);

    for step_id in &state.execution_order {
        let Some(step) = state.step_states.get(step_id) else {
            continue;
        };
        let (attempts, time, detail) = match &step.result {
            Some(result) => (
                result.attempts.to_string(),
                format_duration(result.execution_time_ms),
                result.error.as_deref().map(|e| truncate(e, 60)).unwrap_or_default(),
            ),
            None => (String::new(), String::new(), String::new()),
        };
        table.add_row(vec![
            Cell::new(step_id),
            step_cell(step.status, step.skip_reason),
            Cell::new(attempts),
            Cell::new(time),
            Cell::new(detail),
        ]);
    }
    table
}

/// Plan as JSON: order, batches, and every step's full set of upstream steps.
pub fn plan_json(plan: &ExecutionPlan, steps: &[WorkflowStep]) -> Value {
    let batches: Vec<_> = plan
        .batches
        .iter()
        .map(|batch| match batch {
            Batch::Single(step) => serde_json::json!({ "step": step }),
            Batch::ParallelGroup { index, steps } => {
                serde_json::json!({ "group": index, "steps": steps })
            }
        })
        .collect();
    let requires: serde_json::Map<String, Value> = plan
        .order
        .iter()
        .map(|id| (id.clone(), serde_json::json!(transitive_dependencies(id, steps))))
        .collect();
    serde_json::json!({ "order": plan.order, "batches": batches, "requires": requires })
}

fn requires_label(step_id: &str, steps: &[WorkflowStep]) -> String {
    let upstream = transitive_dependencies(step_id, steps);
    if upstream.is_empty() {
        String::new()
    } else {
        style(format!("  (after {})", upstream.join(", "))).dim().to_string()
    }
}

/// Validated plan for `run --dry-run`.
pub fn print_plan(plan: &ExecutionPlan, steps: &[WorkflowStep], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&plan_json(plan, steps))?);
        return Ok(());
    }

    println!();
    println!("  {} Plan is valid ({} steps)", style("✓").green(), plan.order.len());
    println!();
    for (i, batch) in plan.batches.iter().enumerate() {
        match batch {
            Batch::Single(step) => {
                println!("  {:>3}. {step}{}", i + 1, requires_label(step, steps))
            }
            Batch::ParallelGroup { index, steps: group } => {
                println!("  {:>3}. {}", i + 1, style(format!("[group {index}]")).magenta());
                for step in group {
                    println!("       - {step}{}", requires_label(step, steps));
                }
            }
        }
    }
    println!();
    Ok(())
}

/// Summary after `run` / `resume`.
pub fn print_outcome(result: &WorkflowResult, state: Option<&WorkflowState>, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    println!();
    println!(
        "  Run {} {} in {}",
        style(&result.run_id).cyan(),
        styled_status(result.status),
        format_duration(result.execution_time_ms)
    );
    if let Some(error) = &result.error {
        println!("  {} {}", style("error:").red(), error);
    }
    if let Some(stats) = result.parallel_stats.as_ref().filter(|s| s.groups > 0) {
        println!(
            "  {}",
            style(format!(
                "{} parallel group(s), {} parallel step(s), peak concurrency {}",
                stats.groups, stats.parallel_steps, stats.max_observed_concurrency
            ))
            .dim()
        );
    }
    if let Some(state) = state {
        println!();
        println!("{}", steps_table(state));
    }
    println!();
    Ok(())
}

pub fn print_state(state: &WorkflowState, logs: bool) {
    let meta = &state.execution_metadata;
    println!();
    println!(
        "  {} {}",
        style(&state.workflow_name).cyan().bold(),
        style(format!("({})", state.workflow_id)).dim()
    );
    println!("  Status:   {}", styled_status(state.status));
    if let Some(version) = &meta.workflow_version {
        println!("  Version:  {version}");
    }
    println!("  Created:  {}", meta.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Updated:  {}", meta.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(done) = meta.completed_at {
        println!("  Finished: {}", done.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if state.resume_count > 0 {
        println!("  Resumed:  {} time(s)", state.resume_count);
    }
    if let Some(error) = &meta.error {
        println!("  {} {}", style("Error:").red(), error);
    }
    if let Some(interruption) = &meta.interruption {
        println!(
            "  {} {} at {}",
            style("Interrupted:").yellow(),
            interruption.reason,
            interruption.at.format("%H:%M:%S")
        );
        if !interruption.interrupted_steps.is_empty() {
            println!("    steps: {}", interruption.interrupted_steps.join(", "));
        }
    }
    if state.can_resume() && state.status != WorkflowStatus::Running {
        println!(
            "  Resume with: {}",
            style(format!("conductor resume {} <file>", state.workflow_id)).dim()
        );
    }
    println!();
    println!("{}", steps_table(state));

    if logs {
        let entries = state.context.as_ref().map(|c| c.logs.as_slice()).unwrap_or_default();
        println!();
        println!("  {}", style("── Log ──").dim());
        if entries.is_empty() {
            println!("  (empty)");
        }
        for entry in entries {
            let level = match entry.level {
                LogLevel::Debug => style("DEBUG").dim(),
                LogLevel::Info => style("INFO ").green(),
                LogLevel::Warn => style("WARN ").yellow(),
                LogLevel::Error => style("ERROR").red(),
            };
            let step = entry
                .step_id
                .as_deref()
                .map(|s| format!("[{s}] "))
                .unwrap_or_default();
            println!(
                "  {} {level} {step}{}",
                style(entry.timestamp.format("%H:%M:%S%.3f")).dim(),
                entry.message
            );
        }
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(340), "340ms");
        assert_eq!(format_duration(1_340), "1.3s");
        assert_eq!(format_duration(125_000), "2m 05s");
    }

    #[test]
    fn test_truncate_first_line() {
        assert_eq!(truncate("short\nsecond", 10), "short");
        assert_eq!(truncate("abcdefghijkl", 5), "abcd…");
    }

    #[test]
    fn test_plan_json_lists_upstream_steps() {
        let steps: Vec<WorkflowStep> = serde_json::from_value(serde_json::json!([
            { "id": "fetch", "type": "script" },
            { "id": "build", "type": "script", "dependsOn": ["fetch"] },
            { "id": "test", "type": "script", "dependsOn": ["build"] },
            { "id": "lint", "type": "script" }
        ]))
        .unwrap();
        let plan = conductor_core::workflow::dag::resolve(&steps).unwrap();

        let out = plan_json(&plan, &steps);
        assert_eq!(out["requires"]["test"], serde_json::json!(["fetch", "build"]));
        assert_eq!(out["requires"]["lint"], serde_json::json!([]));
        assert_eq!(out["order"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_steps_table_lists_every_step() {
        let mut state = WorkflowState::new("r", "flow", vec!["a".into(), "b".into()]);
        state.step_states.get_mut("b").unwrap().status = StepStatus::Skipped;
        state.step_states.get_mut("b").unwrap().skip_reason = Some(SkipReason::Condition);
        let rendered = steps_table(&state).to_string();
        assert!(rendered.contains("pending"));
        assert!(rendered.contains("skipped (condition)"));
    }
}
