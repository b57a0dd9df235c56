//! Persisted run management: `states`, `show`, `delete`, `cleanup`.

use std::time::Duration;

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use conductor_core::state::StateStore;
use conductor_types::state::WorkflowState;

use super::render::{format_duration, print_state, status_color};
use crate::state::AppState;

/// Load every run that still parses. Unreadable documents are skipped.
async fn load_all(store: &impl StateStore) -> Result<Vec<WorkflowState>> {
    let ids = store.list().await.context("failed to list runs")?;
    let mut states = Vec::with_capacity(ids.len());
    for id in ids {
        match store.load(&id).await {
            Ok(Some(state)) => states.push(state),
            Ok(None) => tracing::warn!(run_id = id.as_str(), "skipping unreadable run state"),
            Err(e) => tracing::warn!(run_id = id.as_str(), error = %e, "failed to load run state"),
        }
    }
    states.sort_by(|a, b| {
        b.execution_metadata
            .updated_at
            .cmp(&a.execution_metadata.updated_at)
    });
    Ok(states)
}

pub async fn list_states(state: &AppState, json: bool) -> Result<()> {
    let states = load_all(state.engine.store()).await?;

    if json {
        let out: Vec<_> = states
            .iter()
            .map(|s| {
                serde_json::json!({
                    "run_id": s.workflow_id,
                    "workflow": s.workflow_name,
                    "status": s.status.to_string(),
                    "completed_steps": s.completed_steps().len(),
                    "total_steps": s.execution_order.len(),
                    "resumable": s.can_resume(),
                    "updated_at": s.execution_metadata.updated_at.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if states.is_empty() {
        println!();
        println!("  No runs recorded in {}.", state.state_dir.display());
        println!("  Start one with: {}", style("conductor run <workflow.yaml>").dim());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Steps"),
            Cell::new("Duration"),
            Cell::new("Updated"),
        ]);

    for s in &states {
        let meta = &s.execution_metadata;
        let duration = match (meta.started_at, meta.completed_at) {
            (Some(start), Some(end)) => {
                format_duration((end - start).num_milliseconds().max(0) as u64)
            }
            _ => "-".to_string(),
        };
        table.add_row(vec![
            Cell::new(&s.workflow_id),
            Cell::new(&s.workflow_name),
            Cell::new(s.status.to_string()).fg(status_color(s.status)),
            Cell::new(format!("{}/{}", s.completed_steps().len(), s.execution_order.len())),
            Cell::new(duration),
            Cell::new(meta.updated_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

pub async fn show_state(state: &AppState, run_id: &str, logs: bool, json: bool) -> Result<()> {
    let saved = state
        .engine
        .store()
        .load(run_id)
        .await
        .with_context(|| format!("failed to load run '{run_id}'"))?
        .ok_or_else(|| anyhow::anyhow!("Run '{run_id}' not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&saved)?);
    } else {
        print_state(&saved, logs);
    }
    Ok(())
}

pub async fn delete_state(state: &AppState, run_id: &str, json: bool) -> Result<()> {
    let deleted = state
        .engine
        .store()
        .delete(run_id)
        .await
        .with_context(|| format!("failed to delete run '{run_id}'"))?;
    if !deleted {
        anyhow::bail!("Run '{run_id}' not found");
    }

    if json {
        println!("{}", serde_json::json!({ "run_id": run_id, "deleted": true }));
    } else {
        println!();
        println!("  {} Deleted run '{}'", style("✓").green(), style(run_id).cyan());
        println!();
    }
    Ok(())
}

pub async fn cleanup_states(state: &AppState, max_age_secs: Option<u64>, json: bool) -> Result<()> {
    let max_age = max_age_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_millis(state.config.max_state_age_ms));
    let removed = state
        .engine
        .store()
        .cleanup(max_age)
        .await
        .context("failed to clean up run states")?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "removed": removed, "max_age_secs": max_age.as_secs() })
        );
    } else {
        println!();
        println!(
            "  {} Removed {} run(s) older than {}",
            style("✓").green(),
            style(removed).bold(),
            format_duration(max_age.as_millis() as u64)
        );
        println!();
    }
    Ok(())
}
