//! Run subcommands: send events, invoke jobs, list and inspect runs.

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use tether_core::engine::RunHandle;
use tether_types::invocation::{InvocationResult, InvokeOptions};
use tether_types::run::{RunRecord, RunStatus};
use tether_types::step::StepState;

use super::{parse_payload, short_id};
use crate::state::AppState;

fn status_cell(status: RunStatus) -> Cell {
    let color = match status {
        RunStatus::Completed => Color::Green,
        RunStatus::Failed => Color::Red,
        RunStatus::Waiting => Color::Yellow,
        RunStatus::Running => Color::Blue,
        RunStatus::Pending => Color::DarkGrey,
    };
    Cell::new(status.as_str()).fg(color)
}

// ---------------------------------------------------------------------------
// Event / Invoke
// ---------------------------------------------------------------------------

pub async fn send_event(state: &AppState, name: &str, payload: &str, detach: bool, json: bool) -> Result<()> {
    let payload = parse_payload(payload)?;
    if !detach {
        state.engine.start().await?;
    }

    let handles = state
        .engine
        .send_event(name, payload)
        .await
        .with_context(|| format!("Failed to send event '{name}'"))?;

    if handles.is_empty() && !json {
        println!();
        println!("  No enabled job listens for '{}'.", style(name).cyan());
        println!();
    }

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(finish(state, handle, detach, json).await?);
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    }

    if !detach {
        state.engine.shutdown().await;
    }
    Ok(())
}

pub async fn invoke(
    state: &AppState,
    job: &str,
    payload: &str,
    callback_url: Option<String>,
    detach: bool,
    json: bool,
) -> Result<()> {
    let payload = parse_payload(payload)?;
    if !detach {
        state.engine.start().await?;
    }

    let options = InvokeOptions { callback_url };
    let handle = state
        .engine
        .invoke(job, payload, options)
        .await
        .with_context(|| format!("Failed to invoke job '{job}'"))?;

    let result = finish(state, handle, detach, json).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    if !detach {
        state.engine.shutdown().await;
    }
    Ok(())
}

/// Wait for `handle` unless detached; print the outcome in styled mode.
async fn finish(
    state: &AppState,
    handle: RunHandle,
    detach: bool,
    json: bool,
) -> Result<serde_json::Value> {
    let run_id = handle.run_id;
    let job_id = handle.job_id.clone();

    if detach {
        if !json {
            println!();
            println!(
                "  {} Recorded run of '{}'",
                style("*").green().bold(),
                style(&job_id).cyan()
            );
            println!("  Run ID: {run_id}");
            println!("  Start the engine with: {}", style("tether serve").dim());
            println!();
        }
        return Ok(serde_json::json!({
            "run_id": run_id.to_string(),
            "job_id": job_id,
            "status": RunStatus::Pending.as_str(),
        }));
    }

    let result: InvocationResult = handle.wait_for_completion().await?;
    if !json {
        print_result(&job_id, &result);
        let steps = state.engine.list_steps(run_id).await?;
        println!("  Steps: {}", steps.len());
        println!("  Details: {}", style(format!("tether show {run_id}")).dim());
        println!();
    }
    Ok(serde_json::to_value(result)?)
}

fn print_result(job_id: &str, result: &InvocationResult) {
    println!();
    if result.ok {
        println!(
            "  {} Run of '{}' completed",
            style("✓").green().bold(),
            style(job_id).cyan()
        );
    } else {
        println!(
            "  {} Run of '{}' failed",
            style("✗").red().bold(),
            style(job_id).cyan()
        );
    }
    println!("  Run ID: {}", result.id);
    if let Some(output) = &result.output {
        println!("  Output: {output}");
    }
    if let Some(error) = &result.error {
        println!("  Error: {}", style(format!("{}: {}", error.name, error.message)).red());
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

pub async fn list_runs(state: &AppState, status: Option<&str>, limit: u32, json: bool) -> Result<()> {
    let status = status
        .map(|s| s.parse::<RunStatus>().map_err(anyhow::Error::msg))
        .transpose()?;
    let runs = state.engine.list_runs(status, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No runs recorded.");
        println!("  Start one with: {}", style("tether invoke <job>").dim());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run").fg(Color::Cyan),
            Cell::new("Job"),
            Cell::new("Trigger"),
            Cell::new("Status"),
            Cell::new("Steps"),
            Cell::new("Waiting on"),
            Cell::new("Created"),
        ]);

    for r in &runs {
        table.add_row(vec![
            Cell::new(short_id(&r.id)),
            Cell::new(&r.job_id),
            Cell::new(r.trigger.as_str()),
            status_cell(r.status),
            Cell::new(r.cursor.resolved_steps),
            Cell::new(r.cursor.waiting_on.as_deref().unwrap_or("-")),
            Cell::new(r.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

pub async fn show_run(state: &AppState, run_id: &str, json: bool) -> Result<()> {
    let run_id: uuid::Uuid = run_id
        .parse()
        .with_context(|| format!("Invalid run ID: {run_id}"))?;
    let run = state
        .engine
        .get_run(run_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Run '{run_id}' not found"))?;
    let steps = state.engine.list_steps(run_id).await?;
    let statuses = state.engine.list_statuses(run_id).await?;
    let children = state.engine.list_child_runs(run_id).await?;

    if json {
        let out = serde_json::json!({
            "run": run,
            "steps": steps,
            "statuses": statuses,
            "children": children,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    print_run_header(&run);

    if !steps.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("#").fg(Color::Cyan),
                Cell::new("Step"),
                Cell::new("Kind"),
                Cell::new("State"),
                Cell::new("Attempts"),
                Cell::new("Result"),
            ]);
        for s in &steps {
            let state_cell = match s.state {
                StepState::Completed => Cell::new(s.state.as_str()).fg(Color::Green),
                StepState::Failed => Cell::new(s.state.as_str()).fg(Color::Red),
                StepState::Pending | StepState::Ready => Cell::new(s.state.as_str()).fg(Color::Yellow),
            };
            let result = match (&s.output, &s.error) {
                (_, Some(error)) => format!("{}: {}", error.name, error.message),
                (Some(output), None) => truncate(&output.to_string(), 60),
                (None, None) if !s.children.is_empty() => {
                    let done = s.child_results.iter().filter(|r| r.is_some()).count();
                    format!("{done}/{} children", s.children.len())
                }
                (None, None) => "-".to_string(),
            };
            table.add_row(vec![
                Cell::new(s.seq),
                Cell::new(&s.step_key),
                Cell::new(s.kind.as_str()),
                state_cell,
                Cell::new(s.attempt),
                Cell::new(result),
            ]);
        }
        println!("  {}", style("Steps").bold());
        println!("{table}");
        println!();
    }

    if !statuses.is_empty() {
        println!("  {}", style("Statuses").bold());
        for s in &statuses {
            println!(
                "    {} {} [{}] v{}",
                style(&s.key).cyan(),
                s.label.as_deref().unwrap_or(""),
                s.state.as_ref().map(|st| st.as_str()).unwrap_or("-"),
                s.version
            );
        }
        println!();
    }

    if !children.is_empty() {
        println!("  {}", style("Child runs").bold());
        for c in &children {
            println!("    {} {} {}", short_id(&c.id), c.job_id, c.status);
        }
        println!();
    }

    Ok(())
}

fn print_run_header(run: &RunRecord) {
    println!();
    println!(
        "  {} {} ({})",
        style("Run").bold(),
        style(run.id).cyan(),
        run.job_id
    );
    println!("  Status:   {}", run.status);
    println!("  Trigger:  {}", run.trigger);
    println!("  Payload:  {}", run.payload);
    if let Some(parent) = &run.parent {
        println!("  Parent:   {} (step '{}')", parent.run_id, parent.step_key);
    }
    if let Some(waiting_on) = &run.cursor.waiting_on {
        println!("  Waiting:  {}", style(waiting_on).yellow());
    }
    if let Some(output) = &run.output {
        println!("  Output:   {output}");
    }
    if let Some(error) = &run.error {
        println!("  Error:    {}", style(format!("{}: {}", error.name, error.message)).red());
    }
    println!("  Created:  {}", run.created_at.to_rfc3339());
    if let Some(done) = run.completed_at {
        println!("  Finished: {}", done.to_rfc3339());
    }
    println!();
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééééééééé", 6), "ééé...");
    }
}
