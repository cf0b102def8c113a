//! `tether serve`: run the engine in the foreground.

use anyhow::Result;
use console::style;
use tether_types::event::RunEvent;
use tokio::sync::broadcast::error::RecvError;

use super::short_id;
use crate::state::AppState;

pub async fn serve(state: &AppState, json: bool, quiet: bool) -> Result<()> {
    let mut events = state.engine.subscribe();
    state.engine.start().await?;

    if !json && !quiet {
        println!();
        println!(
            "  {} Tether engine running with {} jobs ({})",
            style("⚡").bold(),
            state.engine.registry().len(),
            style(state.data_dir.display()).cyan()
        );
        println!("  {}", style("Press Ctrl+C to stop").dim());
        println!();
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            received = events.recv() => match received {
                Ok(event) => {
                    if json {
                        println!("{}", serde_json::to_string(&event)?);
                    } else if !quiet {
                        print_event(&event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event printer lagged behind");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    state.engine.shutdown().await;
    if !json && !quiet {
        println!("\n  Engine stopped.");
    }
    Ok(())
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::RunStarted { run_id, job_id, trigger } => println!(
            "  {} {} {} started ({trigger})",
            style("▶").cyan(),
            short_id(run_id),
            style(job_id).cyan()
        ),
        RunEvent::RunWaiting { run_id, step_key, .. } => println!(
            "  {} {} waiting on '{step_key}'",
            style("…").yellow(),
            short_id(run_id)
        ),
        RunEvent::StepCompleted { run_id, step_key, kind } => println!(
            "    {} {} {step_key} ({})",
            style("✓").green(),
            short_id(run_id),
            kind.as_str()
        ),
        RunEvent::StepFailed { run_id, step_key, error, will_retry } => println!(
            "    {} {} {step_key}: {}{}",
            style("✗").red(),
            short_id(run_id),
            error.message,
            if *will_retry { " (retrying)" } else { "" }
        ),
        RunEvent::StatusUpdated { run_id, key, version } => println!(
            "    {} {} status '{key}' v{version}",
            style("•").dim(),
            short_id(run_id)
        ),
        RunEvent::RunSucceeded { run_id, job_id, .. } => println!(
            "  {} {} {} completed",
            style("✓").green().bold(),
            short_id(run_id),
            style(job_id).cyan()
        ),
        RunEvent::RunFailed { run_id, job_id, error } => println!(
            "  {} {} {} failed: {}",
            style("✗").red().bold(),
            short_id(run_id),
            style(job_id).cyan(),
            error.message
        ),
    }
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
