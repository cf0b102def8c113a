//! Tether CLI entry point.
//!
//! Binary name: `tether`
//!
//! Parses CLI arguments, opens the checkpoint database, registers the demo
//! jobs, then dispatches to the command handler.

mod cli;
mod jobs;
mod state;

use clap::Parser;
use clap_complete::generate;
use tether_observe::{TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let mut options = TracingOptions::from_verbosity(cli.verbose);
    if cli.quiet && cli.verbose == 0 {
        options.default_filter = "error".to_string();
    }
    options.enable_otel = cli.otel;
    init_tracing(&options).map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "tether", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init().await?;
    let result = dispatch(cli, &state).await;

    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli, state: &AppState) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve => cli::serve::serve(state, cli.json, cli.quiet).await,

        Commands::Event { name, payload, detach } => {
            cli::run::send_event(state, &name, &payload, detach, cli.json).await
        }

        Commands::Invoke {
            job,
            payload,
            callback_url,
            detach,
        } => cli::run::invoke(state, &job, &payload, callback_url, detach, cli.json).await,

        Commands::Runs { status, limit } => {
            cli::run::list_runs(state, status.as_deref(), limit, cli.json).await
        }

        Commands::Show { run_id } => cli::run::show_run(state, &run_id, cli.json).await,

        Commands::Jobs => cli::job::list_jobs(state, cli.json).await,

        Commands::Completions { .. } => Ok(()),
    }
}
