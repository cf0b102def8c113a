//! CLI command definitions for the `tether` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod job;
pub mod run;
pub mod serve;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run and inspect durable jobs.
#[derive(Parser)]
#[command(name = "tether", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true, env = "TETHER_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the engine: recover unfinished runs, fire interval triggers and
    /// print lifecycle events until Ctrl+C.
    Serve,

    /// Send a named event and wait for the runs it starts.
    Event {
        /// Event name (e.g. `auto.yield.1`).
        name: String,

        /// JSON payload.
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Only record the runs; `tether serve` drives them later.
        #[arg(long)]
        detach: bool,
    },

    /// Invoke a job and wait for its result.
    Invoke {
        /// Job ID.
        job: String,

        /// JSON payload.
        #[arg(long, default_value = "{}")]
        payload: String,

        /// URL that receives a POST with the run's terminal result.
        #[arg(long)]
        callback_url: Option<String>,

        /// Only record the run; `tether serve` drives it later.
        #[arg(long)]
        detach: bool,
    },

    /// List recent runs.
    #[command(alias = "ls")]
    Runs {
        /// Filter by status (pending, running, waiting, completed, failed).
        #[arg(long)]
        status: Option<String>,

        /// Maximum number of runs to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show a run with its steps, statuses and child runs.
    Show {
        /// Run UUID.
        run_id: String,
    },

    /// List registered jobs.
    Jobs,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// First 8 characters of an ID, for table columns.
pub(crate) fn short_id(id: &uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Parse a `--payload` argument.
pub(crate) fn parse_payload(raw: &str) -> anyhow::Result<serde_json::Value> {
    use anyhow::Context;
    serde_json::from_str(raw).with_context(|| format!("Invalid JSON payload: {raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn invoke_parses_payload_and_flags() {
        let cli = Cli::try_parse_from([
            "tether",
            "invoke",
            "invoke-example-1",
            "--payload",
            r#"{"message":"hi"}"#,
            "--detach",
            "--json",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Invoke { job, payload, detach, callback_url } => {
                assert_eq!(job, "invoke-example-1");
                assert_eq!(parse_payload(&payload).unwrap()["message"], "hi");
                assert!(detach);
                assert!(callback_url.is_none());
            }
            _ => panic!("expected invoke"),
        }
    }

    #[test]
    fn invalid_payload_is_rejected() {
        assert!(parse_payload("{not json").is_err());
    }

    #[test]
    fn short_id_takes_prefix() {
        let id = uuid::Uuid::parse_str("0192a1b2-c3d4-7e5f-8a9b-0c1d2e3f4a5b").unwrap();
        assert_eq!(short_id(&id), "0192a1b2");
    }
}
