#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Command-line entry point for the traffic-violation cascade pipeline.
//!
//! **Commands:**
//!   run      Ingest a video and run it through the full cascade
//!   status   Show a run's current state and metrics
//!   export   Transition a ready-for-review run to exported

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use cascade_core::runtime::{Runtime, RuntimePaths};

#[derive(Parser)]
#[command(name = "cascade")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run and inspect traffic-violation cascade pipelines", long_about = None)]
struct Cli {
    /// Root data directory holding `runs/` and `config/`.
    #[arg(long, env = "CASCADE_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Gemini API key. Without one, every run falls back to the
    /// deterministic local heuristics for both tiers.
    #[arg(long, env = "GEMINI_API_KEY")]
    gemini_api_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a video and run it through ingest, proposals, Flash/Pro, and merge.
    Run {
        /// Path to the source video file.
        video: PathBuf,
    },
    /// Print a run's current status record as JSON.
    Status {
        /// The run id returned by `run`.
        run_id: String,
    },
    /// Transition a run from `READY_FOR_REVIEW` to `EXPORTED`.
    Export {
        /// The run id returned by `run`.
        run_id: String,
    },
}

fn build_runtime(cli: &Cli) -> Runtime {
    let client = cli.gemini_api_key.clone().map_or_else(
        || Arc::new(cascade_core::model_client::UnavailableModelClient) as Arc<dyn cascade_core::model_client::ModelClient>,
        |key| Arc::new(cascade_modelclient::GeminiModelClient::new().with_api_key(key)) as Arc<dyn cascade_core::model_client::ModelClient>,
    );
    Runtime::new(RuntimePaths::under(&cli.data_dir), client)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let runtime = build_runtime(&cli);

    match cli.command {
        Commands::Run { video } => {
            let run_id = runtime
                .orchestrator
                .run(&video)
                .await
                .context("pipeline run failed")?;
            let record = runtime.store.get(&run_id)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Status { run_id } => {
            let record = runtime.store.get(&run_id)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Export { run_id } => {
            let record = runtime.orchestrator.export(&run_id)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clap_parses_known_subcommands() {
        let cli = Cli::try_parse_from(["cascade", "status", "run_abc"]).expect("parse status");
        assert!(matches!(cli.command, Commands::Status { .. }));

        let cli = Cli::try_parse_from(["cascade", "run", "clip.mp4"]).expect("parse run");
        assert!(matches!(cli.command, Commands::Run { .. }));
    }

    #[test]
    fn clap_enforces_required_args() {
        assert!(Cli::try_parse_from(["cascade", "status"]).is_err());
        assert!(Cli::try_parse_from(["cascade", "export"]).is_err());
    }

    #[test]
    fn data_dir_defaults_when_unset() {
        let cli = Cli::try_parse_from(["cascade", "status", "run_abc"]).expect("parse");
        assert_eq!(cli.data_dir, PathBuf::from("./data"));
    }
}
