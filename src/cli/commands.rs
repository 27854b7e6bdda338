//! CLI command definitions for fleet-forge.
//!
//! All runtime settings come from the environment (see `OrchestratorConfig`);
//! the command line only selects what to run.

use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::OrchestratorConfig;
use crate::orchestrator::{cancel_on_ctrl_c, Orchestrator, QueueDepth};

/// Worker fleet orchestrator.
#[derive(Parser)]
#[command(name = "fleet-forge")]
#[command(about = "Coordinate a fleet of queue-driven workers")]
#[command(version)]
#[command(
    long_about = "fleet-forge consumes worker completions, lands their files through a test-gated git pipeline, keeps the worker pool healthy and sized to the intake queue, and routes notifications.\n\nConfiguration is read from environment variables (BROKER_HOST, MIN_WORKERS, TEST_GATE_ENABLED, ...).\n\nExample usage:\n  BROKER_HOST=localhost REPO_PATH=/srv/work fleet-forge run"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the completion coordinator and the health controller together.
    Run,

    /// Run only the completion coordinator.
    Coordinator,

    /// Run only the health and scaling controller.
    Controller,

    /// Print the depth of every fleet queue.
    Stats(StatsArgs),

    /// Show dead-lettered messages without removing them.
    #[command(name = "dead-letter", alias = "dlq")]
    DeadLetter(DeadLetterArgs),
}

/// Arguments for `fleet-forge stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `fleet-forge dead-letter`.
#[derive(Parser, Debug)]
pub struct DeadLetterArgs {
    /// Maximum number of messages to show.
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: usize,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct StatsOutput {
    broker: String,
    queues: Vec<QueueDepth>,
}

/// Parse CLI arguments without executing.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = OrchestratorConfig::from_env()?;
    info!(broker = %config.broker_url(), repo = %config.repo_path.display(), "Loaded configuration");
    let orchestrator = Orchestrator::connect(config).await?;

    match cli.command {
        Commands::Run => {
            let cancel = CancellationToken::new();
            let _signal = cancel_on_ctrl_c(cancel.clone());
            orchestrator.run(cancel).await?;
        }
        Commands::Coordinator => {
            let cancel = CancellationToken::new();
            let _signal = cancel_on_ctrl_c(cancel.clone());
            orchestrator.run_coordinator(cancel).await?;
        }
        Commands::Controller => {
            let cancel = CancellationToken::new();
            let _signal = cancel_on_ctrl_c(cancel.clone());
            orchestrator.run_controller(cancel).await?;
        }
        Commands::Stats(args) => run_stats_command(&orchestrator, args).await?,
        Commands::DeadLetter(args) => run_dead_letter_command(&orchestrator, args).await?,
    }
    Ok(())
}

async fn run_stats_command(orchestrator: &Orchestrator, args: StatsArgs) -> anyhow::Result<()> {
    let queues = orchestrator.queue_depths().await?;

    if args.json {
        let output = StatsOutput {
            broker: orchestrator.config().broker_url(),
            queues,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Broker: {}", orchestrator.config().broker_url());
    for entry in &queues {
        println!("  {:<18} {:>8}", entry.queue, entry.depth);
    }
    Ok(())
}

async fn run_dead_letter_command(
    orchestrator: &Orchestrator,
    args: DeadLetterArgs,
) -> anyhow::Result<()> {
    let payloads = orchestrator.dead_letters(args.limit).await?;

    if args.json {
        let values: Vec<serde_json::Value> = payloads
            .iter()
            .map(|p| {
                serde_json::from_str(p).unwrap_or_else(|_| serde_json::Value::String(p.clone()))
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&values)?);
        return Ok(());
    }

    if payloads.is_empty() {
        println!("Dead-letter queue is empty");
        return Ok(());
    }

    for (index, payload) in payloads.iter().enumerate() {
        match serde_json::from_str::<serde_json::Value>(payload) {
            Ok(value) => {
                let task_id = value.get("task_id").and_then(|v| v.as_str()).unwrap_or("-");
                let retries = value.get("retry_count").and_then(|v| v.as_u64()).unwrap_or(0);
                let error = value.get("last_error").and_then(|v| v.as_str()).unwrap_or("-");
                println!("{:>3}. task={} retries={} error={}", index + 1, task_id, retries, error);
            }
            Err(_) => println!("{:>3}. (raw) {}", index + 1, payload),
        }
    }
    Ok(())
}
