use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ranksync::config::Config;
use ranksync::workflow::WorkflowKind;

mod commands;

#[derive(Parser)]
#[command(
    name = "ranksync",
    version,
    about = "Resumable, rate-limit aware leaderboard synchronization",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML); environment variables are used when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides the configuration
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// Write Prometheus metrics to this file when the command finishes
    #[arg(long, global = true)]
    metrics_out: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync rankings, reports and builds for season × region × dungeon
    Sync {
        /// Plan file listing seasons, regions and dungeons
        #[arg(short, long)]
        plan: PathBuf,
    },

    /// Run equipment, talent and stat analysis for spec × dungeon
    Analyze {
        /// Plan file listing specs and dungeons
        #[arg(short, long)]
        plan: PathBuf,
    },

    /// Resume a rate-limited or failed run from its checkpoint
    Resume {
        /// Run identifier
        run_id: String,
    },

    /// Show persisted workflow runs
    Status {
        /// Show a single run in detail
        #[arg(short, long)]
        run: Option<String>,

        /// Delete checkpoints of completed runs
        #[arg(long, default_value = "false")]
        prune: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;

    // Initialize tracing/logging
    let format = cli.log_format.as_deref().unwrap_or(&config.logging.format);
    setup_tracing(format, &config.logging.level, cli.verbose)?;

    if let Err(e) = ranksync::metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics initialization failed");
    }

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    tracing::info!("ranksync starting");

    let result = match cli.command {
        Commands::Sync { plan } => {
            tracing::info!(plan = %plan.display(), "Starting sync command");
            commands::start(&config, WorkflowKind::LeaderboardSync, &plan, cancel).await
        }

        Commands::Analyze { plan } => {
            tracing::info!(plan = %plan.display(), "Starting analyze command");
            commands::start(&config, WorkflowKind::SpecAnalysis, &plan, cancel).await
        }

        Commands::Resume { run_id } => {
            tracing::info!(run_id = %run_id, "Starting resume command");
            commands::resume(&config, &run_id, cancel).await
        }

        Commands::Status { run, prune } => commands::status(&config, run.as_deref(), prune),
    };

    if let Some(path) = cli.metrics_out {
        write_metrics(&path)?;
    }

    result?;
    tracing::info!("ranksync completed successfully");
    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("ranksync=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("ranksync={level},warn")))
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

/// Cancel in-flight work on Ctrl-C; persisted progress is kept
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            cancel.cancel();
        }
    });
}

fn write_metrics(path: &std::path::Path) -> Result<()> {
    let text = ranksync::metrics::encode_metrics()
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {e}"))?;
    std::fs::write(path, text)
        .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
    Ok(())
}
