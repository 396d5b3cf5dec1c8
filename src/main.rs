// ABOUTME: CLI entry point for feedback-sync
// ABOUTME: Parses commands, loads configuration and routes to the sync daemon

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use feedback_sync::config::{ConfigOverrides, SyncConfig};
use feedback_sync::sync::{self, SyncDaemon};
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_PATH: &str = "feedback-sync.toml";

#[derive(Parser)]
#[command(name = "feedback-sync")]
#[command(about = "Incremental replication of Query API feedback records into SQLite", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the TOML config file (default: ./feedback-sync.toml if present)
    #[arg(long, global = true, env = "FEEDBACK_SYNC_CONFIG")]
    config: Option<PathBuf>,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(flatten)]
    overrides: OverrideArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct OverrideArgs {
    /// Query API GraphQL endpoint
    #[arg(long, global = true)]
    url: Option<String>,
    /// SQLite database holding replicated records
    #[arg(long, global = true)]
    database: Option<PathBuf>,
    /// JSON-lines file every consumed record is appended to
    #[arg(long = "record-log", global = true)]
    record_log: Option<PathBuf>,
    /// Bearer token for the Query API
    #[arg(long, global = true, env = "FEEDBACK_SYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Replicate new records on a fixed interval until Ctrl+C
    Run {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
        /// Milliseconds between cycles
        #[arg(long = "interval-ms")]
        interval_ms: Option<u64>,
    },
    /// Show the current watermark and record count
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the GraphQL request the next cycle would send, without sending it
    Query,
}

fn load_config(path: Option<&Path>, overrides: ConfigOverrides) -> anyhow::Result<SyncConfig> {
    let mut config = match path {
        Some(path) => SyncConfig::load(path)?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => SyncConfig::load(DEFAULT_CONFIG_PATH)?,
        None => {
            tracing::debug!("No config file found, using defaults and command-line values");
            SyncConfig::default()
        }
    };
    config.apply_overrides(overrides);
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let interval_ms = match &cli.command {
        Commands::Run { interval_ms, .. } => *interval_ms,
        _ => None,
    };
    let overrides = ConfigOverrides {
        url: cli.overrides.url.clone(),
        database: cli.overrides.database.clone(),
        record_log: cli.overrides.record_log.clone(),
        interval_ms,
        bearer_token: cli.overrides.token.clone(),
    };
    let config = load_config(cli.config.as_deref(), overrides)?;

    match cli.command {
        Commands::Run { once, .. } => run(config, once).await,
        Commands::Status { json } => {
            let status = sync::read_status(&config)?;

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&status).context("Failed to render status")?
                );
                return Ok(());
            }

            println!("Database:   {}", status.database.display());
            println!("Record log: {}", status.record_log.display());
            println!("Records:    {}", status.records);
            match status.watermark {
                Some(watermark) => println!("Watermark:  {}", watermark),
                None => println!("Watermark:  none (next cycle starts from the default start)"),
            }
            Ok(())
        }
        Commands::Query => {
            let request = sync::preview_request(&config)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&request).context("Failed to render request")?
            );
            Ok(())
        }
    }
}

async fn run(config: SyncConfig, once: bool) -> anyhow::Result<()> {
    let interval = config.interval();
    let daemon = SyncDaemon::from_config(config)?;

    if once {
        let stats = daemon.run_once().await?;

        println!();
        println!("========================================");
        println!("Sync cycle complete");
        println!("========================================");
        println!("  Pages fetched: {}", stats.pages);
        println!("  Records persisted: {}", stats.records_persisted);
        if stats.records_skipped > 0 {
            println!("  Records skipped: {}", stats.records_skipped);
        }
        if let Some(watermark) = &stats.final_watermark {
            println!("  Watermark: {}", watermark);
        }
        if stats.stalled {
            println!("  STALLED: a full page held only malformed records");
            anyhow::bail!("Sync is stalled on malformed records");
        }
        return Ok(());
    }

    tracing::info!("Starting continuous sync daemon...");
    println!();
    println!("========================================");
    println!("Starting feedback sync");
    println!("========================================");
    println!("  Sync interval: {:?}", interval);
    println!("  Press Ctrl+C to stop");
    println!();

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Received shutdown signal");
        let _ = shutdown_tx_clone.send(());
    });

    daemon.run(shutdown_rx).await
}
