//! Ember - real-time download telemetry collector
//!
//! Once a minute, pulls that minute's raw download counters from the remote
//! store, folds them into a running total, a 60-minute history window, and a
//! continent/country/region/city tree, writes dashboard JSON snapshots, and
//! checkpoints state so a restart replays exactly the missed minutes.

mod aggregate;
mod checkpoint;
mod cleanup;
mod collect;
mod config;
mod geo;
mod minute;
mod scheduler;
mod shell;
mod snapshot;
mod store;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "ember", about = "Real-time download telemetry collector")]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the collection loop forever
    CollectLoop,
    /// Drop snapshot directories older than the retention window
    Cleanup,
    /// Inspect the checkpointed state
    Shell,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    // Initialize logging based on LOG_FORMAT env var
    // Use LOG_FORMAT=gcp for structured GCP Cloud Logging
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(tracing_subscriber::filter::LevelFilter::INFO)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .init();
    }

    let cli = Cli::parse();

    let config = config::Config::load(&cli.config)?;
    info!("Configuration loaded");

    match cli.command {
        Commands::CollectLoop => collect_loop(&config).await,
        Commands::Cleanup => cleanup::run(&config.paths.json_root, config.collector.retention_days),
        Commands::Shell => shell::run(&config),
    }
}

async fn collect_loop(config: &config::Config) -> Result<()> {
    info!("Starting Ember collector...");

    let continents = geo::ContinentMap::load(&config.paths.continents)?;
    let aggregator = aggregate::Aggregator::new(continents);

    let store = store::StoreClient::new(&config.store);
    let snapshots = snapshot::SnapshotWriter::new(
        config.paths.json_root.clone(),
        config.collector.interval_secs,
    );
    let checkpoints = checkpoint::CheckpointStore::new(config.paths.checkpoint.clone());

    let mut engine = collect::Engine::new(
        store,
        aggregator,
        snapshots,
        checkpoints,
        config.product.clone(),
    );
    scheduler::run(&mut engine, &config.collector).await
}
