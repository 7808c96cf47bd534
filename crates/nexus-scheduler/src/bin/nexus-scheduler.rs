//! Main binary for the nexus scheduler

use clap::Parser;
use nexus_core::ModelDatabase;
use nexus_scheduler::{Scheduler, SchedulerConfig, SchedulerServer};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "nexus-scheduler")]
#[command(about = "Central scheduler for the nexus serving fabric")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Port for the control RPC service
    #[arg(long)]
    port: Option<u16>,

    /// Beacon interval in seconds
    #[arg(long)]
    beacon: Option<u64>,

    /// Epoch scheduling interval in seconds
    #[arg(long)]
    epoch: Option<u64>,

    /// Enable epoch scheduling
    #[arg(long)]
    epoch_schedule: Option<bool>,

    /// Enable prefix batching
    #[arg(long)]
    prefix_batch: Option<bool>,

    /// Root directory of the model database
    #[arg(long, value_name = "DIR")]
    model_db: Option<PathBuf>,

    /// Static workload file (YAML list of per-backend session lists)
    #[arg(long, value_name = "FILE")]
    workload: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => SchedulerConfig::from_file(path)?,
        None => SchedulerConfig::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(beacon) = cli.beacon {
        config.beacon_interval_sec = beacon;
    }
    if let Some(epoch) = cli.epoch {
        config.epoch_interval_sec = epoch;
    }
    if let Some(epoch_schedule) = cli.epoch_schedule {
        config.epoch_schedule = epoch_schedule;
    }
    if let Some(prefix_batch) = cli.prefix_batch {
        config.prefix_batch = prefix_batch;
    }
    if let Some(model_db) = cli.model_db {
        config.model_db_root = model_db;
    }
    if let Some(workload) = cli.workload {
        config.workload_file = Some(workload);
    }
    if !cli.log_level.is_empty() {
        config.log_level = cli.log_level.clone();
    }
    config.validate()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        port = config.port,
        beacon = config.beacon_interval_sec,
        epoch = config.epoch_interval_sec,
        "Starting nexus scheduler"
    );

    let model_db = ModelDatabase::from_root(&config.model_db_root)?;
    let workloads = config.load_workloads()?;
    if !workloads.is_empty() {
        info!(slots = workloads.len(), "Loaded static workloads");
    }

    let scheduler = Scheduler::new(&config, model_db, workloads);
    let server = SchedulerServer::new(scheduler, config.port);
    server.run().await
}
