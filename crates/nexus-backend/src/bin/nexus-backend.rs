//! Main binary for a nexus backend node

use clap::Parser;
use nexus_backend::config::parse_cores;
use nexus_backend::{BackendConfig, BackendServer, MockFramework};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "nexus-backend")]
#[command(about = "GPU backend node for the nexus serving fabric")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Port serving inference queries
    #[arg(long)]
    port: Option<u16>,

    /// Port serving control pushes
    #[arg(long)]
    rpc_port: Option<u16>,

    /// Scheduler address (default port 10001 if unspecified)
    #[arg(long)]
    sch_addr: Option<String>,

    /// GPU device index
    #[arg(long)]
    gpu: Option<u32>,

    /// Number of worker threads
    #[arg(long)]
    num_workers: Option<usize>,

    /// Cores to run workers on, e.g. "0-3,5"
    #[arg(long)]
    cores: Option<String>,

    /// Available GPU memory in megabytes
    #[arg(long)]
    gpu_memory: Option<u64>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => BackendConfig::from_file(path)?,
        None => BackendConfig::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(rpc_port) = cli.rpc_port {
        config.rpc_port = rpc_port;
    }
    if let Some(sch_addr) = cli.sch_addr {
        config.sch_addr = sch_addr;
    }
    if let Some(gpu) = cli.gpu {
        config.gpu = gpu;
    }
    if let Some(num_workers) = cli.num_workers {
        config.num_workers = num_workers;
    }
    if let Some(cores) = &cli.cores {
        // Malformed core lists are fatal at startup
        config.cores = parse_cores(cores)?;
    }
    if let Some(gpu_memory) = cli.gpu_memory {
        config.gpu_memory_mb = gpu_memory;
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
        node = config.node_id,
        port = config.port,
        rpc_port = config.rpc_port,
        workers = config.num_workers,
        gpu = config.gpu,
        "Starting nexus backend"
    );

    // The framework adapter seam; real tensor kernels plug in here
    let framework = Arc::new(MockFramework::new());
    let server = BackendServer::new(config, framework);
    server.run().await
}
