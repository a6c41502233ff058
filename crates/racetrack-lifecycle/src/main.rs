//! Racetrack lifecycle service binary.
//!
//! Deploys jobs, keeps the registry in sync with the infrastructure and
//! serves the lifecycle API.

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use racetrack_lifecycle::{LifecycleConfig, LifecycleService};

/// Racetrack lifecycle service.
#[derive(Parser, Debug)]
#[command(name = "racetrack-lifecycle")]
#[command(about = "Deploy and supervise Racetrack jobs")]
#[command(version)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "racetrack_lifecycle=debug,hyper=info,tower=info"
    } else {
        "racetrack_lifecycle=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    info!("Racetrack lifecycle starting");

    let config = match cli.config.as_deref() {
        Some(path) => LifecycleConfig::from_file(path)?,
        None => LifecycleConfig::load()?,
    };

    info!(
        listen_addr = %config.server.listen_addr,
        database = ?config.database.backend,
        image_builder = %config.image_builder.url,
        targets = config.infrastructure.targets.len(),
        "configuration loaded"
    );

    LifecycleService::new(config).run().await?;
    Ok(())
}
