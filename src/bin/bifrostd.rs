//! bifrostd — Bifrost daemon.
//!
//! Serves the services of a `.proto` file over gRPC and forwards every
//! call to a pool of worker processes.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bifrost::Bridge;
use bifrost::events::log_event;
use bifrost::server::config::Config;

/// Bifrost daemon — gRPC bridge to worker processes.
#[derive(Parser)]
#[command(name = "bifrostd")]
#[command(version = bifrost::PKG_VERSION)]
#[command(about = "Bifrost gRPC bridge daemon")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, env = "BIFROST_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Override the listen address from the config file.
    #[arg(short, long)]
    listen: Option<String>,

    /// Override the number of workers from the config file.
    #[arg(short = 'n', long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(workers) = args.workers {
        config.workers.num_workers = workers;
    }
    config.validate()?;

    // RUST_LOG wins over the configured level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!(
        version = bifrost::version_string(),
        listen = %config.server.listen,
        proto = %config.server.proto.display(),
        workers = config.workers.num_workers,
        "bifrostd starting"
    );

    let bridge = Bridge::new(config);
    bridge.add_listener(Arc::new(log_event))?;

    let stop = bridge.stop_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received");
                stop.stop();
            }
            Err(e) => warn!(error = %e, "failed to listen for interrupt"),
        }
    });

    bridge.serve().await?;
    Ok(())
}
