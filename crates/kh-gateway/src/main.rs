//! Keyhole gateway daemon.
//!
//! Wires the relay pool, origin client, and pipeline together from CLI /
//! file / env configuration and runs until a fatal pipeline error or a
//! shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kh_core::{HttpOriginClient, OriginClient, Pipeline, RelayPool};

mod cli;
mod config;
mod keyfile;
mod pool;

/// Grace period between the shutdown signal and a forced exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = config::GatewayConfig::load(&args)?;
    let keys = keyfile::load_or_generate(&config.secret_key_file)?;
    info!(
        pubkey = %keys.public_hex(),
        destination = %config.destination,
        relays = config.relays.len(),
        "starting keyhole gateway"
    );

    let pool = Arc::new(pool::WsRelayPool::new());
    let origin: Arc<dyn OriginClient> = Arc::new(HttpOriginClient::new(
        config.destination.clone(),
        Duration::from_millis(config.timeout_ms),
    )?);

    let pipeline = Arc::new(Pipeline::new(
        keys,
        config.pipeline_config(),
        pool.clone() as Arc<dyn RelayPool>,
        origin,
        None,
    )?);

    tokio::select! {
        result = pipeline.run() => {
            // The pipeline only returns on fatal errors.
            if let Err(err) = &result {
                error!(error = %err, "pipeline stopped");
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, closing relay pool");
            // If teardown wedges, leave anyway.
            tokio::spawn(async {
                tokio::time::sleep(SHUTDOWN_GRACE).await;
                std::process::exit(-1);
            });
            pool.close().await;
        }
    }

    Ok(())
}
