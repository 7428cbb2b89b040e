//! Modbus register polling bridge for Zenoh.

use anyhow::{Context, Result};
use clap::Parser;
use mbsense_bridge::bridge::Bridge;
use mbsense_bridge::config::BridgeConfig;
use mbsense_common::LoggingConfig;
use std::path::PathBuf;
use tracing::{error, info};

/// Modbus (TCP/RTU) register polling bridge.
#[derive(Parser, Debug)]
#[command(name = "mbsense-bridge")]
#[command(about = "Polls Modbus devices, decodes registers and serves them over Zenoh")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "mbsense.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = BridgeConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let log_config = LoggingConfig {
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.logging.level.clone()),
        format: config.logging.format,
    };
    mbsense_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting mbsense-bridge");
    info!("Loaded configuration from {:?}", args.config);

    info!("Connecting to Zenoh...");
    let session = mbsense_common::connect(&config.zenoh)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to Zenoh: {}", e))?;
    info!("Connected to Zenoh");

    let bridge = Bridge::new(&config, session.clone())
        .await
        .context("Failed to set up units")?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    };

    bridge.run(shutdown).await.context("Bridge failed")?;

    session
        .close()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to close Zenoh session: {}", e))?;
    info!("mbsense-bridge stopped");

    Ok(())
}
