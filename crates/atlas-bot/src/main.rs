//! Atlas trading engine - entry point.

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Atlas market-stream trading engine
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via ATLAS_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Must run before any TLS connection is opened
    atlas_ws::init_crypto();

    let args = Args::parse();

    // CLI arg > ATLAS_CONFIG > default
    let config_path = args
        .config
        .or_else(|| std::env::var("ATLAS_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    let config = atlas_bot::AppConfig::from_file(&config_path)?;
    atlas_telemetry::init_logging(&config.telemetry.logging)?;

    info!("Starting Atlas v{}", env!("CARGO_PKG_VERSION"));
    info!(
        config_path = %config_path,
        strategies = config.strategies.len(),
        broker = ?config.broker.kind,
        "Configuration loaded"
    );

    let app = atlas_bot::Application::new(config)?;
    app.run().await?;

    Ok(())
}
