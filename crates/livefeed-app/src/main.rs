//! livefeed - Entry Point

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Real-time crypto price feed client
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via LIVEFEED_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize TLS crypto provider (must be before any WS connections)
    livefeed_ws::init_crypto();

    let args = Args::parse();

    livefeed_telemetry::init_logging()?;

    info!("Starting livefeed v{}", env!("CARGO_PKG_VERSION"));

    // Determine config path: CLI arg > LIVEFEED_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("LIVEFEED_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    info!(config_path = %config_path, "Loading configuration");
    let config = livefeed_app::AppConfig::load(&config_path)?;
    info!(
        socket_symbols = config.socket.symbols.len(),
        aggregator_symbols = config.aggregator.symbols.len(),
        watcher = ?config.watcher.symbol,
        "Configuration loaded"
    );

    let app = livefeed_app::Application::new(config)?;
    app.run().await?;

    Ok(())
}
