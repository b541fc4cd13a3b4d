//! Sentinel engine runner.
//!
//! Runs the engine against the paper gateway until Ctrl-C, then performs a
//! graceful stop and optionally writes the final metric values to a file.

use anyhow::Result;
use clap::Parser;
use sentinel_bot::{AppConfig, Engine, EngineComponents};
use sentinel_executor::PaperGateway;
use sentinel_telemetry::Metrics;
use sentinel_ws::{AuthTokenSource, StaticTokenSource};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

const TOKEN_ENV: &str = "SENTINEL_WS_TOKEN";

/// Sentinel trading engine
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via SENTINEL_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,

    /// Write Prometheus text-format metrics to this file on shutdown
    #[arg(long, value_name = "PATH")]
    metrics_dump: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // TLS provider must be installed before any WS connection
    sentinel_ws::init_crypto();

    let args = Args::parse();
    let config_path = AppConfig::resolve_path(args.config);
    let config = AppConfig::from_file(&config_path)?;

    sentinel_telemetry::init_logging(&config.telemetry.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_path = %config_path,
        instruments = ?config.connection.instruments,
        "Starting Sentinel"
    );

    let token_source = StaticTokenSource::from_env(TOKEN_ENV)
        .map(|source| Arc::new(source) as Arc<dyn AuthTokenSource>);
    if token_source.is_none() && config.connection.private_enabled {
        warn!(env = TOKEN_ENV, "No session token set, private stream disabled");
    }

    let engine = Engine::new(
        config.clone(),
        EngineComponents {
            gateway: Arc::new(PaperGateway::new(config.paper.starting_balance)),
            strategies: Vec::new(),
            token_source,
        },
    );
    engine.start()?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let report = engine.stop().await?;
    info!(
        clean = report.clean,
        abandoned = ?report.abandoned,
        open_positions = engine.positions().len(),
        "Shutdown complete"
    );

    if let Some(path) = args.metrics_dump {
        match Metrics::dump_to(&path) {
            Ok(()) => info!(path = %path.display(), "Metrics written"),
            Err(e) => warn!(error = %e, "Metrics dump failed"),
        }
    }
    Ok(())
}
