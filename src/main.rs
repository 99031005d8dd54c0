// =============================================================================
// Aurora Engine — Main Entry Point
// =============================================================================
//
// Loads engine configuration (from a JSON file, optionally overridden by a
// single ad-hoc binding passed on the command line), builds the Engine Root,
// and runs it until SIGINT/SIGTERM, at which point it drains in-flight ticks
// before exiting.

mod config;
mod engine;
mod event_bus;
mod exchange;
mod indicators;
mod position_book;
mod risk;
mod scheduler;
mod strategy;
mod trading_loop;
mod types;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{BindingConfig, EngineConfig};
use crate::engine::Engine;
use crate::types::Timeframe;

/// Shutdown grace period: how long `stop()` waits for in-flight ticks to
/// finish before giving up and logging a warning.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "aurora-engine", about = "Algorithmic spot trading engine")]
struct Cli {
    /// Path to an engine config JSON file. If omitted, defaults are used
    /// (optionally combined with --symbol/--timeframe/--strategy below).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Ad-hoc single binding: instrument symbol, e.g. BTCUSDT.
    #[arg(long, requires = "strategy")]
    symbol: Option<String>,

    /// Ad-hoc single binding: bar timeframe (1m, 5m, 15m, 1h, 4h, 1d).
    #[arg(long, default_value = "15m")]
    timeframe: String,

    /// Ad-hoc single binding: strategy name (sma_crossover, rsi_mean_reversion,
    /// rsi_bollinger).
    #[arg(long)]
    strategy: Option<String>,

    /// Run against the paper exchange regardless of what the config file
    /// says (useful for a quick dry run without touching a live venue).
    #[arg(long)]
    paper: bool,

    /// Exit automatically after this many seconds instead of waiting for a
    /// signal. Mainly for smoke-testing a config from a script.
    #[arg(long)]
    timeout: Option<u64>,
}

fn build_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    if let Some(symbol) = &cli.symbol {
        let strategy = cli.strategy.clone().expect("clap enforces --strategy with --symbol");
        let timeframe: Timeframe = cli
            .timeframe
            .parse()
            .map_err(|e: String| anyhow::anyhow!("invalid --timeframe: {e}"))?;
        config.bindings.push(BindingConfig {
            symbol: symbol.to_uppercase(),
            timeframe,
            strategy,
            parameters: serde_json::Map::new(),
            fixed_quantity: None,
            max_allocation_fraction: 0.1,
            risk_overrides: None,
        });
    }

    if cli.paper {
        config.venue = "paper".to_string();
    }

    Ok(config)
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let _ = dotenv::dotenv();
    init_tracing();

    let cli = Cli::parse();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to build engine config");
            return std::process::ExitCode::from(2);
        }
    };

    info!(venue = %config.venue, bindings = config.bindings.len(), "starting engine");

    let engine = match Engine::build(&config) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "engine failed to build");
            return std::process::ExitCode::from(2);
        }
    };

    engine.start().await;
    info!("engine running — press Ctrl+C to stop");

    let shutdown_reason = match cli.timeout {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => "timeout elapsed",
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        error!(error = %e, "failed to install signal handler");
                        return std::process::ExitCode::from(3);
                    }
                    "signal received"
                }
            }
        }
        None => match tokio::signal::ctrl_c().await {
            Ok(()) => "signal received",
            Err(e) => {
                error!(error = %e, "failed to install signal handler");
                return std::process::ExitCode::from(3);
            }
        },
    };

    warn!(reason = shutdown_reason, "shutting down");
    engine.stop(SHUTDOWN_DEADLINE).await;
    info!("shutdown complete");

    std::process::ExitCode::SUCCESS
}
