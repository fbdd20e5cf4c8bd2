//! dsp-rig - DSP controller daemon
//!
//! Owns the CamillaDSP connection and bridges it to the coordination
//! store: inbound actions on `CDSP:ACTION` drive the engine, derived state
//! is published back under the `CDSP:` namespace for the display, LED, and
//! player-bridge processes to consume.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dsp_rig::config::AppConfig;
use dsp_rig::controller::DspController;
use dsp_rig::engine::CamillaClient;
use dsp_rig::store::RedisStore;

/// Coordination-store namespace of this daemon
const COMPONENT: &str = "CDSP";

/// DSP controller daemon for the audio rig
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(&args.log_level)?;

    info!("Starting dsp-rig controller...");
    info!("Configuration file: {}", args.config);

    let config = AppConfig::load(&args.config).await?;

    // The store is this process' command/event bus; not having it is fatal.
    let store = Arc::new(RedisStore::connect(&config.store.url(), COMPONENT).await?);
    info!("Coordination store connected");

    let engine = Arc::new(CamillaClient::new(
        &config.controller.host,
        config.controller.port,
    ));

    let controller = Arc::new(DspController::new(config.controller, engine, store));
    let handles = controller.spawn().await?;
    info!("Controller running ({} background tasks)", handles.len());

    shutdown_signal().await;
    info!("dsp-rig controller shutdown complete");
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .init();

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");
    info!("Shutdown signal received");
}
