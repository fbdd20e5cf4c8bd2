//! dsp-rig-inputs - physical inputs daemon
//!
//! Runs the rotary encoder and the push buttons as an independent process:
//! encoder detents funnel through the coalescer into relative volume
//! actions, button taps and holds publish their configured actions. The
//! controller is only ever reached through the coordination store.

use anyhow::{Context, Result};
use clap::Parser;
use rppal::gpio::Gpio;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dsp_rig::coalesce::EventCoalescer;
use dsp_rig::config::{AppConfig, ButtonConfig, EncoderConfig};
use dsp_rig::input::{gpio, DebouncedInput, Encoder};
use dsp_rig::store::{RedisStore, Store};

/// Coordination-store namespace of this daemon
const COMPONENT: &str = "GPIO";
/// Controller component targeted by the published actions
const CDSP_COMPONENT: &str = "CDSP";
/// Liveness refresh period
const ALIVE_REFRESH_PERIOD: Duration = Duration::from_secs(10);

/// Physical inputs daemon for the audio rig
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
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(&args.log_level)?;

    info!("Starting dsp-rig inputs...");
    info!("Configuration file: {}", args.config);

    let config = AppConfig::load(&args.config).await?;

    let store = Arc::new(RedisStore::connect(&config.store.url(), COMPONENT).await?);
    info!("Coordination store connected");

    // Line acquisition failures below are fatal: without its inputs this
    // process has no reason to run.
    let gpio_chip = Gpio::new().context("Failed to open the GPIO controller")?;

    if let Some(encoder_config) = &config.encoder {
        spawn_encoder(&gpio_chip, encoder_config, &store)?;
    }
    for button_config in &config.buttons {
        spawn_button(&gpio_chip, button_config, &store)?;
    }

    let alive_store = Arc::clone(&store);
    tokio::spawn(async move {
        loop {
            if let Err(e) = alive_store.set_alive().await {
                warn!("couldn't refresh liveness: {}", e);
            }
            tokio::time::sleep(ALIVE_REFRESH_PERIOD).await;
        }
    });

    shutdown_signal().await;
    info!("dsp-rig inputs shutdown complete");
    Ok(())
}

/// Wire encoder lines → quadrature decoder → coalescer → volume actions
fn spawn_encoder(
    gpio_chip: &Gpio,
    config: &EncoderConfig,
    store: &Arc<RedisStore>,
) -> Result<()> {
    let pin_a = gpio::claim_input_pin(gpio_chip, config.pin_a, true)?;
    let pin_b = gpio::claim_input_pin(gpio_chip, config.pin_b, true)?;

    let (tx, rx) = mpsc::channel(256);
    let watch_chip = gpio_chip.clone();
    tokio::task::spawn_blocking(move || gpio::watch_encoder_levels(watch_chip, pin_a, pin_b, tx));

    // A fast spin becomes one net relative command instead of a flood;
    // consumers apply the delta, so no displacement is lost.
    let action_store = Arc::clone(store);
    let coalescer = Arc::new(EventCoalescer::new(Arc::new(
        move |_value, _direction, delta| {
            let store = Arc::clone(&action_store);
            tokio::spawn(async move {
                let action = format!("volume_incr:{}", delta as i64);
                if let Err(e) = store.send_action(CDSP_COMPONENT, &action).await {
                    warn!("couldn't send '{}': {}", action, e);
                }
            });
        },
    )));

    let encoder = Encoder::new(
        config.invert,
        Arc::new(move |value, direction| coalescer.event(value as f64, direction)),
    );
    tokio::spawn(encoder.run(rx));

    info!("Rotary encoder on pins {}/{}", config.pin_a, config.pin_b);
    Ok(())
}

/// Wire a button line → debouncer → pressed/held actions
fn spawn_button(gpio_chip: &Gpio, config: &ButtonConfig, store: &Arc<RedisStore>) -> Result<()> {
    let pin = gpio::claim_input_pin(gpio_chip, config.pin, config.pull_up)?;

    let (tx, rx) = mpsc::channel(64);
    tokio::task::spawn_blocking(move || gpio::watch_button_edges(pin, tx));

    let mut input = DebouncedInput::new(config.pull_up);
    if let Some(action) = &config.pressed_action {
        input = input.on_pressed(send_action_callback(store, action));
    }
    if let Some(action) = &config.held_action {
        input = input.on_held(send_action_callback(store, action));
    }
    tokio::spawn(input.run(rx));

    info!(
        "Push button on pin {} (pressed: {:?}, held: {:?})",
        config.pin, config.pressed_action, config.held_action
    );
    Ok(())
}

/// Callback publishing `action` to the controller's channel
fn send_action_callback(
    store: &Arc<RedisStore>,
    action: &str,
) -> Arc<dyn Fn() + Send + Sync> {
    let store = Arc::clone(store);
    let action = action.to_string();
    Arc::new(move || {
        let store = Arc::clone(&store);
        let action = action.clone();
        tokio::spawn(async move {
            if let Err(e) = store.send_action(CDSP_COMPONENT, &action).await {
                warn!("couldn't send '{}': {}", action, e);
            }
        });
    })
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
