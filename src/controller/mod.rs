//! DSP engine controller
//!
//! Owns the connection to the DSP engine, dispatches inbound command
//! tokens, serializes volume and configuration mutations, and keeps the
//! published projection of the engine state in sync on the coordination
//! store.
//!
//! The controller has no terminal state: the connect loop retries forever
//! (the engine restarts under external supervision), faults degrade the
//! published state instead of crashing, and shutdown is external.

mod actions;
mod command;
mod connection;

pub use actions::MuteMode;
pub use command::Command;

use crate::config::ControllerConfig;
use crate::engine::DspEngine;
use crate::store::Store;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Media player component on the coordination store
pub const PLAYER_COMPONENT: &str = "PLAYER";
/// Subwoofer wake-tone component on the coordination store
pub const LFE_TONE_COMPONENT: &str = "LFE_TONE";

/// Connect retry period; there is no backoff and no retry limit
pub const CONNECT_POLL_PERIOD: Duration = Duration::from_secs(2);
/// A collaborator whose liveness key is older than this is considered dead
pub const ALIVE_MAX_AGE: Duration = Duration::from_secs(20);

/// Published stats snapshot; republished only when a field changes
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Stats {
    pub is_on: bool,
    pub mute: bool,
    /// Volume in dB, rounded
    pub volume: i64,
    /// Max playback RMS across channels, dB rounded
    pub max_playback_signal_rms: i64,
    /// Max playback peak across channels, dB rounded
    pub max_playback_signal_peak: i64,
    pub config_index: Option<usize>,
    pub control_player: Option<bool>,
}

/// Mutable runtime state, shared across the controller's tasks
pub(crate) struct RuntimeState {
    /// Authoritative only while connected; resynced from the engine on
    /// every stats refresh
    pub config_index: usize,
    pub last_stats: Option<Stats>,
    /// The engine was reachable at least once since process start
    pub was_connected: bool,
    pub connect_attempts: u64,
}

/// DSP engine controller state machine
///
/// All collaborators are injected: the engine RPC handle and the store
/// handle arrive as trait objects, so tests drive the controller with
/// in-memory fakes. The two `tokio` mutexes are the only gates for
/// state-mutating engine calls: at most one volume mutation and at most
/// one config switch are in flight system-wide.
pub struct DspController {
    pub(crate) cfg: ControllerConfig,
    pub(crate) engine: Arc<dyn DspEngine>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) state: parking_lot::Mutex<RuntimeState>,
    pub(crate) volume_lock: tokio::sync::Mutex<()>,
    pub(crate) config_lock: tokio::sync::Mutex<()>,
}

impl DspController {
    pub fn new(cfg: ControllerConfig, engine: Arc<dyn DspEngine>, store: Arc<dyn Store>) -> Self {
        Self {
            cfg,
            engine,
            store,
            state: parking_lot::Mutex::new(RuntimeState {
                config_index: 0,
                last_stats: None,
                was_connected: false,
                connect_attempts: 0,
            }),
            volume_lock: tokio::sync::Mutex::new(()),
            config_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Spawn the controller's background tasks: the connect loop, the stats
    /// loop (when enabled), and the inbound action listener
    pub async fn spawn(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();

        let controller = Arc::clone(self);
        handles.push(tokio::spawn(controller.connect_loop()));

        if let Some(interval) = self.cfg.update_interval() {
            let controller = Arc::clone(self);
            handles.push(tokio::spawn(controller.update_loop(interval)));
        }

        let mut inbound = self.store.subscribe_actions().await?;
        let controller = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            // One short-lived task per inbound command; ordering across
            // commands is not guaranteed, the mutation gates are.
            while let Some(action) = inbound.recv().await {
                let controller = Arc::clone(&controller);
                tokio::spawn(async move {
                    controller.action(&action).await;
                });
            }
            warn!("inbound action channel closed");
        }));

        Ok(handles)
    }

    /// `"CDSP:<field>"` key under this controller's namespace
    pub(crate) fn own_key(&self, field: &str) -> String {
        format!("{}:{}", self.store.component(), field)
    }

    /// Publish a key under the controller's namespace, best effort
    pub(crate) async fn publish(&self, field: &str, value: serde_json::Value) {
        let key = self.own_key(field);
        if let Err(e) = self.store.set(&key, value).await {
            warn!("couldn't publish '{}': {}", key, e);
        }
    }

    /// Publish an event label, best effort
    pub(crate) async fn notify(&self, event: &str) {
        if let Err(e) = self.store.publish_event(event).await {
            warn!("couldn't publish event '{}': {}", event, e);
        }
    }

    /// Fire-and-forget action to another component
    pub(crate) async fn request(&self, dest: &str, action: &str) {
        debug!("requesting '{}' from {}", action, dest);
        if let Err(e) = self.store.send_action(dest, action).await {
            warn!("couldn't send '{}' to {}: {}", action, dest, e);
        }
    }
}

/// dB rounded to 0.1 resolution, for redundant-write comparison
pub(crate) fn round_db(db: f64) -> i64 {
    (db * 10.0).round() as i64
}

/// Max level across channels, dB; `-255` stands in for "no channels"
pub(crate) fn max_level(levels: &[f64]) -> f64 {
    levels
        .iter()
        .copied()
        .fold(None, |acc: Option<f64>, v| {
            Some(acc.map_or(v, |a| a.max(v)))
        })
        .unwrap_or(-255.0)
}
