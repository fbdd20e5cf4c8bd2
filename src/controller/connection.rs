//! Engine connection management and state publication
//!
//! The connect loop retries every 2 s forever; the engine is expected to
//! be unavailable during its own restarts and comes back under external
//! supervision. Stats refreshes publish to the store only when a field
//! actually changed, except the liveness timestamp which is refreshed on
//! every cycle so other processes can detect staleness independently.

use super::{max_level, DspController, Stats, ALIVE_MAX_AGE, CONNECT_POLL_PERIOD};
use super::{LFE_TONE_COMPONENT, PLAYER_COMPONENT};
use crate::engine::{EngineError, ProcessingState};
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, warn};

impl DspController {
    /// Keep trying to connect to the engine, forever
    pub async fn connect_loop(self: std::sync::Arc<Self>) {
        loop {
            self.connect_tick().await;
            tokio::time::sleep(CONNECT_POLL_PERIOD).await;
        }
    }

    /// One iteration of the connect loop
    pub(crate) async fn connect_tick(&self) {
        if self.engine.is_connected().await {
            return;
        }
        match self.engine.connect().await {
            Err(e) => {
                // log (debug) every time, but log (info) once
                debug!("couldn't connect to the engine: {}", e);
                let first_failure = {
                    let mut state = self.state.lock();
                    state.connect_attempts += 1;
                    state.connect_attempts == 1
                };
                if first_failure {
                    info!(
                        "couldn't connect to the engine at {}:{}",
                        self.cfg.host, self.cfg.port
                    );
                }
                self.player_failsafe_off().await;
            },
            Ok(()) => {
                {
                    let mut state = self.state.lock();
                    state.connect_attempts = 0;
                    state.was_connected = true;
                }
                let version = self
                    .engine
                    .version()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                info!(
                    "✅ Connected to the engine on {}:{} - version: {}",
                    self.cfg.host, self.cfg.port, version
                );
                self.update().await;
                // Wake up the subwoofer with the inaudible tone, best effort.
                self.request(LFE_TONE_COMPONENT, "play_skip_tests").await;
            },
        }
    }

    /// Never leave the player outputting into a dead DSP path: once the
    /// engine has been reachable, a failed reconnect powers the player off
    /// if it is alive and on
    async fn player_failsafe_off(&self) {
        if !self.state.lock().was_connected {
            return;
        }
        let player_alive = self
            .store
            .check_alive(PLAYER_COMPONENT, ALIVE_MAX_AGE)
            .await
            .unwrap_or(false);
        if player_alive && self.store.get_flag("PLAYER:power").await {
            info!("engine is unreachable - powering the player off");
            self.request(PLAYER_COMPONENT, "off").await;
        }
    }

    /// Whether the engine is active: connected and running or paused
    ///
    /// Fail-closed: any RPC fault during the check reads as "not on".
    pub async fn is_on(&self) -> bool {
        if !self.engine.is_connected().await {
            return false;
        }
        match self.engine.state().await {
            Ok(state) => matches!(state, ProcessingState::Running | ProcessingState::Paused),
            Err(e) => {
                warn!("engine state check failed: {}", e);
                false
            },
        }
    }

    /// Refresh stats every `interval`, forever
    pub async fn update_loop(self: std::sync::Arc<Self>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            self.update().await;
        }
    }

    /// Refresh the stats snapshot and publish it if it changed
    ///
    /// Runs on the stats timer and opportunistically after state-changing
    /// actions. While the engine is off nothing is published and the
    /// liveness timestamp goes stale, which observers read as "off".
    pub async fn update(&self) {
        if !self.is_on().await {
            return;
        }
        debug!("updating stats");

        if let Err(e) = self.store.set_alive().await {
            warn!("couldn't refresh liveness: {}", e);
        }

        let stats = match self.collect_stats().await {
            Ok(stats) => stats,
            Err(e) => {
                error!("stats refresh failed: {}", e);
                return;
            },
        };

        let changed = {
            let mut state = self.state.lock();
            let changed = state.last_stats.as_ref() != Some(&stats);
            state.last_stats = Some(stats.clone());
            changed
        };
        if !changed {
            return;
        }
        debug!("stats have changed - updating the store: {:?}", stats);

        let mut fields = vec![
            ("is_on", json!(stats.is_on)),
            ("mute", json!(stats.mute)),
            ("volume", json!(stats.volume)),
            (
                "max_playback_signal_rms",
                json!(stats.max_playback_signal_rms),
            ),
            (
                "max_playback_signal_peak",
                json!(stats.max_playback_signal_peak),
            ),
        ];
        if let Some(index) = stats.config_index {
            fields.push(("config_index", json!(index)));
        }
        if let Some(control_player) = stats.control_player {
            fields.push(("control_player", json!(control_player)));
        }
        if let Err(e) = self.store.update_stats(&fields, true).await {
            warn!("couldn't publish stats: {}", e);
        }
    }

    /// Read the full snapshot from the engine
    async fn collect_stats(&self) -> Result<Stats, EngineError> {
        // Resync the config index from the engine-reported active file.
        let (config_index, control_player) = if self.cfg.configs.is_empty() {
            (None, None)
        } else {
            let config_path = self.engine.config_path().await?;
            let name = Path::new(&config_path)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(&config_path);
            let index = match self.cfg.configs.iter().position(|c| c == name) {
                Some(index) => {
                    self.state.lock().config_index = index;
                    index
                },
                None => {
                    // Keep the previous index; somebody loaded a file we
                    // don't know about.
                    warn!("couldn't find current configuration {}", config_path);
                    self.state.lock().config_index
                },
            };
            (Some(index), Some(self.cfg.controls_player(index)))
        };

        let volume = self.engine.volume().await?;
        let rms = self.engine.playback_rms().await?;
        let peak = self.engine.playback_peak().await?;
        let mute = self.engine.mute().await?;

        Ok(Stats {
            is_on: true,
            mute,
            volume: volume.round() as i64,
            max_playback_signal_rms: max_level(&rms).round() as i64,
            max_playback_signal_peak: max_level(&peak).round() as i64,
            config_index,
            control_player,
        })
    }
}

#[cfg(test)]
mod unit_tests {
    use crate::controller::{max_level, round_db};

    #[test]
    fn test_max_level_reduces_across_channels() {
        assert_eq!(max_level(&[-40.0, -23.5, -60.0]), -23.5);
        assert_eq!(max_level(&[]), -255.0);
    }

    #[test]
    fn test_round_db_resolution() {
        assert_eq!(round_db(-23.54), -235);
        assert_eq!(round_db(-23.549), -235);
        assert_eq!(round_db(-23.44), -234);
    }
}
