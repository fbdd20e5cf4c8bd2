//! Action dispatch and state-mutating operations
//!
//! The action channel is a best-effort command bus, not a validated RPC:
//! unknown tokens and malformed arguments are logged and dropped, engine
//! faults abandon the operation with prior state preserved. Volume and
//! config-switch mutations each run under their own mutex, so a mute can
//! proceed while a volume write is in flight but two volume writes never
//! interleave.

use super::{Command, DspController, LFE_TONE_COMPONENT, PLAYER_COMPONENT};
use super::round_db;
use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, error, info, warn};

/// Mute operation flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteMode {
    Toggle,
    Mute,
    Unmute,
}

impl DspController {
    /// Run one user action, usually received from the action channel
    ///
    /// Ignored entirely while the engine is off.
    pub async fn action(&self, raw: &str) {
        if !self.is_on().await {
            debug!("engine isn't on - ignoring '{}'", raw);
            return;
        }

        let command = match Command::parse(raw) {
            Ok(Command::Unrecognized) => {
                warn!("action '{}' isn't defined", raw);
                return;
            },
            Err(e) => {
                warn!("{}", e);
                return;
            },
            Ok(command) => command,
        };
        info!("'{}'", raw);

        // Config switches refresh stats themselves (the flag-clearing path
        // must run an update even on failure); everything else refreshes
        // here after the mutation.
        let refresh = match command {
            Command::VolumePercent {
                percent,
                update_player,
            } => {
                self.set_volume(self.cfg.percent_to_db(percent), update_player)
                    .await;
                true
            },
            Command::VolumePercentRel { percent } => {
                let delta = (self.cfg.volume_max - self.cfg.volume_min) * percent / 100.0;
                self.incr_volume(delta).await;
                true
            },
            Command::VolumeIncr { steps } => {
                self.incr_volume(steps as f64 * self.cfg.volume_step).await;
                true
            },
            Command::VolumeInc => {
                self.incr_volume(self.cfg.volume_step).await;
                true
            },
            Command::VolumeDec => {
                self.incr_volume(-self.cfg.volume_step).await;
                true
            },
            Command::Mute => {
                self.mute(MuteMode::Mute).await;
                true
            },
            Command::Unmute => {
                self.mute(MuteMode::Unmute).await;
                true
            },
            Command::ToggleMute => {
                self.mute(MuteMode::Toggle).await;
                true
            },
            Command::LoadConfig { index } => {
                self.load_config(index).await;
                false
            },
            Command::NextConfig => {
                self.next_config().await;
                false
            },
            Command::Unrecognized => unreachable!("filtered above"),
        };

        if refresh {
            self.update().await;
        }
    }

    /// Change the volume relative to the engine's current value, in dB
    pub async fn incr_volume(&self, delta_db: f64) {
        let current = match self.engine.volume().await {
            Ok(volume) => volume,
            Err(e) => {
                error!("couldn't read the current volume: {}", e);
                return;
            },
        };
        self.set_volume(current + delta_db, true).await;
    }

    /// Set the volume in dB
    ///
    /// Values past the configured bounds saturate to the nearest bound.
    /// The engine call is skipped when the target equals the current value
    /// (no redundant RPC, no redundant published event) and guarded so
    /// only one volume write is ever in flight.
    pub async fn set_volume(&self, db: f64, update_player: bool) {
        let target = db.clamp(self.cfg.volume_min, self.cfg.volume_max);
        if target != db {
            debug!("volume {:.1} is out of range - clamping to {:.1}", db, target);
        }

        match self.engine.volume().await {
            Ok(current) if round_db(current) == round_db(target) => {
                debug!("volume is already {:.1} - skipping", target);
                return;
            },
            Ok(_) => {},
            Err(e) => {
                error!("couldn't read the current volume: {}", e);
                return;
            },
        }

        let guard = self.volume_lock.lock().await;
        debug!("setting volume to {:.1}", target);
        if let Err(e) = self.engine.set_volume(target).await {
            error!("couldn't set the volume: {}", e);
            return;
        }
        drop(guard);

        self.publish("volume", json!(target.round() as i64)).await;
        self.notify("volume").await;

        // Mirror the change to the media player, scaled to percent, unless
        // the caller opted out (the player-volume mirror does, to avoid an
        // endless echo) or the active config doesn't drive the player.
        let config_index = self.state.lock().config_index;
        if update_player && self.cfg.controls_player(config_index) {
            let percent = self.cfg.db_to_percent(target).round() as i64;
            self.request(PLAYER_COMPONENT, &format!("volume_perc:{}", percent))
                .await;
        }
    }

    /// Mute, unmute, or toggle
    ///
    /// Muting also pauses the player; unmuting wakes the subwoofer and
    /// unpauses the player when the active config drives it.
    pub async fn mute(&self, mode: MuteMode) {
        let set_mute = match mode {
            MuteMode::Mute => true,
            MuteMode::Unmute => false,
            MuteMode::Toggle => match self.engine.mute().await {
                Ok(muted) => !muted,
                Err(e) => {
                    error!("couldn't read the mute state: {}", e);
                    return;
                },
            },
        };

        if let Err(e) = self.engine.set_mute(set_mute).await {
            error!("couldn't set mute: {}", e);
            return;
        }

        if set_mute {
            self.publish("mute", json!(true)).await;
            self.request(PLAYER_COMPONENT, "pause").await;
        } else {
            // Wake up the subwoofer.
            self.request(LFE_TONE_COMPONENT, "play_skip_tests").await;
            let config_index = self.state.lock().config_index;
            if self.cfg.controls_player(config_index) {
                self.request(PLAYER_COMPONENT, "unpause").await;
            }
            self.publish("mute", json!(false)).await;
        }
        self.notify("mute").await;
    }

    /// Load the configuration at `index`
    ///
    /// Guarded so only one switch is in flight; an engine-reported error
    /// aborts the switch with the previous index preserved. The observer
    /// flag is cleared and a full stats refresh runs regardless of the
    /// outcome.
    pub async fn load_config(&self, index: usize) {
        if self.cfg.configs.is_empty() {
            error!("trying to load a config but none are defined");
            return;
        }
        if index >= self.cfg.configs.len() {
            error!(
                "config index {} is out of range (0..{})",
                index,
                self.cfg.configs.len()
            );
            return;
        }

        let guard = self.config_lock.lock().await;

        if index == self.state.lock().config_index {
            info!("config index hasn't changed - won't do anything");
            return;
        }
        // config_file() can't fail past validate(): config_dir is required
        // whenever configs are set.
        let Some(path) = self.cfg.config_file(index) else {
            error!("no config directory defined");
            return;
        };
        info!("Reading and validating config file '{}'", path);

        // Immediate user feedback: reading and validating takes a while.
        self.publish("switching_config", json!(true)).await;
        self.notify("change config").await;

        if self.cfg.mute_on_config_change {
            self.mute(MuteMode::Mute).await;
        }

        match self.apply_config(&path).await {
            Err(e) => error!("can't load config into the engine: {:#}", e),
            Ok(applied) => {
                info!("current config is index {}, path '{}'", index, applied);
                self.state.lock().config_index = index;
            },
        }

        self.publish("switching_config", json!(false)).await;
        drop(guard);

        self.update().await;
    }

    /// Load the next configuration, cyclically
    pub async fn next_config(&self) {
        info!("Next config");
        if self.cfg.configs.is_empty() {
            error!("trying to load the next config but none are defined");
            return;
        }
        let index = (self.state.lock().config_index + 1) % self.cfg.configs.len();
        self.load_config(index).await;
    }

    /// Read, validate, and apply a configuration file; returns the path the
    /// engine reports as active afterwards
    async fn apply_config(&self, path: &str) -> Result<String> {
        let config = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path))?;
        self.engine.validate_config(&config).await?;
        info!("Loading config file in the engine");
        self.engine.set_config(&config).await?;
        self.engine.set_config_path(path).await?;
        Ok(self.engine.config_path().await?)
    }
}
