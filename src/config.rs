//! Configuration management for dsp-rig
//!
//! Handles loading and validating the YAML configuration file shared by the
//! controller and inputs daemons. The configuration is immutable once
//! validated; an invalid configuration is fatal at startup.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub controller: ControllerConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoder: Option<EncoderConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<ButtonConfig>,
}

/// Coordination store (Redis) connection parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_host")]
    pub host: String,
    #[serde(default = "default_store_port")]
    pub port: u16,
    #[serde(default)]
    pub db: i64,
}

impl StoreConfig {
    /// Redis connection URL
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

/// DSP controller parameters
///
/// `volume_min`/`volume_max`/`volume_step` are in dB (the engine's native
/// unit). `configs` and `configs_control_player` are parallel lists: entry
/// `i` of the latter says whether config `i` drives the media player.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    pub host: String,
    pub port: u16,
    pub volume_min: f64,
    pub volume_max: f64,
    pub volume_step: f64,
    /// Stats refresh period in seconds (0 disables the stats loop)
    #[serde(default = "default_update_interval")]
    pub update_interval: u64,
    /// Directory holding the engine configuration files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_dir: Option<String>,
    /// Engine configuration file names, switchable by index
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configs: Vec<String>,
    /// Whether each config drives the media player (parallel to `configs`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configs_control_player: Vec<bool>,
    /// Mute before switching configs (read/validate/apply takes a while)
    #[serde(default = "default_true")]
    pub mute_on_config_change: bool,
}

impl ControllerConfig {
    /// Stats refresh period, `None` when the stats loop is disabled
    pub fn update_interval(&self) -> Option<Duration> {
        (self.update_interval > 0).then(|| Duration::from_secs(self.update_interval))
    }

    /// Full path of the config file at `index`
    pub fn config_file(&self, index: usize) -> Option<String> {
        let dir = self.config_dir.as_deref()?;
        let name = self.configs.get(index)?;
        Some(format!("{}/{}", dir.trim_end_matches('/'), name))
    }

    /// Whether the config at `index` drives the media player
    pub fn controls_player(&self, index: usize) -> bool {
        self.configs_control_player.get(index).copied().unwrap_or(false)
    }

    /// Convert a percentage of the volume range into dB
    pub fn percent_to_db(&self, percent: f64) -> f64 {
        (self.volume_max - self.volume_min) * percent / 100.0 + self.volume_min
    }

    /// Convert a dB value into a percentage of the volume range
    pub fn db_to_percent(&self, db: f64) -> f64 {
        (db - self.volume_min) / (self.volume_max - self.volume_min) * 100.0
    }
}

/// Rotary encoder wiring
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EncoderConfig {
    pub pin_a: u8,
    pub pin_b: u8,
    /// Swap rotation direction (encoder wired backwards)
    #[serde(default)]
    pub invert: bool,
}

/// Push button wiring and bound actions
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ButtonConfig {
    pub pin: u8,
    /// Pull-up wiring: the line rests high, activation is a falling edge
    #[serde(default = "default_true")]
    pub pull_up: bool,
    /// Action sent to the controller on a short press
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressed_action: Option<String>,
    /// Action sent to the controller when the button is held
    #[serde(skip_serializing_if = "Option::is_none")]
    pub held_action: Option<String>,
}

impl AppConfig {
    /// Load configuration from file
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: AppConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML config: {}", path))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration once at startup
    pub fn validate(&self) -> Result<()> {
        let c = &self.controller;
        if c.host.is_empty() {
            bail!("controller.host isn't defined");
        }
        if c.volume_min >= c.volume_max {
            bail!(
                "controller.volume_min ({}) must be below volume_max ({})",
                c.volume_min,
                c.volume_max
            );
        }
        if c.volume_step <= 0.0 {
            bail!("controller.volume_step must be positive");
        }
        if !c.configs.is_empty() {
            if c.update_interval == 0 {
                bail!("controller.configs is set but update_interval is 0");
            }
            if c.config_dir.is_none() {
                bail!("controller.configs is set but config_dir isn't");
            }
            if !c.configs_control_player.is_empty()
                && c.configs_control_player.len() != c.configs.len()
            {
                bail!(
                    "controller.configs_control_player has {} entries for {} configs",
                    c.configs_control_player.len(),
                    c.configs.len()
                );
            }
        }
        for button in &self.buttons {
            if button.pressed_action.is_none() && button.held_action.is_none() {
                bail!("buttons: pin {} has no action bound", button.pin);
            }
        }
        Ok(())
    }
}

// Default value functions
fn default_store_host() -> String {
    "localhost".to_string()
}
fn default_store_port() -> u16 {
    6379
}
fn default_update_interval() -> u64 {
    4
}
fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
store:
  host: localhost
controller:
  host: localhost
  port: 1234
  volume_min: -60.0
  volume_max: -12.0
  volume_step: 1.0
  config_dir: /home/io/camilladsp/configs
  configs:
    - streamer_loop0.yml
    - streamer_loop1.yml
  configs_control_player:
    - true
    - false
encoder:
  pin_a: 16
  pin_b: 15
buttons:
  - pin: 23
    pressed_action: "next_config"
    held_action: "config:0"
  - pin: 4
    pressed_action: "toggle_mute"
"#;

    fn sample_config() -> AppConfig {
        serde_yaml::from_str(SAMPLE).unwrap()
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = AppConfig::load(file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.controller.port, 1234);
        assert_eq!(config.controller.configs.len(), 2);
        assert_eq!(config.buttons.len(), 2);
        assert!(config.encoder.is_some());
    }

    #[test]
    fn test_defaults() {
        let config = sample_config();
        assert_eq!(config.store.port, 6379);
        assert_eq!(config.controller.update_interval, 4);
        assert!(config.controller.mute_on_config_change);
        assert!(config.buttons[0].pull_up);
    }

    #[test]
    fn test_validate_ok() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_volume_range() {
        let mut config = sample_config();
        config.controller.volume_min = -10.0;
        config.controller.volume_max = -20.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_configs_without_update_interval() {
        let mut config = sample_config();
        config.controller.update_interval = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_mismatched_parallel_lists() {
        let mut config = sample_config();
        config.controller.configs_control_player.pop();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_percent_db_conversions() {
        let config = sample_config();
        let c = &config.controller;
        assert_eq!(c.percent_to_db(0.0), -60.0);
        assert_eq!(c.percent_to_db(100.0), -12.0);
        assert_eq!(c.percent_to_db(50.0), -36.0);
        assert_eq!(c.db_to_percent(-36.0), 50.0);
    }

    #[test]
    fn test_config_file_path() {
        let config = sample_config();
        assert_eq!(
            config.controller.config_file(1).unwrap(),
            "/home/io/camilladsp/configs/streamer_loop1.yml"
        );
        assert!(config.controller.config_file(5).is_none());
    }
}
