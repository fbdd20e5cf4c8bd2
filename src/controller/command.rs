//! Wire command decoding
//!
//! Inbound tokens on the `ACTION` channel are a single string, optionally
//! colon-delimited with arguments (`"volume_perc:45"`, `"config:1"`).
//! They decode into a tagged enum matched exhaustively by the dispatcher;
//! unknown tokens become [`Command::Unrecognized`] rather than a lookup
//! miss, malformed numeric arguments are a parse error the dispatcher
//! logs and drops.

use thiserror::Error;

/// Suffix a volume-mirroring producer adds so its own change is not echoed
/// back to the media player (which would loop forever if the two volume
/// implementations ever disagree)
const NO_PLAYER_VOL_UPDATE: &str = "no_player_vol_update";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("malformed numeric argument in '{0}'")]
    BadArgument(String),
}

/// A decoded controller command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Absolute volume as a percentage of the configured range
    VolumePercent { percent: f64, update_player: bool },
    /// Relative volume change as a percentage of the configured range
    VolumePercentRel { percent: f64 },
    /// Relative volume change in units of `volume_step`
    VolumeIncr { steps: i64 },
    VolumeInc,
    VolumeDec,
    Mute,
    Unmute,
    ToggleMute,
    /// Load the configuration at `index`
    LoadConfig { index: usize },
    /// Load the next configuration, cyclically
    NextConfig,
    /// Not a known command; logged and dropped by the dispatcher
    Unrecognized,
}

impl Command {
    /// Decode a raw action token
    pub fn parse(raw: &str) -> Result<Self, CommandError> {
        let mut fields = raw.split(':');
        let name = fields.next().unwrap_or_default();
        let arg = fields.next();
        let flag = fields.next();

        let bad = || CommandError::BadArgument(raw.to_string());

        let command = match (name, arg) {
            ("volume_perc", Some(arg)) => Command::VolumePercent {
                percent: arg.parse().map_err(|_| bad())?,
                update_player: flag != Some(NO_PLAYER_VOL_UPDATE),
            },
            ("volume_perc_rel", Some(arg)) => Command::VolumePercentRel {
                percent: arg.parse().map_err(|_| bad())?,
            },
            ("volume_incr", Some(arg)) => Command::VolumeIncr {
                steps: arg.parse().map_err(|_| bad())?,
            },
            ("volume_inc", None) => Command::VolumeInc,
            ("volume_dec", None) => Command::VolumeDec,
            ("mute", None) => Command::Mute,
            ("unmute", None) => Command::Unmute,
            ("toggle_mute", None) => Command::ToggleMute,
            ("config", Some(arg)) => Command::LoadConfig {
                index: arg.parse().map_err(|_| bad())?,
            },
            ("next_config", None) => Command::NextConfig,
            _ => Command::Unrecognized,
        };
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_volume_commands() {
        assert_eq!(
            Command::parse("volume_perc:45").unwrap(),
            Command::VolumePercent {
                percent: 45.0,
                update_player: true
            }
        );
        assert_eq!(
            Command::parse("volume_perc:45:no_player_vol_update").unwrap(),
            Command::VolumePercent {
                percent: 45.0,
                update_player: false
            }
        );
        assert_eq!(
            Command::parse("volume_perc_rel:-5").unwrap(),
            Command::VolumePercentRel { percent: -5.0 }
        );
        assert_eq!(
            Command::parse("volume_incr:-2").unwrap(),
            Command::VolumeIncr { steps: -2 }
        );
        assert_eq!(Command::parse("volume_inc").unwrap(), Command::VolumeInc);
        assert_eq!(Command::parse("volume_dec").unwrap(), Command::VolumeDec);
    }

    #[test]
    fn test_parse_mute_and_config_commands() {
        assert_eq!(Command::parse("mute").unwrap(), Command::Mute);
        assert_eq!(Command::parse("unmute").unwrap(), Command::Unmute);
        assert_eq!(Command::parse("toggle_mute").unwrap(), Command::ToggleMute);
        assert_eq!(
            Command::parse("config:2").unwrap(),
            Command::LoadConfig { index: 2 }
        );
        assert_eq!(Command::parse("next_config").unwrap(), Command::NextConfig);
    }

    #[test]
    fn test_unknown_tokens_decode_to_unrecognized() {
        assert_eq!(Command::parse("warp_drive").unwrap(), Command::Unrecognized);
        assert_eq!(Command::parse("").unwrap(), Command::Unrecognized);
        // A bare name that requires an argument is not a known command.
        assert_eq!(Command::parse("volume_perc").unwrap(), Command::Unrecognized);
        // Extra argument where none belongs.
        assert_eq!(
            Command::parse("toggle_mute:5").unwrap(),
            Command::Unrecognized
        );
    }

    #[test]
    fn test_malformed_numbers_are_errors() {
        assert!(Command::parse("volume_perc:abc").is_err());
        assert!(Command::parse("volume_incr:1.5.3").is_err());
        assert!(Command::parse("config:-1").is_err());
    }
}
