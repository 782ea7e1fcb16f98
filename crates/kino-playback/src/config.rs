//! Controller configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// When playback starts on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Autostart {
    #[default]
    Off,
    On,
    /// Start once the host reports the player viewable
    Viewable,
}

impl Autostart {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Autostart::Off)
    }
}

/// Ad session behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvertisingConfig {
    /// Seconds before the skip control unlocks (None = not skippable)
    pub skip_offset: Option<f64>,
    /// Resume content after the viewer skips an ad
    pub resume_after_skip: bool,
    /// Hold the playlist advance after completion until a postroll break ends
    pub postroll: bool,
}

impl Default for AdvertisingConfig {
    fn default() -> Self {
        Self {
            skip_offset: None,
            resume_after_skip: true,
            postroll: false,
        }
    }
}

/// Controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Autostart mode
    pub autostart: Autostart,
    /// Start muted
    pub mute: bool,
    /// Initial volume (0-100)
    pub volume: u8,
    /// Loop back to the first item after the last one completes
    pub repeat: bool,
    /// Default playback rate
    pub playback_rate: f64,
    /// Smallest rewind window (seconds) that counts as DVR
    pub min_dvr_window: f64,
    /// Preload the next playlist item in the background
    pub background_loading: bool,
    /// Number of media elements reserved up front
    pub element_pool_size: usize,
    /// Commands held until the container is attached
    pub max_queued_commands: usize,
    /// Consecutive setup failures skipped before giving up
    pub max_setup_skips: usize,
    /// Broadcast capacity of the event bus
    pub event_capacity: usize,
    /// Ad configuration
    pub advertising: Option<AdvertisingConfig>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            autostart: Autostart::Off,
            mute: false,
            volume: 90,
            repeat: false,
            playback_rate: 1.0,
            min_dvr_window: 120.0,
            background_loading: true,
            element_pool_size: 2,
            max_queued_commands: 16,
            max_setup_skips: 3,
            event_capacity: 256,
            advertising: None,
        }
    }
}

impl ControllerConfig {
    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ControllerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.volume > crate::types::MAX_VOLUME {
            return Err(Error::InvalidConfig(format!(
                "volume {} exceeds {}",
                self.volume,
                crate::types::MAX_VOLUME
            )));
        }
        if !(self.playback_rate.is_finite() && self.playback_rate > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "playback_rate must be positive, got {}",
                self.playback_rate
            )));
        }
        if self.element_pool_size == 0 {
            return Err(Error::InvalidConfig(
                "element_pool_size must be at least 1".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(Error::InvalidConfig("event_capacity must be at least 1".into()));
        }
        if let Some(ads) = &self.advertising {
            if matches!(ads.skip_offset, Some(offset) if offset < 0.0) {
                return Err(Error::InvalidConfig("skip_offset must not be negative".into()));
            }
        }
        Ok(())
    }

    /// Advertising settings, falling back to defaults
    pub fn advertising(&self) -> AdvertisingConfig {
        self.advertising.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.autostart, Autostart::Off);
        assert_eq!(config.volume, 90);
        assert_eq!(config.min_dvr_window, 120.0);
        assert!(config.background_loading);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            ControllerConfig::from_json_str(r#"{ "autostart": "viewable", "repeat": true }"#)
                .unwrap();
        assert_eq!(config.autostart, Autostart::Viewable);
        assert!(config.repeat);
        assert_eq!(config.element_pool_size, 2);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(ControllerConfig::from_json_str(r#"{ "volume": 101 }"#).is_err());
        assert!(ControllerConfig::from_json_str(r#"{ "playback_rate": 0 }"#).is_err());
        assert!(ControllerConfig::from_json_str(r#"{ "element_pool_size": 0 }"#).is_err());
    }

    #[test]
    fn test_advertising_defaults_resume() {
        let config = ControllerConfig::from_json_str(r#"{ "advertising": {} }"#).unwrap();
        assert!(config.advertising().resume_after_skip);
        assert_eq!(config.advertising().skip_offset, None);
    }
}
