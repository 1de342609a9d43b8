//! Configuration loader and validator
//!
//! Loads bridge configuration from TOML files in the configs/ directory.
//! Every field has a default, so an empty file is a valid configuration.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// UDP server settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Per-pad behaviour shared by all sessions
    #[serde(default)]
    pub pads: PadSettings,

    /// Calibration cache location
    #[serde(default)]
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl ServerSettings {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self.bind_address.parse().map_err(|_| {
            ConfigError::Invalid(format!("bind_address '{}' is not an IP address", self.bind_address))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// How the four player LEDs are driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedMode {
    Off,
    /// Light the LED matching the output slot
    #[default]
    PadId,
    /// Show the battery tier as a ladder
    Battery,
    /// Use `custom_leds`
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PadSettings {
    /// Minimum time between two output commands (milliseconds)
    #[serde(default)]
    pub latency_ms: u64,

    /// Dead-zone radius in stick counts around centre
    #[serde(default)]
    pub dead_zone_left: u8,

    #[serde(default)]
    pub dead_zone_right: u8,

    #[serde(default)]
    pub flip_lx: bool,

    #[serde(default)]
    pub flip_ly: bool,

    #[serde(default)]
    pub flip_rx: bool,

    #[serde(default)]
    pub flip_ry: bool,

    /// Report R2 before L2 in the analog trigger bytes
    #[serde(default)]
    pub swap_triggers: bool,

    #[serde(default)]
    pub disable_rumble: bool,

    #[serde(default)]
    pub led_mode: LedMode,

    /// Blink the slot LED while the battery is low
    #[serde(default = "default_true")]
    pub flash_leds_on_low_battery: bool,

    #[serde(default)]
    pub custom_leds: [bool; 4],

    /// How long the L1+R1+PS chord must be held before the pad is dropped
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,
}

impl Default for PadSettings {
    fn default() -> Self {
        Self {
            latency_ms: 0,
            dead_zone_left: 0,
            dead_zone_right: 0,
            flip_lx: false,
            flip_ly: false,
            flip_rx: false,
            flip_ry: false,
            swap_triggers: false,
            disable_rumble: false,
            led_mode: LedMode::default(),
            flash_leds_on_low_battery: true,
            custom_leds: [false; 4],
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// JSON file holding EEPROM snapshots and calibration blobs
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_bind_address() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 26760 }
fn default_true() -> bool { true }
fn default_disconnect_timeout_ms() -> u64 { 2000 }
fn default_store_path() -> PathBuf { PathBuf::from("dsu_bridge_store.json") }

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        info!("Loading configuration from: {}", path_ref.display());

        let content = std::fs::read_to_string(path_ref)?;
        let config = Self::parse(&content)?;

        debug!("  - Server: {}:{}", config.server.bind_address, config.server.port);
        debug!("  - LED mode: {:?}", config.pads.led_mode);
        debug!("  - Store: {}", config.storage.path.display());

        Ok(config)
    }

    /// Load default configuration from configs/default.toml
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load("configs/default.toml")
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".into()));
        }

        self.server.socket_addr()?;

        if self.storage.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("storage path must not be empty".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.port, 26760);
        assert_eq!(config.server.bind_address, "127.0.0.1");
        assert_eq!(config.pads.led_mode, LedMode::PadId);
        assert_eq!(config.pads.disconnect_timeout_ms, 2000);
        assert!(config.pads.flash_leds_on_low_battery);
        assert!(!config.pads.swap_triggers);
    }

    #[test]
    fn test_parse_pad_settings() {
        let config = Config::parse(
            r#"
            [server]
            port = 26761

            [pads]
            latency_ms = 8
            dead_zone_left = 12
            flip_ly = true
            led_mode = "custom"
            custom_leds = [true, false, false, true]
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 26761);
        assert_eq!(config.pads.latency_ms, 8);
        assert_eq!(config.pads.dead_zone_left, 12);
        assert!(config.pads.flip_ly);
        assert_eq!(config.pads.led_mode, LedMode::Custom);
        assert_eq!(config.pads.custom_leds, [true, false, false, true]);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            Config::parse("[server]\nport = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::parse("[server]\nbind_address = \"localhost\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::parse("[pads]\nled_mode = \"rainbow\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_socket_addr() {
        let settings = ServerSettings::default();
        assert_eq!(settings.socket_addr().unwrap(), "127.0.0.1:26760".parse().unwrap());
    }
}
