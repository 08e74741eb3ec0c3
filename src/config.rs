//! # Configuration
//!
//! ## Why This Module Exists
//! Every deployment-specific value (broker address, sunrise/sunset times,
//! pacing delays, I2C addresses) lives in one explicit configuration struct
//! loaded at startup and passed down by value.
//!
//! ## Error Handling Strategy
//! Follows a fail-safe approach: a missing configuration file degrades to
//! defaults with a warning rather than preventing startup. A file that exists
//! but does not parse is a hard error, since silently ignoring a typo in a
//! broker address would strand the installation offline.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::schedule::ScheduleConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unable to read config file {0}: {1}")]
    Read(PathBuf, String),

    #[error("Unable to parse config file {0}: {1}")]
    Parse(PathBuf, String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub schedule: ScheduleConfig,
    pub timing: TimingConfig,
    pub hardware: HardwareConfig,
}

/// MQTT broker endpoint and account.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Account name; also the first segment of every topic.
    pub username: String,
    pub password: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            host: "mqtt.dioty.co".to_string(),
            port: 1883,
            client_id: "fishlight".to_string(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl BrokerConfig {
    /// Per-installation topic root, `/<account>/`.
    pub fn topic_root(&self) -> String {
        format!("/{}/", self.username)
    }
}

/// Every delay and window in the synchronization protocol, all overridable.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub connect_timeout_secs: u64,
    /// First settle window after subscribing, while retained messages arrive.
    pub retained_settle_secs: u64,
    /// Second, shorter settle window after conflict resolution.
    pub post_fix_settle_secs: u64,
    /// Pause after every publish so the broker is never flooded.
    pub anti_timeout_ms: u64,
    /// Longer pause before a corrective publish, to damp oscillation when a
    /// conflicting command is rejected.
    pub anti_interference_ms: u64,
    pub color_debounce_ms: u64,
    pub reconnect_base_secs: u64,
    pub max_reconnect_attempts: u32,
    pub driver_tick_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            connect_timeout_secs: 10,
            retained_settle_secs: 2,
            post_fix_settle_secs: 1,
            anti_timeout_ms: 100,
            anti_interference_ms: 500,
            color_debounce_ms: 1000,
            reconnect_base_secs: 60,
            max_reconnect_attempts: 5,
            driver_tick_ms: 500,
        }
    }
}

impl TimingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retained_settle(&self) -> Duration {
        Duration::from_secs(self.retained_settle_secs)
    }

    pub fn post_fix_settle(&self) -> Duration {
        Duration::from_secs(self.post_fix_settle_secs)
    }

    pub fn anti_timeout(&self) -> Duration {
        Duration::from_millis(self.anti_timeout_ms)
    }

    pub fn anti_interference(&self) -> Duration {
        Duration::from_millis(self.anti_interference_ms)
    }

    pub fn color_debounce(&self) -> Duration {
        Duration::from_millis(self.color_debounce_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_secs(self.reconnect_base_secs)
    }

    pub fn driver_tick(&self) -> Duration {
        Duration::from_millis(self.driver_tick_ms)
    }
}

/// PWM module wiring.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Log duty cycles instead of touching the I2C bus. For development off
    /// the Raspberry Pi.
    pub dummy: bool,
    pub led_module_address: u16,
    pub rgb_module_address: u16,
    pub pwm_frequency_hz: u16,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        HardwareConfig {
            dummy: false,
            led_module_address: 0x40,
            rgb_module_address: 0x41,
            pwm_frequency_hz: 120,
        }
    }
}

impl Config {
    /// Loads configuration from the given path, or from
    /// `<config dir>/fishlight/config.toml` when none is given. Account
    /// credentials may be supplied or overridden through the `MQTT_EMAIL`
    /// and `MQTT_PASSWORD` environment variables.
    pub fn load(path: Option<PathBuf>) -> Result<Config, ConfigError> {
        let path = path.unwrap_or_else(default_config_path);

        let mut config = if path.is_file() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::Read(path.clone(), e.to_string()))?;
            let parsed: Config = toml::from_str(&raw)
                .map_err(|e| ConfigError::Parse(path.clone(), e.to_string()))?;
            info!("Loaded configuration from {}", path.display());
            parsed
        } else {
            warn!(
                "No config file at {}, continuing with defaults",
                path.display()
            );
            Config::default()
        };

        if let Ok(email) = std::env::var("MQTT_EMAIL") {
            config.broker.username = email;
        }
        if let Ok(password) = std::env::var("MQTT_PASSWORD") {
            config.broker.password = password;
        }

        Ok(config)
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fishlight")
        .join("config.toml")
}
