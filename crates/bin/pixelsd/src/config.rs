//! Configuration loading — TOML file with environment variable overrides.
//!
//! Looks for `pixels.toml` in the working directory. Every field has a
//! sensible default so the file is optional. Environment variables take
//! precedence over file values.

use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;

use pixels_dice_adapter_ble::BleConfig;
use pixels_dice_domain::die::{DEFAULT_PRESENCE_WINDOW, DieConfig};
use pixels_dice_domain::error::ValidationError;
use pixels_dice_domain::id::DieId;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging settings.
    pub logging: LoggingConfig,
    /// BLE adapter settings.
    pub ble: BleConfig,
    /// Integration toggles.
    pub integrations: IntegrationsConfig,
    /// Dice to track, one `[[dice]]` table each.
    pub dice: Vec<DiceEntry>,
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (`RUST_LOG` syntax).
    pub filter: String,
}

/// Per-integration toggles.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct IntegrationsConfig {
    /// Use simulated dice instead of the BLE adapter.
    pub virtual_enabled: bool,
}

/// One configured die.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DiceEntry {
    /// Advertised name of the die.
    pub name: String,
    /// Unique id; defaults to the name.
    pub id: Option<String>,
    /// Connect at startup.
    pub autoconnect: bool,
    /// How long a sighting keeps the die present.
    pub presence_window_secs: u64,
}

impl Config {
    /// Load configuration from `pixels.toml` (if present) then apply
    /// environment-variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML file exists but is malformed, or the
    /// resulting configuration is invalid.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::from_file("pixels.toml")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(ConfigError::Parse),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Some(enabled) = std::env::var("PIXELS_VIRTUAL")
            .ok()
            .and_then(|val| parse_flag(&val))
        {
            self.integrations.virtual_enabled = enabled;
        }
        if let Ok(val) = std::env::var("PIXELS_LOG") {
            self.logging.filter = val;
        }
        if let Ok(val) = std::env::var("RUST_LOG") {
            self.logging.filter = val;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ble.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "ble.connect_timeout_secs must be non-zero".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for config in self.die_configs()? {
            if !seen.insert(config.id.clone()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate die id {}",
                    config.id
                )));
            }
        }
        Ok(())
    }

    /// Build the session configuration of every `[[dice]]` entry.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Die`] for a blank name or id.
    pub fn die_configs(&self) -> Result<Vec<DieConfig>, ConfigError> {
        self.dice.iter().map(DiceEntry::to_die_config).collect()
    }
}

impl DiceEntry {
    fn to_die_config(&self) -> Result<DieConfig, ConfigError> {
        let id = match &self.id {
            Some(id) => DieId::new(id.clone())?,
            None => DieId::new(self.name.clone())?,
        };
        Ok(DieConfig::new(self.name.clone(), id)?
            .with_autoconnect(self.autoconnect)
            .with_presence_window(Duration::from_secs(self.presence_window_secs)))
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "pixelsd=info,pixels_dice_app=info,pixels_dice_adapter_ble=info".to_string(),
        }
    }
}

impl Default for DiceEntry {
    fn default() -> Self {
        Self {
            name: String::new(),
            id: None,
            autoconnect: false,
            presence_window_secs: DEFAULT_PRESENCE_WINDOW.as_secs(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parse failure.
    #[error("failed to parse config file")]
    Parse(#[from] toml::de::Error),
    /// File I/O failure.
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    /// A `[[dice]]` entry is invalid.
    #[error("invalid die entry")]
    Die(#[from] ValidationError),
    /// Semantic validation failure.
    #[error("invalid configuration: {0}")]
    Validation(String),
}
