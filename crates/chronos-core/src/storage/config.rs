//! TOML-based application configuration.
//!
//! Stores:
//! - Dispatcher polling and catch-up window
//! - Volume protection settings
//! - Emergency escalation behavior
//! - Display preferences for the CLI
//!
//! Configuration is stored at `~/.config/chronos/config.toml`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::data_dir;
use crate::alarm::TimeFormat;
use crate::engine::{
    DispatcherSettings, LifecycleSettings, ProtectionSettings, DEFAULT_EMERGENCY_MESSAGE,
};
use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// How many already-elapsed minutes a late tick still fires.
    #[serde(default = "default_catch_up_minutes")]
    pub catch_up_minutes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionConfig {
    #[serde(default)]
    pub volume_override: bool,
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    /// Output level (0.0-1.0) below which the volume is forced back up.
    #[serde(default = "default_floor")]
    pub floor: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyConfig {
    /// Stop the ring once the emergency contact has been notified.
    #[serde(default)]
    pub silence_ring_on_fire: bool,
    #[serde(default = "default_message")]
    pub default_message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default)]
    pub time_format: TimeFormat,
}

/// Application configuration.
///
/// Serialized to/from TOML at `~/.config/chronos/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub protection: ProtectionConfig,
    #[serde(default)]
    pub emergency: EmergencyConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    /// Run boot reconciliation when the daemon starts.
    #[serde(default = "default_true")]
    pub recover_on_start: bool,
}

fn default_tick_interval_ms() -> u64 {
    1000
}
fn default_catch_up_minutes() -> u32 {
    5
}
fn default_period_ms() -> u64 {
    500
}
fn default_floor() -> f32 {
    1.0
}
fn default_message() -> String {
    DEFAULT_EMERGENCY_MESSAGE.into()
}
fn default_true() -> bool {
    true
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            catch_up_minutes: default_catch_up_minutes(),
        }
    }
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            volume_override: false,
            period_ms: default_period_ms(),
            floor: default_floor(),
        }
    }
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            silence_ring_on_fire: false,
            default_message: default_message(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            protection: ProtectionConfig::default(),
            emergency: EmergencyConfig::default(),
            display: DisplayConfig::default(),
            recover_on_start: true,
        }
    }
}

/// Everything the engine reads from configuration, already converted.
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub dispatcher: DispatcherSettings,
    pub lifecycle: LifecycleSettings,
    pub protection: ProtectionSettings,
}

impl Config {
    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }

        let mut current = root;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn set_json_value_by_path(
        root: &mut serde_json::Value,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        let unknown = || ConfigError::UnknownKey(key.to_string());
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };

        let mut parts = key.split('.').peekable();
        if key.is_empty() {
            return Err(unknown());
        }

        let mut current = root;
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                let obj = current.as_object_mut().ok_or_else(unknown)?;
                let existing = obj.get(part).ok_or_else(unknown)?;

                let new_value = match existing {
                    serde_json::Value::Bool(_) => serde_json::Value::Bool(
                        value.parse::<bool>().map_err(|e| invalid(e.to_string()))?,
                    ),
                    serde_json::Value::Number(_) => {
                        if let Ok(n) = value.parse::<u64>() {
                            serde_json::Value::Number(n.into())
                        } else if let Ok(n) = value.parse::<f64>() {
                            serde_json::Number::from_f64(n)
                                .map(serde_json::Value::Number)
                                .ok_or_else(|| invalid(format!("cannot parse '{value}' as number")))?
                        } else {
                            return Err(invalid(format!("cannot parse '{value}' as number")));
                        }
                    }
                    serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                        serde_json::from_str(value).map_err(|e| invalid(e.to_string()))?
                    }
                    _ => serde_json::Value::String(value.into()),
                };

                obj.insert(part.to_string(), new_value);
                return Ok(());
            }

            current = current.get_mut(part).ok_or_else(unknown)?;
        }

        Err(unknown())
    }

    pub fn path() -> Result<PathBuf, ConfigError> {
        Ok(data_dir()?.join("config.toml"))
    }

    /// Load from the data directory, writing defaults on first run.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed,
    /// or if the default config cannot be written to disk.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| ConfigError::LoadFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
            Err(_) => {
                let cfg = Self::default();
                cfg.save_to(path)?;
                Ok(cfg)
            }
        }
    }

    /// Persist to the data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be serialized or written to disk.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let save_failed = |message: String| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| save_failed(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| save_failed(e.to_string()))
    }

    /// Get a config value as string by dot-separated key.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Set a config value by key without saving.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unknown or the value cannot be parsed
    /// into the key's type.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };
        let mut json = serde_json::to_value(&*self).map_err(|e| invalid(e.to_string()))?;
        Self::set_json_value_by_path(&mut json, key, value)?;
        let updated: Config = serde_json::from_value(json).map_err(|e| invalid(e.to_string()))?;
        updated.check().map_err(invalid)?;
        *self = updated;
        Ok(())
    }

    fn check(&self) -> Result<(), String> {
        if self.dispatcher.tick_interval_ms == 0 {
            return Err("tick interval must be positive".into());
        }
        if self.protection.period_ms == 0 {
            return Err("protection period must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.protection.floor) {
            return Err("floor must be between 0.0 and 1.0".into());
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.dispatcher.tick_interval_ms.max(1))
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            dispatcher: DispatcherSettings {
                catch_up_minutes: self.dispatcher.catch_up_minutes,
            },
            lifecycle: LifecycleSettings {
                silence_ring_on_emergency: self.emergency.silence_ring_on_fire,
                default_emergency_message: self.emergency.default_message.clone(),
            },
            protection: ProtectionSettings {
                volume_override: self.protection.volume_override,
                period: Duration::from_millis(self.protection.period_ms.max(1)),
                floor: self.protection.floor.clamp(0.0, 1.0),
            },
        }
    }

    /// Load from disk, returning default on error.
    /// This is a convenience method that never fails.
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }
}
