mod config;
pub mod database;
mod memory;

pub use config::{
    Config, DispatcherConfig, DisplayConfig, EmergencyConfig, EngineSettings, ProtectionConfig,
};
pub use database::AlarmDatabase;
pub use memory::MemoryStore;

use std::path::PathBuf;

use crate::error::ConfigError;

/// Returns `~/.config/chronos[-dev]/` based on CHRONOS_ENV.
///
/// Set CHRONOS_ENV=dev to use the development data directory, or
/// CHRONOS_DATA_DIR to point somewhere else entirely.
///
/// # Errors
/// Returns an error if creating the directory fails.
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    let dir = match std::env::var_os("CHRONOS_DATA_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => {
            let base_dir = dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".config");
            let env = std::env::var("CHRONOS_ENV").unwrap_or_else(|_| "production".to_string());
            if env == "dev" {
                base_dir.join("chronos-dev")
            } else {
                base_dir.join("chronos")
            }
        }
    };

    std::fs::create_dir_all(&dir)
        .map_err(|e| ConfigError::DataDir(format!("{}: {e}", dir.display())))?;
    Ok(dir)
}
