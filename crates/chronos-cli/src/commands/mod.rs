pub mod alarm;
pub mod config;
pub mod run;

use std::sync::Arc;

use chronos_core::engine::{AlarmEngine, Collaborators};
use chronos_core::storage::AlarmDatabase;
use chronos_core::Config;

/// Engine over the on-disk store with log-only side effects.
pub(crate) fn open_engine(config: &Config) -> Result<AlarmEngine, Box<dyn std::error::Error>> {
    let db = AlarmDatabase::open()?;
    Ok(AlarmEngine::new(
        Collaborators::logging(Arc::new(db)),
        &config.engine_settings(),
    ))
}
