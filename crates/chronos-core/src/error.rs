//! Core error types for chronos-core.
//!
//! The lifecycle engine itself never fails a transition: collaborator
//! failures are logged and degrade to "the alarm keeps ringing". The types
//! here cover the outer surfaces (store CRUD, configuration, validation of
//! new definitions) and the small per-collaborator errors the engine logs.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for chronos-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Alarm store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Alarm store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failed to open the backing database
    #[error("Failed to open alarm store at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Database is locked
    #[error("Alarm store is locked")]
    Locked,

    /// A stored definition could not be decoded
    #[error("Corrupt alarm record '{id}': {message}")]
    Corrupt { id: String, message: String },

    /// No alarm with the given id
    #[error("Alarm not found: {0}")]
    NotFound(String),
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Unknown dot-path key
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Data directory could not be resolved or created
    #[error("Data directory unavailable: {0}")]
    DataDir(String),
}

/// Validation errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    /// Hour outside 0..24
    #[error("Invalid hour {0}: must be below 24")]
    InvalidHour(u32),

    /// Minute outside 0..60
    #[error("Invalid minute {0}: must be below 60")]
    InvalidMinute(u32),

    /// Weekday index outside 0..7
    #[error("Invalid weekday index {0}: expected 0 (Sunday) through 6 (Saturday)")]
    InvalidWeekday(u8),

    /// Same weekday listed twice
    #[error("Duplicate weekday index {0}")]
    DuplicateWeekday(u8),

    /// Malformed HH:MM string
    #[error("Invalid time '{0}': expected HH:MM (24h)")]
    InvalidTime(String),

    /// Invalid value
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

/// Audio control failure. Logged, never fatal.
#[derive(Error, Debug)]
#[error("audio: {0}")]
pub struct AudioError(pub String);

/// Emergency action (SMS / call) failure. Logged, not retried.
#[derive(Error, Debug)]
pub enum EmergencyError {
    #[error("permission denied for {0}")]
    PermissionDenied(String),
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),
}

/// Challenge surface failure. Surfaced to the UI; the session stays open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChallengeError {
    #[error("hardware unavailable: {0}")]
    HardwareUnavailable(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("{0}")]
    Other(String),
}

/// Wake-up registration refused by the host.
#[derive(Error, Debug)]
pub enum WakeRegistrationError {
    #[error("exact wake-ups not permitted")]
    ExactNotPermitted,
    #[error("wake-up registration failed: {0}")]
    Failed(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(err, _msg) => {
                if err.code == rusqlite::ErrorCode::DatabaseLocked {
                    StoreError::Locked
                } else {
                    StoreError::QueryFailed(err.to_string())
                }
            }
            _ => StoreError::QueryFailed(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Store(err.into())
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
