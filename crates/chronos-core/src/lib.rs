//! # Chronos Core Library
//!
//! The alarm lifecycle and escalation engine behind Chronos. It schedules
//! alarms, gates dismissal behind an ordered list of challenges, verifies
//! the user stayed awake, and escalates to an emergency contact when a ring
//! is never answered. The `chronos-cli` binary is a thin layer over it.
//!
//! ## Architecture
//!
//! - **Alarm model**: definitions, day sets and the pure next-trigger
//!   calculation
//! - **Engine**: a wall-clock driven state machine. The caller invokes
//!   `tick(now)` (or lets [`runtime::spawn_dispatcher`] do it) and every
//!   transition returns [`Event`]s
//! - **Storage**: SQLite alarm store and TOML configuration
//!
//! ## Key Components
//!
//! - [`AlarmEngine`]: the public surface; serializes all transitions
//! - [`AlarmDatabase`]: persistent alarm definitions
//! - [`Config`]: application configuration management
//! - [`Collaborators`]: the traits the engine drives (audio, challenge
//!   surface, emergency action, volume, wake registration)

pub mod alarm;
pub mod engine;
pub mod error;
pub mod events;
pub mod runtime;
pub mod storage;
pub mod testing;

pub use alarm::{next_trigger, AlarmDefinition, AlarmId, ChallengeSpec, DaySet};
pub use engine::{AlarmEngine, AlarmState, Collaborators, EngineState};
pub use error::{ConfigError, CoreError, StoreError, ValidationError};
pub use events::Event;
pub use storage::{AlarmDatabase, Config, EngineSettings, MemoryStore};
