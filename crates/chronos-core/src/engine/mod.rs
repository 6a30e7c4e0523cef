//! Alarm lifecycle and escalation engine.

mod collaborators;
mod dispatcher;
mod escalation;
mod lifecycle;
mod protection;
mod service;

pub use collaborators::{
    AlarmStore, AudioControl, ChallengeSurface, Clock, Collaborators, EmergencyAction,
    LoggingAudio, LoggingChallengeSurface, LoggingEmergency, PollingRegistrar, SoftwareVolume,
    SystemClock, VolumeControl, WakeRegistrar,
};
pub use dispatcher::{minute_floor, Dispatcher, DispatcherSettings};
pub use escalation::{EscalationKind, EscalationPayload, EscalationScheduler, PendingTask, TaskToken};
pub use lifecycle::{
    ActiveAlarmSession, AlarmState, DismissReason, EngineState, FireOrigin, LifecycleController,
    LifecycleSettings, SessionKind, DEFAULT_EMERGENCY_MESSAGE,
};
pub use protection::{ProtectionLoop, ProtectionSettings, MAX_LEVEL};
pub use service::AlarmEngine;
