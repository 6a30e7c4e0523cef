//! Boundaries to the world outside the engine.
//!
//! The engine only sees these traits. Audio, the challenge surface and the
//! emergency action are fire-and-forget: their failures are logged and the
//! alarm keeps ringing. The logging implementations at the bottom back the
//! CLI daemon, which has no speaker, screen or modem of its own.

use std::sync::{Arc, Mutex};

use chrono::{Local, NaiveDateTime};
use tracing::{debug, info, warn};

use crate::alarm::{AlarmDefinition, AudioSpec, ChallengeSpec, EmergencyMethod, EmergencySpec};
use crate::error::{AudioError, EmergencyError, StoreError, WakeRegistrationError};

/// Durable CRUD over alarm definitions. No ordering guarantees.
pub trait AlarmStore: Send + Sync {
    fn list(&self) -> Result<Vec<AlarmDefinition>, StoreError>;
    fn get(&self, id: &str) -> Result<Option<AlarmDefinition>, StoreError>;
    fn upsert(&self, def: &AlarmDefinition) -> Result<(), StoreError>;
    /// Returns whether a record was removed.
    fn delete(&self, id: &str) -> Result<bool, StoreError>;
}

/// Alarm sound output. `stop` must be safe on an already-stopped output.
pub trait AudioControl: Send + Sync {
    fn play(&self, spec: &AudioSpec) -> Result<(), AudioError>;
    fn stop(&self);
}

/// Renders challenges and wake-up checks. Completion comes back through
/// the engine's public operations, not through this trait.
pub trait ChallengeSurface: Send + Sync {
    fn present(&self, alarm_id: &str, challenge: &ChallengeSpec, position: usize, total: usize);
    fn present_wake_up_check(&self, alarm_id: &str, deadline: NaiveDateTime);
    fn clear(&self);
}

/// Sends the SMS or places the call.
pub trait EmergencyAction: Send + Sync {
    fn notify(&self, spec: &EmergencySpec) -> Result<(), EmergencyError>;
}

/// Output level in `0.0..=1.0`.
pub trait VolumeControl: Send + Sync {
    fn level(&self) -> f32;
    fn set_level(&self, level: f32);
}

/// Host "wake me at T" primitive.
pub trait WakeRegistrar: Send + Sync {
    fn register_exact(&self, at: NaiveDateTime) -> Result<(), WakeRegistrationError>;
    fn register_inexact(&self, at: NaiveDateTime) -> Result<(), WakeRegistrationError>;
}

/// Local wall clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Everything the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn AlarmStore>,
    pub audio: Arc<dyn AudioControl>,
    pub challenges: Arc<dyn ChallengeSurface>,
    pub emergency: Arc<dyn EmergencyAction>,
    pub volume: Arc<dyn VolumeControl>,
    pub registrar: Arc<dyn WakeRegistrar>,
}

impl Collaborators {
    /// Store plus log-only implementations of everything else.
    pub fn logging(store: Arc<dyn AlarmStore>) -> Self {
        Self {
            store,
            audio: Arc::new(LoggingAudio),
            challenges: Arc::new(LoggingChallengeSurface),
            emergency: Arc::new(LoggingEmergency),
            volume: Arc::new(SoftwareVolume::default()),
            registrar: Arc::new(PollingRegistrar),
        }
    }
}

// ── Log-only implementations ────────────────────────────────────────

#[derive(Debug, Default)]
pub struct LoggingAudio;

impl AudioControl for LoggingAudio {
    fn play(&self, spec: &AudioSpec) -> Result<(), AudioError> {
        info!(?spec, "audio: play");
        Ok(())
    }

    fn stop(&self) {
        info!("audio: stop");
    }
}

#[derive(Debug, Default)]
pub struct LoggingChallengeSurface;

impl ChallengeSurface for LoggingChallengeSurface {
    fn present(&self, alarm_id: &str, challenge: &ChallengeSpec, position: usize, total: usize) {
        info!(
            alarm_id,
            challenge_id = %challenge.id,
            kind = ?challenge.kind,
            "challenge {}/{}",
            position + 1,
            total
        );
    }

    fn present_wake_up_check(&self, alarm_id: &str, deadline: NaiveDateTime) {
        info!(alarm_id, %deadline, "are you awake? confirm before the deadline");
    }

    fn clear(&self) {}
}

#[derive(Debug, Default)]
pub struct LoggingEmergency;

impl EmergencyAction for LoggingEmergency {
    fn notify(&self, spec: &EmergencySpec) -> Result<(), EmergencyError> {
        match spec.method {
            EmergencyMethod::Sms => warn!(
                contact = %spec.contact_name,
                number = %spec.contact_number,
                body = spec.message.as_deref().unwrap_or_default(),
                "emergency SMS"
            ),
            EmergencyMethod::Call => warn!(
                contact = %spec.contact_name,
                number = %spec.contact_number,
                "emergency call"
            ),
        }
        Ok(())
    }
}

/// In-process volume knob.
#[derive(Debug)]
pub struct SoftwareVolume {
    level: Mutex<f32>,
}

impl SoftwareVolume {
    pub fn new(level: f32) -> Self {
        Self {
            level: Mutex::new(level.clamp(0.0, 1.0)),
        }
    }
}

impl Default for SoftwareVolume {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl VolumeControl for SoftwareVolume {
    fn level(&self) -> f32 {
        *self.level.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_level(&self, level: f32) {
        *self.level.lock().unwrap_or_else(|e| e.into_inner()) = level.clamp(0.0, 1.0);
    }
}

/// No host wake primitive: registrations are accepted as no-ops because the
/// daemon's own tick covers them.
#[derive(Debug, Default)]
pub struct PollingRegistrar;

impl WakeRegistrar for PollingRegistrar {
    fn register_exact(&self, at: NaiveDateTime) -> Result<(), WakeRegistrationError> {
        debug!(%at, "next wake-up (polled)");
        Ok(())
    }

    fn register_inexact(&self, _at: NaiveDateTime) -> Result<(), WakeRegistrationError> {
        Ok(())
    }
}
