//! Recording collaborators.
//!
//! Every call is captured so tests (and embedding hosts that want a dry run)
//! can assert on what the engine asked the outside world to do.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, NaiveDateTime};

use crate::alarm::{AlarmDefinition, AudioSpec, ChallengeSpec, EmergencySpec};
use crate::engine::{
    AlarmStore, AudioControl, ChallengeSurface, Clock, Collaborators, EmergencyAction,
    SoftwareVolume, WakeRegistrar,
};
use crate::error::{AudioError, EmergencyError, StoreError, WakeRegistrationError};
use crate::storage::MemoryStore;

/// `2024-01-01` (a Monday) at the given wall-clock time.
pub fn monday_at(hour: u32, minute: u32, second: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .unwrap_or_default()
}

#[derive(Debug, Default)]
pub struct RecordingAudio {
    plays: Mutex<Vec<AudioSpec>>,
    stops: AtomicUsize,
}

impl RecordingAudio {
    pub fn plays(&self) -> Vec<AudioSpec> {
        self.plays.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl AudioControl for RecordingAudio {
    fn play(&self, spec: &AudioSpec) -> Result<(), AudioError> {
        self.plays
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(spec.clone());
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct RecordingSurface {
    presented: Mutex<Vec<String>>,
    wake_checks: Mutex<Vec<(String, NaiveDateTime)>>,
    clears: AtomicUsize,
}

impl RecordingSurface {
    /// Challenge ids in the order they were shown.
    pub fn presented(&self) -> Vec<String> {
        self.presented.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn wake_checks(&self) -> Vec<(String, NaiveDateTime)> {
        self.wake_checks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl ChallengeSurface for RecordingSurface {
    fn present(&self, _alarm_id: &str, challenge: &ChallengeSpec, _position: usize, _total: usize) {
        self.presented
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(challenge.id.clone());
    }

    fn present_wake_up_check(&self, alarm_id: &str, deadline: NaiveDateTime) {
        self.wake_checks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((alarm_id.to_string(), deadline));
    }

    fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct RecordingEmergency {
    calls: Mutex<Vec<EmergencySpec>>,
    next_error: Mutex<Option<EmergencyError>>,
}

impl RecordingEmergency {
    pub fn calls(&self) -> Vec<EmergencySpec> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Make the next `notify` fail with `error`. The call is still recorded.
    pub fn fail_with(&self, error: EmergencyError) {
        *self.next_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(error);
    }
}

impl EmergencyAction for RecordingEmergency {
    fn notify(&self, spec: &EmergencySpec) -> Result<(), EmergencyError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(spec.clone());
        match self.next_error.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Debug)]
pub struct RecordingRegistrar {
    exact_allowed: AtomicBool,
    exact: Mutex<Vec<NaiveDateTime>>,
    inexact: Mutex<Vec<NaiveDateTime>>,
}

impl Default for RecordingRegistrar {
    fn default() -> Self {
        Self {
            exact_allowed: AtomicBool::new(true),
            exact: Mutex::new(Vec::new()),
            inexact: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingRegistrar {
    pub fn refuse_exact(&self) {
        self.exact_allowed.store(false, Ordering::SeqCst);
    }

    pub fn exact(&self) -> Vec<NaiveDateTime> {
        self.exact.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn inexact(&self) -> Vec<NaiveDateTime> {
        self.inexact.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl WakeRegistrar for RecordingRegistrar {
    fn register_exact(&self, at: NaiveDateTime) -> Result<(), WakeRegistrationError> {
        if !self.exact_allowed.load(Ordering::SeqCst) {
            return Err(WakeRegistrationError::ExactNotPermitted);
        }
        self.exact
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(at);
        Ok(())
    }

    fn register_inexact(&self, at: NaiveDateTime) -> Result<(), WakeRegistrationError> {
        self.inexact
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(at);
        Ok(())
    }
}

/// A store whose every call fails.
#[derive(Debug, Default)]
pub struct BrokenStore;

impl AlarmStore for BrokenStore {
    fn list(&self) -> Result<Vec<AlarmDefinition>, StoreError> {
        Err(StoreError::Locked)
    }

    fn get(&self, _id: &str) -> Result<Option<AlarmDefinition>, StoreError> {
        Err(StoreError::Locked)
    }

    fn upsert(&self, _def: &AlarmDefinition) -> Result<(), StoreError> {
        Err(StoreError::Locked)
    }

    fn delete(&self, _id: &str) -> Result<bool, StoreError> {
        Err(StoreError::Locked)
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One of each recording collaborator around a [`MemoryStore`].
#[derive(Clone)]
pub struct Fakes {
    pub store: Arc<MemoryStore>,
    pub audio: Arc<RecordingAudio>,
    pub challenges: Arc<RecordingSurface>,
    pub emergency: Arc<RecordingEmergency>,
    pub volume: Arc<SoftwareVolume>,
    pub registrar: Arc<RecordingRegistrar>,
}

impl Fakes {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            audio: Arc::new(RecordingAudio::default()),
            challenges: Arc::new(RecordingSurface::default()),
            emergency: Arc::new(RecordingEmergency::default()),
            volume: Arc::new(SoftwareVolume::default()),
            registrar: Arc::new(RecordingRegistrar::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            store: self.store.clone(),
            audio: self.audio.clone(),
            challenges: self.challenges.clone(),
            emergency: self.emergency.clone(),
            volume: self.volume.clone(),
            registrar: self.registrar.clone(),
        }
    }

    /// Same fakes, but every store call fails.
    pub fn with_broken_store(&self) -> Collaborators {
        Collaborators {
            store: Arc::new(BrokenStore),
            ..self.collaborators()
        }
    }
}

impl Default for Fakes {
    fn default() -> Self {
        Self::new()
    }
}
