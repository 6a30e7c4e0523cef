use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::alarm::{AlarmId, EmergencyMethod};
use crate::engine::{AlarmState, DismissReason, FireOrigin};

/// Every state change in the engine produces an Event.
/// Front-ends render them; the CLI prints them as JSON lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    AlarmScheduled {
        alarm_id: AlarmId,
        active: bool,
        next_trigger: Option<NaiveDateTime>,
        at: NaiveDateTime,
    },
    /// Volatile state for the alarm was dropped; the definition is untouched.
    AlarmCanceled {
        alarm_id: AlarmId,
        at: NaiveDateTime,
    },
    AlarmToggled {
        alarm_id: AlarmId,
        active: bool,
        at: NaiveDateTime,
    },
    AlarmDeleted {
        alarm_id: AlarmId,
        at: NaiveDateTime,
    },
    AlarmFired {
        alarm_id: AlarmId,
        origin: FireOrigin,
        challenge_count: usize,
        emergency_at: Option<NaiveDateTime>,
        at: NaiveDateTime,
    },
    /// Became due while another session was active; fires once it ends.
    AlarmDeferred {
        alarm_id: AlarmId,
        behind: AlarmId,
        at: NaiveDateTime,
    },
    ChallengeAdvanced {
        alarm_id: AlarmId,
        challenge_id: String,
        completed: usize,
        total: usize,
        at: NaiveDateTime,
    },
    /// The challenge surface could not run a challenge. The ring continues.
    ChallengeFailed {
        alarm_id: AlarmId,
        challenge_id: String,
        reason: String,
        at: NaiveDateTime,
    },
    AlarmDismissed {
        alarm_id: AlarmId,
        reason: DismissReason,
        emergency_fired: bool,
        rang_secs: i64,
        at: NaiveDateTime,
    },
    /// One-time alarm switched itself off after being dismissed.
    AlarmDeactivated {
        alarm_id: AlarmId,
        at: NaiveDateTime,
    },
    WakeUpCheckScheduled {
        alarm_id: AlarmId,
        arrives_at: NaiveDateTime,
        confirm_window_min: u32,
        at: NaiveDateTime,
    },
    WakeUpCheckStarted {
        alarm_id: AlarmId,
        deadline: NaiveDateTime,
        at: NaiveDateTime,
    },
    WakeUpConfirmed {
        alarm_id: AlarmId,
        at: NaiveDateTime,
    },
    /// Confirmation window elapsed; the original alarm rings again.
    WakeUpCheckFailed {
        alarm_id: AlarmId,
        at: NaiveDateTime,
    },
    EmergencyFired {
        alarm_id: AlarmId,
        method: EmergencyMethod,
        delivered: bool,
        at: NaiveDateTime,
    },
    StateSnapshot {
        state: AlarmState,
        alarm_id: Option<AlarmId>,
        challenge_index: usize,
        challenge_total: usize,
        emergency_fired: bool,
        pending_wake_up_checks: usize,
        deferred: usize,
        next_wake: Option<NaiveDateTime>,
        at: NaiveDateTime,
    },
}

impl Event {
    pub fn alarm_id(&self) -> Option<&str> {
        match self {
            Event::AlarmScheduled { alarm_id, .. }
            | Event::AlarmCanceled { alarm_id, .. }
            | Event::AlarmToggled { alarm_id, .. }
            | Event::AlarmDeleted { alarm_id, .. }
            | Event::AlarmFired { alarm_id, .. }
            | Event::AlarmDeferred { alarm_id, .. }
            | Event::ChallengeAdvanced { alarm_id, .. }
            | Event::ChallengeFailed { alarm_id, .. }
            | Event::AlarmDismissed { alarm_id, .. }
            | Event::AlarmDeactivated { alarm_id, .. }
            | Event::WakeUpCheckScheduled { alarm_id, .. }
            | Event::WakeUpCheckStarted { alarm_id, .. }
            | Event::WakeUpConfirmed { alarm_id, .. }
            | Event::WakeUpCheckFailed { alarm_id, .. }
            | Event::EmergencyFired { alarm_id, .. } => Some(alarm_id),
            Event::StateSnapshot { alarm_id, .. } => alarm_id.as_deref(),
        }
    }
}
