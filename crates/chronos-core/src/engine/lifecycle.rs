//! Per-alarm lifecycle state machine.
//!
//! ## State Transitions
//!
//! ```text
//! Idle -> Ringing -> (challenges exhausted) -> Dismissed -> Idle
//! Idle -> WakeCheckPending -> WakeCheckActive -> { Confirmed -> Idle | Expired -> Ringing }
//! Ringing + EmergencyFired (overlay, the ring continues)
//! ```
//!
//! All volatile state lives in [`EngineState`], which every transition
//! borrows mutably. There is at most one [`ActiveAlarmSession`] at a time;
//! a wake-up verification on screen counts as a session too.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::collaborators::{
    AlarmStore, AudioControl, ChallengeSurface, Collaborators, EmergencyAction,
};
use super::escalation::{EscalationKind, EscalationPayload, EscalationScheduler, PendingTask};
use super::protection::{ProtectionLoop, ProtectionSettings};
use crate::alarm::{AlarmDefinition, AlarmId, ChallengeSpec};
use crate::error::ChallengeError;
use crate::events::Event;

pub const DEFAULT_EMERGENCY_MESSAGE: &str = "I am not waking up to my alarm. Please help.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmState {
    Idle,
    Ringing,
    WakeCheckPending,
    WakeCheckActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FireOrigin {
    /// Dispatcher tick found the alarm's minute.
    Scheduled,
    /// Host wake-up callback.
    WakeCallback,
    /// Was due during another session and waited for it to end.
    Deferred,
    /// Wake-up check went unconfirmed.
    WakeUpCheckFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DismissReason {
    ChallengesCleared,
    /// The alarm was toggled off, deleted or canceled mid-session.
    Forced,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionKind {
    Alarm,
    WakeUpVerification { deadline: NaiveDateTime },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveAlarmSession {
    /// Definition as it was when the session started.
    pub alarm: AlarmDefinition,
    pub started_at: NaiveDateTime,
    pub challenge_index: usize,
    pub emergency_fired: bool,
    pub kind: SessionKind,
}

impl ActiveAlarmSession {
    pub fn alarm_id(&self) -> &str {
        &self.alarm.id
    }

    pub fn is_wake_up_verification(&self) -> bool {
        matches!(self.kind, SessionKind::WakeUpVerification { .. })
    }

    pub fn current_challenge(&self) -> Option<&ChallengeSpec> {
        match self.kind {
            SessionKind::Alarm => self.alarm.challenges.get(self.challenge_index),
            SessionKind::WakeUpVerification { .. } => None,
        }
    }

    pub fn challenges_cleared(&self) -> bool {
        self.challenge_index >= self.alarm.challenges.len()
    }
}

/// The engine's whole volatile state.
#[derive(Debug, Default)]
pub struct EngineState {
    pub(crate) session: Option<ActiveAlarmSession>,
    pub(crate) escalation: EscalationScheduler,
    pub(crate) deferred: VecDeque<AlarmId>,
}

impl EngineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> Option<&ActiveAlarmSession> {
        self.session.as_ref()
    }

    pub fn escalation(&self) -> &EscalationScheduler {
        &self.escalation
    }

    pub fn deferred(&self) -> impl Iterator<Item = &str> {
        self.deferred.iter().map(String::as_str)
    }

    pub fn pending_wake_up_check(&self, alarm_id: &str) -> Option<&PendingTask> {
        self.escalation.get(alarm_id, EscalationKind::WakeUpCheck)
    }

    pub fn pending_emergency(&self, alarm_id: &str) -> Option<&PendingTask> {
        self.escalation.get(alarm_id, EscalationKind::Emergency)
    }

    /// Where `alarm_id` sits in the state machine right now.
    pub fn alarm_state(&self, alarm_id: &str) -> AlarmState {
        match &self.session {
            Some(s) if s.alarm_id() == alarm_id => {
                if s.is_wake_up_verification() {
                    AlarmState::WakeCheckActive
                } else {
                    AlarmState::Ringing
                }
            }
            _ if self.pending_wake_up_check(alarm_id).is_some() => AlarmState::WakeCheckPending,
            _ => AlarmState::Idle,
        }
    }

    /// Drop everything volatile. Used on boot reconciliation.
    pub fn reset(&mut self) {
        self.session = None;
        self.escalation.clear();
        self.deferred.clear();
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Stop the audio when the emergency fires. The session stays open.
    pub silence_ring_on_emergency: bool,
    pub default_emergency_message: String,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            silence_ring_on_emergency: false,
            default_emergency_message: DEFAULT_EMERGENCY_MESSAGE.into(),
        }
    }
}

pub struct LifecycleController {
    store: Arc<dyn AlarmStore>,
    audio: Arc<dyn AudioControl>,
    challenges: Arc<dyn ChallengeSurface>,
    emergency: Arc<dyn EmergencyAction>,
    protection: ProtectionLoop,
    settings: LifecycleSettings,
}

impl LifecycleController {
    pub fn new(
        collaborators: &Collaborators,
        settings: LifecycleSettings,
        protection: ProtectionSettings,
    ) -> Self {
        Self {
            store: collaborators.store.clone(),
            audio: collaborators.audio.clone(),
            challenges: collaborators.challenges.clone(),
            emergency: collaborators.emergency.clone(),
            protection: ProtectionLoop::new(collaborators.volume.clone(), protection),
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn AlarmStore> {
        &self.store
    }

    pub fn protection(&self) -> &ProtectionLoop {
        &self.protection
    }

    // ── Ringing ──────────────────────────────────────────────────────

    /// Start ringing `alarm`, or queue it if another session is active.
    /// That includes the alarm's own wake-up check; only a ring already in
    /// progress for the same alarm swallows the fire.
    ///
    /// Either way a pending wake-up check for the same alarm is dropped: the
    /// new ring supersedes it.
    pub fn on_fire(
        &mut self,
        state: &mut EngineState,
        alarm: AlarmDefinition,
        now: NaiveDateTime,
        origin: FireOrigin,
    ) -> Vec<Event> {
        state.escalation.cancel(&alarm.id, EscalationKind::WakeUpCheck);

        if let Some(current) = &state.session {
            let behind = current.alarm_id().to_string();
            if behind == alarm.id && !current.is_wake_up_verification() {
                debug!(alarm_id = %alarm.id, "already in session, ignoring fire");
                return Vec::new();
            }
            if !state.deferred.contains(&alarm.id) {
                state.deferred.push_back(alarm.id.clone());
            }
            info!(alarm_id = %alarm.id, %behind, "alarm due during another session, deferred");
            return vec![Event::AlarmDeferred {
                alarm_id: alarm.id,
                behind,
                at: now,
            }];
        }

        state.deferred.retain(|id| id != &alarm.id);
        vec![self.start_ringing(state, alarm, now, origin)]
    }

    fn start_ringing(
        &mut self,
        state: &mut EngineState,
        alarm: AlarmDefinition,
        now: NaiveDateTime,
        origin: FireOrigin,
    ) -> Event {
        if let Err(e) = self.audio.play(&alarm.audio) {
            warn!(alarm_id = %alarm.id, error = %e, "audio failed to start; session continues");
        }
        self.protection.start();

        let emergency_at = alarm.emergency_enabled().cloned().map(|spec| {
            let delay = Duration::minutes(spec.trigger_delay as i64);
            state
                .escalation
                .schedule_emergency(&alarm.id, now, delay, spec)
                .deadline
        });

        if let Some(first) = alarm.challenges.first() {
            self.challenges
                .present(&alarm.id, first, 0, alarm.challenges.len());
        }

        info!(
            alarm_id = %alarm.id,
            time = %alarm.time_str(),
            ?origin,
            challenges = alarm.challenges.len(),
            "alarm ringing"
        );

        let event = Event::AlarmFired {
            alarm_id: alarm.id.clone(),
            origin,
            challenge_count: alarm.challenges.len(),
            emergency_at,
            at: now,
        };
        state.session = Some(ActiveAlarmSession {
            alarm,
            started_at: now,
            challenge_index: 0,
            emergency_fired: false,
            kind: SessionKind::Alarm,
        });
        event
    }

    /// The surface reports `challenge_id` solved. Only the current challenge
    /// counts; anything else is ignored.
    pub fn on_challenge_completed(
        &mut self,
        state: &mut EngineState,
        challenge_id: &str,
        now: NaiveDateTime,
    ) -> Vec<Event> {
        let Some(session) = state.session.as_mut() else {
            return Vec::new();
        };
        let Some(current) = session.current_challenge() else {
            return Vec::new();
        };
        if current.id != challenge_id {
            debug!(
                alarm_id = %session.alarm.id,
                expected = %current.id,
                got = challenge_id,
                "out-of-order challenge completion ignored"
            );
            return Vec::new();
        }

        session.challenge_index += 1;
        let total = session.alarm.challenges.len();
        let mut events = vec![Event::ChallengeAdvanced {
            alarm_id: session.alarm.id.clone(),
            challenge_id: challenge_id.to_string(),
            completed: session.challenge_index,
            total,
            at: now,
        }];

        match session.current_challenge() {
            Some(next) => {
                self.challenges
                    .present(&session.alarm.id, next, session.challenge_index, total);
            }
            None => events.extend(self.finish(state, now, DismissReason::ChallengesCleared)),
        }
        events
    }

    /// The surface cannot run the challenge (missing hardware, permission).
    /// The session stays open and the challenge stays uncleared.
    pub fn on_challenge_failed(
        &mut self,
        state: &EngineState,
        challenge_id: &str,
        error: &ChallengeError,
        now: NaiveDateTime,
    ) -> Vec<Event> {
        let Some(session) = state.session.as_ref() else {
            return Vec::new();
        };
        warn!(
            alarm_id = %session.alarm.id,
            challenge_id,
            error = %error,
            "challenge error; alarm keeps ringing"
        );
        vec![Event::ChallengeFailed {
            alarm_id: session.alarm.id.clone(),
            challenge_id: challenge_id.to_string(),
            reason: error.to_string(),
            at: now,
        }]
    }

    /// User-initiated dismissal. Refused while challenges remain; on a
    /// wake-up verification it acts as the confirmation.
    pub fn on_dismiss(&mut self, state: &mut EngineState, now: NaiveDateTime) -> Vec<Event> {
        let Some(session) = state.session.as_ref() else {
            return Vec::new();
        };
        if session.is_wake_up_verification() {
            return self.on_wake_up_confirm(state, now);
        }
        if !session.challenges_cleared() {
            info!(
                alarm_id = %session.alarm.id,
                remaining = session.alarm.challenges.len() - session.challenge_index,
                "dismiss refused, challenges remain"
            );
            return Vec::new();
        }
        self.finish(state, now, DismissReason::ChallengesCleared)
    }

    /// End the ringing session. Stops audio and protection, cancels the
    /// pending emergency, then runs the post-dismissal rules.
    fn finish(
        &mut self,
        state: &mut EngineState,
        now: NaiveDateTime,
        reason: DismissReason,
    ) -> Vec<Event> {
        let Some(session) = state.session.take() else {
            return Vec::new();
        };
        self.teardown(state, &session);

        let alarm = session.alarm;
        info!(alarm_id = %alarm.id, ?reason, "alarm dismissed");
        let mut events = vec![Event::AlarmDismissed {
            alarm_id: alarm.id.clone(),
            reason,
            emergency_fired: session.emergency_fired,
            rang_secs: (now - session.started_at).num_seconds(),
            at: now,
        }];

        if reason == DismissReason::Forced {
            return events;
        }

        if alarm.is_one_time() && self.deactivate(&alarm.id) {
            events.push(Event::AlarmDeactivated {
                alarm_id: alarm.id.clone(),
                at: now,
            });
        }

        if let Some(check) = alarm.wake_up_check_enabled() {
            let arrives_at = state
                .escalation
                .schedule_wake_up_check(
                    &alarm,
                    now,
                    Duration::minutes(check.check_delay as i64),
                    Duration::minutes(check.confirm_window as i64),
                )
                .deadline;
            info!(alarm_id = %alarm.id, %arrives_at, "wake-up check scheduled");
            events.push(Event::WakeUpCheckScheduled {
                alarm_id: alarm.id.clone(),
                arrives_at,
                confirm_window_min: check.confirm_window,
                at: now,
            });
        }
        events
    }

    fn teardown(&mut self, state: &mut EngineState, session: &ActiveAlarmSession) {
        self.audio.stop();
        self.protection.stop();
        self.challenges.clear();
        state
            .escalation
            .cancel(session.alarm_id(), EscalationKind::Emergency);
        state
            .escalation
            .cancel(session.alarm_id(), EscalationKind::ConfirmDeadline);
    }

    fn deactivate(&self, alarm_id: &str) -> bool {
        match self.store.get(alarm_id) {
            Ok(Some(mut def)) if def.active => {
                def.active = false;
                match self.store.upsert(&def) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(alarm_id, error = %e, "failed to deactivate one-time alarm");
                        false
                    }
                }
            }
            Ok(_) => false,
            Err(e) => {
                warn!(alarm_id, error = %e, "failed to load one-time alarm for deactivation");
                false
            }
        }
    }

    // ── Emergency ────────────────────────────────────────────────────

    /// Fire the emergency action for the ringing session, at most once.
    pub fn on_emergency_fire(&mut self, state: &mut EngineState, now: NaiveDateTime) -> Vec<Event> {
        let Some(session) = state.session.as_mut() else {
            return Vec::new();
        };
        if session.emergency_fired || session.is_wake_up_verification() {
            return Vec::new();
        }
        let alarm_id = session.alarm.id.clone();
        let task = state.escalation.cancel(&alarm_id, EscalationKind::Emergency);
        let spec = match task.map(|t| t.payload) {
            Some(EscalationPayload::Emergency { spec }) => spec,
            _ => match session.alarm.emergency_enabled() {
                Some(spec) => spec.clone(),
                None => return Vec::new(),
            },
        };
        session.emergency_fired = true;

        let mut outgoing = spec.clone();
        if outgoing.message.is_none() {
            outgoing.message = Some(self.settings.default_emergency_message.clone());
        }
        let delivered = match self.emergency.notify(&outgoing) {
            Ok(()) => true,
            Err(e) => {
                warn!(%alarm_id, error = %e, "emergency action failed; not retrying");
                false
            }
        };
        info!(%alarm_id, method = ?spec.method, delivered, "emergency escalation fired");

        if self.settings.silence_ring_on_emergency {
            self.audio.stop();
        }
        vec![Event::EmergencyFired {
            alarm_id,
            method: spec.method,
            delivered,
            at: now,
        }]
    }

    // ── Wake-up verification ─────────────────────────────────────────

    /// Turn an arrived wake-up check into the active session.
    pub fn promote_wake_up_check(
        &mut self,
        state: &mut EngineState,
        task: PendingTask,
        now: NaiveDateTime,
    ) -> Vec<Event> {
        let EscalationPayload::WakeUpCheck {
            confirm_window,
            snapshot,
        } = task.payload
        else {
            return Vec::new();
        };
        if state.session.is_some() {
            // Put it back; the dispatcher retries once the session ends.
            state.escalation.schedule_wake_up_check(
                &snapshot,
                task.deadline,
                Duration::zero(),
                confirm_window,
            );
            return Vec::new();
        }

        let deadline = now + confirm_window;
        if let Err(e) = self.audio.play(&snapshot.audio) {
            warn!(alarm_id = %snapshot.id, error = %e, "audio failed to start for wake-up check");
        }
        self.protection.start();
        state
            .escalation
            .schedule_confirm_deadline(&snapshot.id, deadline);
        self.challenges.present_wake_up_check(&snapshot.id, deadline);
        info!(alarm_id = %snapshot.id, %deadline, "wake-up check on screen");

        let event = Event::WakeUpCheckStarted {
            alarm_id: snapshot.id.clone(),
            deadline,
            at: now,
        };
        state.session = Some(ActiveAlarmSession {
            alarm: *snapshot,
            started_at: now,
            challenge_index: 0,
            emergency_fired: false,
            kind: SessionKind::WakeUpVerification { deadline },
        });
        vec![event]
    }

    pub fn on_wake_up_confirm(&mut self, state: &mut EngineState, now: NaiveDateTime) -> Vec<Event> {
        match &state.session {
            Some(s) if s.is_wake_up_verification() => {}
            _ => return Vec::new(),
        }
        let Some(session) = state.session.take() else {
            return Vec::new();
        };
        self.teardown(state, &session);
        info!(alarm_id = %session.alarm.id, "wake-up confirmed");
        vec![Event::WakeUpConfirmed {
            alarm_id: session.alarm.id,
            at: now,
        }]
    }

    /// Confirmation window ran out: ring the original alarm again from the top.
    pub fn on_wake_up_expired(&mut self, state: &mut EngineState, now: NaiveDateTime) -> Vec<Event> {
        match &state.session {
            Some(s) if s.is_wake_up_verification() => {}
            _ => return Vec::new(),
        }
        let Some(session) = state.session.take() else {
            return Vec::new();
        };
        self.teardown(state, &session);
        warn!(alarm_id = %session.alarm.id, "wake-up check not confirmed, re-firing alarm");
        state.deferred.retain(|id| id != &session.alarm.id);
        let failed = Event::WakeUpCheckFailed {
            alarm_id: session.alarm.id.clone(),
            at: now,
        };
        let fired = self.start_ringing(state, session.alarm, now, FireOrigin::WakeUpCheckFailed);
        vec![failed, fired]
    }

    /// Silence everything and drop all volatile state without running any
    /// post-dismissal rules.
    pub fn reset(&mut self, state: &mut EngineState) {
        if state.session.is_some() {
            self.audio.stop();
            self.challenges.clear();
        }
        self.protection.stop();
        state.reset();
    }

    // ── External mutation ────────────────────────────────────────────

    /// Drop every piece of volatile state for `alarm_id`: force-dismiss its
    /// session, cancel its escalations and remove it from the deferred queue.
    pub fn cancel_alarm(
        &mut self,
        state: &mut EngineState,
        alarm_id: &str,
        now: NaiveDateTime,
    ) -> Vec<Event> {
        let mut events = Vec::new();
        if state.session.as_ref().is_some_and(|s| s.alarm_id() == alarm_id) {
            events.extend(self.finish(state, now, DismissReason::Forced));
        }
        let canceled = state.escalation.cancel_all(alarm_id);
        let before = state.deferred.len();
        state.deferred.retain(|id| id != alarm_id);
        if canceled > 0 || before != state.deferred.len() || !events.is_empty() {
            events.push(Event::AlarmCanceled {
                alarm_id: alarm_id.to_string(),
                at: now,
            });
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{ChallengeKind, DaySet, EmergencyMethod, EmergencySpec, WakeUpCheckSpec};
    use crate::testing::{monday_at as at, Fakes};
    use crate::error::EmergencyError;

    fn controller(fakes: &Fakes) -> LifecycleController {
        LifecycleController::new(
            &fakes.collaborators(),
            LifecycleSettings::default(),
            ProtectionSettings::default(),
        )
    }

    fn three_challenge_alarm() -> AlarmDefinition {
        let mut def = AlarmDefinition::new(7, 0, DaySet::EMPTY).unwrap();
        def.challenges = vec![
            ChallengeSpec::new(ChallengeKind::Math),
            ChallengeSpec::new(ChallengeKind::Burst),
            ChallengeSpec::new(ChallengeKind::Typing),
        ];
        def
    }

    fn emergency(delay: u32) -> EmergencySpec {
        EmergencySpec {
            enabled: true,
            contact_name: "Sam".into(),
            contact_number: "+15550100".into(),
            method: EmergencyMethod::Call,
            message: None,
            trigger_delay: delay,
        }
    }

    #[test]
    fn challenges_gate_in_list_order() {
        let fakes = Fakes::new();
        let mut ctl = controller(&fakes);
        let mut state = EngineState::new();
        let def = three_challenge_alarm();
        fakes.store.insert(def.clone());
        let ids: Vec<String> = def.challenges.iter().map(|c| c.id.clone()).collect();

        ctl.on_fire(&mut state, def.clone(), at(7, 0, 0), FireOrigin::Scheduled);
        assert_eq!(state.alarm_state(&def.id), AlarmState::Ringing);

        // Second challenge before the first: no effect.
        assert!(ctl.on_challenge_completed(&mut state, &ids[1], at(7, 0, 5)).is_empty());
        assert_eq!(state.session().unwrap().challenge_index, 0);

        ctl.on_challenge_completed(&mut state, &ids[0], at(7, 0, 10));
        ctl.on_challenge_completed(&mut state, &ids[1], at(7, 0, 20));
        assert!(state.session().is_some());
        assert_eq!(fakes.audio.stops(), 0);

        let events = ctl.on_challenge_completed(&mut state, &ids[2], at(7, 0, 30));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::AlarmDismissed { reason: DismissReason::ChallengesCleared, .. })));
        assert!(state.session().is_none());
        assert_eq!(fakes.audio.stops(), 1);
        assert_eq!(fakes.challenges.presented(), vec![ids[0].clone(), ids[1].clone(), ids[2].clone()]);
    }

    #[test]
    fn dismiss_refused_while_challenges_remain() {
        let fakes = Fakes::new();
        let mut ctl = controller(&fakes);
        let mut state = EngineState::new();
        let def = three_challenge_alarm();

        ctl.on_fire(&mut state, def, at(7, 0, 0), FireOrigin::Scheduled);
        assert!(ctl.on_dismiss(&mut state, at(7, 1, 0)).is_empty());
        assert!(state.session().is_some());
    }

    #[test]
    fn one_time_alarm_deactivates_on_dismiss() {
        let fakes = Fakes::new();
        let mut ctl = controller(&fakes);
        let mut state = EngineState::new();
        let def = AlarmDefinition::new(7, 0, DaySet::EMPTY).unwrap();
        fakes.store.insert(def.clone());

        ctl.on_fire(&mut state, def.clone(), at(7, 0, 0), FireOrigin::Scheduled);
        let events = ctl.on_dismiss(&mut state, at(7, 0, 30));
        assert!(events.iter().any(|e| matches!(e, Event::AlarmDeactivated { .. })));
        assert!(!fakes.store.get(&def.id).unwrap().unwrap().active);
    }

    #[test]
    fn dismiss_clears_pending_emergency_even_after_it_fired() {
        let fakes = Fakes::new();
        let mut ctl = controller(&fakes);
        let mut state = EngineState::new();
        let mut def = AlarmDefinition::new(8, 0, DaySet::EMPTY).unwrap();
        def.emergency = Some(emergency(10));

        ctl.on_fire(&mut state, def.clone(), at(8, 0, 0), FireOrigin::Scheduled);
        assert!(state.pending_emergency(&def.id).is_some());
        ctl.on_dismiss(&mut state, at(8, 1, 0));
        assert!(state.pending_emergency(&def.id).is_none());

        ctl.on_fire(&mut state, def.clone(), at(9, 0, 0), FireOrigin::Scheduled);
        ctl.on_emergency_fire(&mut state, at(9, 10, 0));
        // Re-arm by hand to mimic a stale entry, then dismiss.
        state
            .escalation
            .schedule_emergency(&def.id, at(9, 10, 0), Duration::minutes(1), emergency(1));
        ctl.on_dismiss(&mut state, at(9, 11, 0));
        assert!(state.pending_emergency(&def.id).is_none());
    }

    #[test]
    fn emergency_fires_once_and_ring_continues() {
        let fakes = Fakes::new();
        let mut ctl = controller(&fakes);
        let mut state = EngineState::new();
        let mut def = three_challenge_alarm();
        def.emergency = Some(emergency(10));

        ctl.on_fire(&mut state, def, at(8, 0, 0), FireOrigin::Scheduled);
        assert_eq!(ctl.on_emergency_fire(&mut state, at(8, 10, 0)).len(), 1);
        assert!(ctl.on_emergency_fire(&mut state, at(8, 11, 0)).is_empty());
        assert_eq!(fakes.emergency.calls().len(), 1);
        assert_eq!(
            fakes.emergency.calls()[0].message.as_deref(),
            Some(DEFAULT_EMERGENCY_MESSAGE)
        );
        assert!(state.session().unwrap().emergency_fired);
        assert_eq!(fakes.audio.stops(), 0);
    }

    #[test]
    fn emergency_failure_is_logged_not_fatal() {
        let fakes = Fakes::new();
        fakes
            .emergency
            .fail_with(EmergencyError::PermissionDenied("SMS".into()));
        let mut ctl = controller(&fakes);
        let mut state = EngineState::new();
        let mut def = AlarmDefinition::new(8, 0, DaySet::EMPTY).unwrap();
        def.emergency = Some(emergency(0));

        ctl.on_fire(&mut state, def, at(8, 0, 0), FireOrigin::Scheduled);
        let events = ctl.on_emergency_fire(&mut state, at(8, 0, 0));
        assert!(matches!(events[0], Event::EmergencyFired { delivered: false, .. }));
        assert!(state.session().unwrap().emergency_fired);
        assert!(ctl.on_emergency_fire(&mut state, at(8, 1, 0)).is_empty());
    }

    #[test]
    fn silence_on_emergency_keeps_session_open() {
        let fakes = Fakes::new();
        let mut ctl = LifecycleController::new(
            &fakes.collaborators(),
            LifecycleSettings {
                silence_ring_on_emergency: true,
                ..LifecycleSettings::default()
            },
            ProtectionSettings::default(),
        );
        let mut state = EngineState::new();
        let mut def = three_challenge_alarm();
        def.emergency = Some(emergency(1));

        ctl.on_fire(&mut state, def, at(8, 0, 0), FireOrigin::Scheduled);
        ctl.on_emergency_fire(&mut state, at(8, 1, 0));
        assert_eq!(fakes.audio.stops(), 1);
        assert!(state.session().is_some());
    }

    #[test]
    fn challenge_failure_keeps_session_open() {
        let fakes = Fakes::new();
        let mut ctl = controller(&fakes);
        let mut state = EngineState::new();
        let mut def = AlarmDefinition::new(7, 0, DaySet::EMPTY).unwrap();
        def.challenges = vec![ChallengeSpec::new(ChallengeKind::Bluetooth)];
        let challenge_id = def.challenges[0].id.clone();

        ctl.on_fire(&mut state, def, at(7, 0, 0), FireOrigin::Scheduled);
        let events = ctl.on_challenge_failed(
            &state,
            &challenge_id,
            &ChallengeError::HardwareUnavailable("no paired device".into()),
            at(7, 0, 5),
        );
        assert!(matches!(events[0], Event::ChallengeFailed { .. }));
        assert_eq!(state.session().unwrap().challenge_index, 0);
        assert_eq!(fakes.audio.stops(), 0);
    }

    #[test]
    fn second_alarm_is_deferred_and_its_check_cleared() {
        let fakes = Fakes::new();
        let mut ctl = controller(&fakes);
        let mut state = EngineState::new();
        let first = AlarmDefinition::new(7, 0, DaySet::EMPTY).unwrap();
        let second = AlarmDefinition::new(7, 0, DaySet::EMPTY).unwrap();
        state.escalation.schedule_wake_up_check(
            &second,
            at(6, 0, 0),
            Duration::minutes(90),
            Duration::minutes(1),
        );

        ctl.on_fire(&mut state, first.clone(), at(7, 0, 0), FireOrigin::Scheduled);
        let events = ctl.on_fire(&mut state, second.clone(), at(7, 0, 0), FireOrigin::Scheduled);
        assert!(matches!(&events[0], Event::AlarmDeferred { behind, .. } if *behind == first.id));
        assert_eq!(state.deferred().collect::<Vec<_>>(), vec![second.id.as_str()]);
        assert!(state.pending_wake_up_check(&second.id).is_none());
        assert_eq!(state.session().unwrap().alarm_id(), first.id);
    }

    #[test]
    fn own_fire_during_wake_up_check_is_deferred() {
        let fakes = Fakes::new();
        let mut ctl = controller(&fakes);
        let mut state = EngineState::new();
        let mut def = AlarmDefinition::new(7, 0, DaySet::EMPTY).unwrap();
        def.wake_up_check = Some(WakeUpCheckSpec {
            enabled: true,
            check_delay: 5,
            confirm_window: 1,
        });

        ctl.on_fire(&mut state, def.clone(), at(7, 0, 0), FireOrigin::Scheduled);
        ctl.on_dismiss(&mut state, at(7, 0, 30));
        let task = state
            .escalation
            .take_earliest_due(EscalationKind::WakeUpCheck, at(7, 5, 30))
            .unwrap();
        ctl.promote_wake_up_check(&mut state, task, at(7, 5, 30));

        // Ringing for the same alarm swallows a repeat fire; a check does not.
        let events = ctl.on_fire(&mut state, def.clone(), at(7, 5, 40), FireOrigin::Scheduled);
        assert!(matches!(&events[0], Event::AlarmDeferred { behind, .. } if *behind == def.id));
        assert_eq!(state.deferred().collect::<Vec<_>>(), vec![def.id.as_str()]);

        // Expiry re-fires the alarm, which also covers the queued entry.
        let events = ctl.on_wake_up_expired(&mut state, at(7, 6, 30));
        assert!(matches!(events[1], Event::AlarmFired { .. }));
        assert_eq!(state.deferred().count(), 0);
        assert!(ctl
            .on_fire(&mut state, def.clone(), at(7, 6, 40), FireOrigin::Scheduled)
            .is_empty());
    }

    #[test]
    fn wake_up_check_confirm_returns_idle() {
        let fakes = Fakes::new();
        let mut ctl = controller(&fakes);
        let mut state = EngineState::new();
        let mut def = AlarmDefinition::new(7, 0, DaySet::from_indices(&[1]).unwrap()).unwrap();
        def.wake_up_check = Some(WakeUpCheckSpec {
            enabled: true,
            check_delay: 5,
            confirm_window: 1,
        });

        ctl.on_fire(&mut state, def.clone(), at(7, 0, 0), FireOrigin::Scheduled);
        ctl.on_dismiss(&mut state, at(7, 0, 30));
        assert_eq!(state.alarm_state(&def.id), AlarmState::WakeCheckPending);

        let task = state
            .escalation
            .take_earliest_due(EscalationKind::WakeUpCheck, at(7, 5, 30))
            .unwrap();
        ctl.promote_wake_up_check(&mut state, task, at(7, 5, 30));
        assert_eq!(state.alarm_state(&def.id), AlarmState::WakeCheckActive);

        let events = ctl.on_wake_up_confirm(&mut state, at(7, 6, 0));
        assert!(matches!(events[0], Event::WakeUpConfirmed { .. }));
        assert_eq!(state.alarm_state(&def.id), AlarmState::Idle);
        assert!(state.escalation().is_empty());
    }

    #[test]
    fn cancel_forces_dismiss_without_new_check() {
        let fakes = Fakes::new();
        let mut ctl = controller(&fakes);
        let mut state = EngineState::new();
        let mut def = three_challenge_alarm();
        def.wake_up_check = Some(WakeUpCheckSpec {
            enabled: true,
            check_delay: 5,
            confirm_window: 1,
        });
        def.emergency = Some(emergency(10));

        ctl.on_fire(&mut state, def.clone(), at(7, 0, 0), FireOrigin::Scheduled);
        let events = ctl.cancel_alarm(&mut state, &def.id, at(7, 2, 0));
        assert!(matches!(
            events[0],
            Event::AlarmDismissed { reason: DismissReason::Forced, .. }
        ));
        assert!(state.session().is_none());
        assert!(state.escalation().is_empty());
        assert_eq!(fakes.audio.stops(), 1);
    }
}
