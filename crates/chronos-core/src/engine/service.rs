//! The engine's public surface.
//!
//! [`AlarmEngine`] owns the volatile state, the lifecycle controller and the
//! dispatcher, and is the only place transitions are entered from outside.
//! It is a plain `&mut self` object; callers that share it across tasks wrap
//! it in one mutex so transitions never interleave.

use std::sync::Arc;

use chrono::NaiveDateTime;
use tracing::info;

use super::collaborators::{AlarmStore, Collaborators};
use super::dispatcher::Dispatcher;
use super::escalation::EscalationKind;
use super::lifecycle::{AlarmState, EngineState, LifecycleController};
use crate::alarm::{next_trigger, AlarmDefinition, AlarmId};
use crate::error::{ChallengeError, CoreError, Result, StoreError};
use crate::events::Event;
use crate::storage::EngineSettings;

pub struct AlarmEngine {
    state: EngineState,
    lifecycle: LifecycleController,
    dispatcher: Dispatcher,
}

impl AlarmEngine {
    pub fn new(collaborators: Collaborators, settings: &EngineSettings) -> Self {
        Self {
            state: EngineState::new(),
            lifecycle: LifecycleController::new(
                &collaborators,
                settings.lifecycle.clone(),
                settings.protection.clone(),
            ),
            dispatcher: Dispatcher::new(
                collaborators.registrar.clone(),
                settings.dispatcher.clone(),
            ),
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn store(&self) -> &Arc<dyn AlarmStore> {
        self.lifecycle.store()
    }

    pub fn volume_protected(&self) -> bool {
        self.lifecycle.protection().is_running()
    }

    pub fn snapshot(&self, now: NaiveDateTime) -> Event {
        let session = self.state.session();
        Event::StateSnapshot {
            state: session
                .map(|s| self.state.alarm_state(s.alarm_id()))
                .unwrap_or(AlarmState::Idle),
            alarm_id: session.map(|s| s.alarm.id.clone()),
            challenge_index: session.map_or(0, |s| s.challenge_index),
            challenge_total: session.map_or(0, |s| s.alarm.challenges.len()),
            emergency_fired: session.is_some_and(|s| s.emergency_fired),
            pending_wake_up_checks: self
                .state
                .escalation()
                .pending(EscalationKind::WakeUpCheck)
                .len(),
            deferred: self.state.deferred().count(),
            next_wake: self.dispatcher.registered_wake(),
            at: now,
        }
    }

    // ── Clock-driven ─────────────────────────────────────────────────

    pub fn tick(&mut self, now: NaiveDateTime) -> Vec<Event> {
        let events = self.dispatcher.tick(&mut self.lifecycle, &mut self.state, now);
        self.rearm(now);
        events
    }

    /// Host wake-up callback for `alarm_id`.
    pub fn on_wake(&mut self, alarm_id: &str, now: NaiveDateTime) -> Vec<Event> {
        let events = self
            .dispatcher
            .on_wake(&mut self.lifecycle, &mut self.state, alarm_id, now);
        self.rearm(now);
        events
    }

    /// Boot reconciliation; see [`Dispatcher::recover`].
    pub fn recover(&mut self, now: NaiveDateTime) -> Vec<(AlarmId, NaiveDateTime)> {
        self.dispatcher
            .recover(&mut self.lifecycle, &mut self.state, now)
    }

    pub fn rearm(&mut self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        self.dispatcher.rearm(&self.lifecycle, &self.state, now)
    }

    // ── User-facing operations ───────────────────────────────────────

    /// Create or replace a definition. An inactive definition loses any
    /// volatile state it had.
    pub fn schedule_alarm(&mut self, def: AlarmDefinition, now: NaiveDateTime) -> Result<Vec<Event>> {
        def.validate()?;
        self.store().upsert(&def)?;

        let mut events = Vec::new();
        if !def.active {
            events.extend(self.lifecycle.cancel_alarm(&mut self.state, &def.id, now));
        }
        let next = def.active.then(|| next_trigger(&def, now));
        info!(
            alarm_id = %def.id,
            time = %def.time_str(),
            days = %def.days,
            active = def.active,
            "alarm scheduled"
        );
        events.push(Event::AlarmScheduled {
            alarm_id: def.id,
            active: def.active,
            next_trigger: next,
            at: now,
        });
        self.rearm(now);
        Ok(events)
    }

    /// Drop the alarm's volatile state (session, pending checks, emergency,
    /// deferred entry). The definition is untouched.
    pub fn cancel_alarm(&mut self, alarm_id: &str, now: NaiveDateTime) -> Vec<Event> {
        let events = self.lifecycle.cancel_alarm(&mut self.state, alarm_id, now);
        self.rearm(now);
        events
    }

    pub fn dismiss(&mut self, now: NaiveDateTime) -> Vec<Event> {
        let events = self.lifecycle.on_dismiss(&mut self.state, now);
        self.rearm(now);
        events
    }

    pub fn complete_challenge(&mut self, challenge_id: &str, now: NaiveDateTime) -> Vec<Event> {
        let events = self
            .lifecycle
            .on_challenge_completed(&mut self.state, challenge_id, now);
        self.rearm(now);
        events
    }

    pub fn fail_challenge(
        &mut self,
        challenge_id: &str,
        error: &ChallengeError,
        now: NaiveDateTime,
    ) -> Vec<Event> {
        self.lifecycle
            .on_challenge_failed(&self.state, challenge_id, error, now)
    }

    pub fn confirm_wake_up(&mut self, now: NaiveDateTime) -> Vec<Event> {
        let events = self.lifecycle.on_wake_up_confirm(&mut self.state, now);
        self.rearm(now);
        events
    }

    /// Flip the active flag. Switching off force-dismisses a ringing session
    /// and removes any pending wake-up check or emergency for the alarm.
    pub fn toggle_alarm(&mut self, alarm_id: &str, now: NaiveDateTime) -> Result<Vec<Event>> {
        let mut def = self
            .store()
            .get(alarm_id)?
            .ok_or_else(|| StoreError::NotFound(alarm_id.to_string()))?;
        def.active = !def.active;
        self.store().upsert(&def)?;

        let mut events = Vec::new();
        if !def.active {
            events.extend(self.lifecycle.cancel_alarm(&mut self.state, alarm_id, now));
        }
        info!(alarm_id, active = def.active, "alarm toggled");
        events.push(Event::AlarmToggled {
            alarm_id: def.id,
            active: def.active,
            at: now,
        });
        self.rearm(now);
        Ok(events)
    }

    /// Remove the definition, then its volatile state. A failed delete
    /// leaves a ringing session untouched.
    pub fn delete_alarm(&mut self, alarm_id: &str, now: NaiveDateTime) -> Result<Vec<Event>> {
        if !self.store().delete(alarm_id)? {
            return Err(CoreError::Store(StoreError::NotFound(alarm_id.to_string())));
        }
        let mut events = self.lifecycle.cancel_alarm(&mut self.state, alarm_id, now);
        info!(alarm_id, "alarm deleted");
        events.push(Event::AlarmDeleted {
            alarm_id: alarm_id.to_string(),
            at: now,
        });
        self.rearm(now);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{DaySet, WakeUpCheckSpec};
    use crate::storage::MemoryStore;
    use crate::testing::{monday_at as at, Fakes};

    fn engine(fakes: &Fakes) -> AlarmEngine {
        AlarmEngine::new(fakes.collaborators(), &EngineSettings::default())
    }

    fn with_check(mut def: AlarmDefinition) -> AlarmDefinition {
        def.wake_up_check = Some(WakeUpCheckSpec {
            enabled: true,
            check_delay: 5,
            confirm_window: 1,
        });
        def
    }

    #[test]
    fn schedule_rejects_invalid_definition() {
        let fakes = Fakes::new();
        let mut engine = engine(&fakes);
        let mut def = AlarmDefinition::new(7, 0, DaySet::EMPTY).unwrap();
        def.hour = 24;
        assert!(matches!(
            engine.schedule_alarm(def, at(6, 0, 0)),
            Err(CoreError::Validation(_))
        ));
        assert!(fakes.store.list().unwrap().is_empty());
    }

    #[test]
    fn schedule_reports_next_trigger_and_arms_host() {
        let fakes = Fakes::new();
        let mut engine = engine(&fakes);
        let def = AlarmDefinition::new(7, 0, DaySet::EMPTY).unwrap();
        let events = engine.schedule_alarm(def, at(6, 0, 0)).unwrap();
        assert!(matches!(
            events[0],
            Event::AlarmScheduled { next_trigger: Some(t), .. } if t == at(7, 0, 0)
        ));
        assert_eq!(fakes.registrar.exact(), vec![at(7, 0, 0)]);
    }

    #[test]
    fn toggle_off_removes_pending_wake_up_check() {
        let fakes = Fakes::new();
        let mut engine = engine(&fakes);
        let def = with_check(AlarmDefinition::new(7, 0, DaySet::from_indices(&[1]).unwrap()).unwrap());
        engine.schedule_alarm(def.clone(), at(6, 0, 0)).unwrap();

        engine.tick(at(7, 0, 0));
        engine.dismiss(at(7, 0, 30));
        assert_eq!(engine.state().alarm_state(&def.id), AlarmState::WakeCheckPending);

        let events = engine.toggle_alarm(&def.id, at(7, 2, 0)).unwrap();
        assert!(events.iter().any(|e| matches!(e, Event::AlarmCanceled { .. })));
        assert!(engine.state().pending_wake_up_check(&def.id).is_none());
        assert!(!fakes.store.get(&def.id).unwrap().unwrap().active);

        // Nothing arrives at 07:05:30.
        let events = engine.tick(at(7, 5, 30));
        assert!(events.is_empty());
    }

    #[test]
    fn delete_while_ringing_forces_dismiss() {
        let fakes = Fakes::new();
        let mut engine = engine(&fakes);
        let mut def = AlarmDefinition::new(7, 0, DaySet::EMPTY).unwrap();
        def.challenges = vec![crate::alarm::ChallengeSpec::new(crate::alarm::ChallengeKind::Typing)];
        engine.schedule_alarm(def.clone(), at(6, 0, 0)).unwrap();
        engine.tick(at(7, 0, 0));

        let events = engine.delete_alarm(&def.id, at(7, 1, 0)).unwrap();
        assert!(matches!(events.last(), Some(Event::AlarmDeleted { .. })));
        assert!(engine.state().session().is_none());
        assert!(fakes.store.get(&def.id).unwrap().is_none());
        assert_eq!(fakes.audio.stops(), 1);
    }

    /// Delegates to a [`MemoryStore`] but refuses every delete.
    struct LockedForDelete(MemoryStore);

    impl AlarmStore for LockedForDelete {
        fn list(&self) -> std::result::Result<Vec<AlarmDefinition>, StoreError> {
            self.0.list()
        }

        fn get(&self, id: &str) -> std::result::Result<Option<AlarmDefinition>, StoreError> {
            self.0.get(id)
        }

        fn upsert(&self, def: &AlarmDefinition) -> std::result::Result<(), StoreError> {
            self.0.upsert(def)
        }

        fn delete(&self, _id: &str) -> std::result::Result<bool, StoreError> {
            Err(StoreError::Locked)
        }
    }

    #[test]
    fn failed_delete_keeps_alarm_ringing() {
        let fakes = Fakes::new();
        let store = Arc::new(LockedForDelete(MemoryStore::new()));
        let collaborators = Collaborators {
            store: store.clone(),
            ..fakes.collaborators()
        };
        let mut engine = AlarmEngine::new(collaborators, &EngineSettings::default());
        let def = AlarmDefinition::new(7, 0, DaySet::EMPTY).unwrap();
        engine.schedule_alarm(def.clone(), at(6, 0, 0)).unwrap();
        engine.tick(at(7, 0, 0));

        assert!(matches!(
            engine.delete_alarm(&def.id, at(7, 1, 0)),
            Err(CoreError::Store(StoreError::Locked))
        ));
        assert_eq!(engine.state().alarm_state(&def.id), AlarmState::Ringing);
        assert_eq!(fakes.audio.stops(), 0);
        assert!(store.get(&def.id).unwrap().is_some());
    }

    #[test]
    fn toggle_and_delete_unknown_are_not_found() {
        let fakes = Fakes::new();
        let mut engine = engine(&fakes);
        assert!(matches!(
            engine.toggle_alarm("ghost", at(7, 0, 0)),
            Err(CoreError::Store(StoreError::NotFound(_)))
        ));
        assert!(matches!(
            engine.delete_alarm("ghost", at(7, 0, 0)),
            Err(CoreError::Store(StoreError::NotFound(_)))
        ));
    }

    #[test]
    fn snapshot_reflects_session() {
        let fakes = Fakes::new();
        let mut engine = engine(&fakes);
        let def = AlarmDefinition::new(7, 0, DaySet::EMPTY).unwrap();
        engine.schedule_alarm(def.clone(), at(6, 0, 0)).unwrap();
        engine.tick(at(7, 0, 0));

        match engine.snapshot(at(7, 0, 1)) {
            Event::StateSnapshot {
                state, alarm_id, ..
            } => {
                assert_eq!(state, AlarmState::Ringing);
                assert_eq!(alarm_id.as_deref(), Some(def.id.as_str()));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
