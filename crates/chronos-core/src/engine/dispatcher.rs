//! Wall-clock driven event source.
//!
//! Each tick answers three questions in order: did a wake-up confirmation
//! window run out, is any alarm due, and did a pending wake-up check or
//! emergency become due. Ticks may arrive more often than once a minute or
//! late; an alarm fires at most once per matching minute either way.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDateTime, Timelike};
use tracing::{debug, info, warn};

use super::collaborators::WakeRegistrar;
use super::escalation::EscalationKind;
use super::lifecycle::{EngineState, FireOrigin, LifecycleController};
use crate::alarm::{next_trigger, AlarmDefinition, AlarmId};
use crate::events::Event;

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Already-elapsed minutes a late tick still fires.
    pub catch_up_minutes: u32,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            catch_up_minutes: 5,
        }
    }
}

pub struct Dispatcher {
    registrar: Arc<dyn WakeRegistrar>,
    settings: DispatcherSettings,
    last_tick: Option<NaiveDateTime>,
    /// Alarm id to the minute it last fired for.
    last_fired: HashMap<AlarmId, NaiveDateTime>,
    registered: Option<NaiveDateTime>,
}

/// Start of the calendar minute containing `t`.
pub fn minute_floor(t: NaiveDateTime) -> NaiveDateTime {
    t.with_nanosecond(0)
        .and_then(|t| t.with_second(0))
        .unwrap_or(t)
}

impl Dispatcher {
    pub fn new(registrar: Arc<dyn WakeRegistrar>, settings: DispatcherSettings) -> Self {
        Self {
            registrar,
            settings,
            last_tick: None,
            last_fired: HashMap::new(),
            registered: None,
        }
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    /// The instant last handed to the wake registrar.
    pub fn registered_wake(&self) -> Option<NaiveDateTime> {
        self.registered
    }

    pub fn tick(
        &mut self,
        lifecycle: &mut LifecycleController,
        state: &mut EngineState,
        now: NaiveDateTime,
    ) -> Vec<Event> {
        let mut events = Vec::new();

        let verifying = state
            .session
            .as_ref()
            .filter(|s| s.is_wake_up_verification())
            .map(|s| s.alarm_id().to_string());
        if let Some(id) = verifying {
            if state
                .escalation
                .take_if_due(&id, EscalationKind::ConfirmDeadline, now)
                .is_some()
            {
                events.extend(lifecycle.on_wake_up_expired(state, now));
            }
        }

        let alarms = match lifecycle.store().list() {
            Ok(alarms) => {
                self.last_fired
                    .retain(|id, _| alarms.iter().any(|a| &a.id == id));
                alarms
            }
            Err(e) => {
                warn!(error = %e, "alarm store unavailable; treating as no alarms");
                Vec::new()
            }
        };
        for (minute, alarm) in self.due_alarms(&alarms, now) {
            debug!(alarm_id = %alarm.id, %minute, "alarm due");
            events.extend(lifecycle.on_fire(state, alarm, now, FireOrigin::Scheduled));
        }

        events.extend(self.drain_deferred(lifecycle, state, now));

        if state.session.is_none() {
            if let Some(task) = state
                .escalation
                .take_earliest_due(EscalationKind::WakeUpCheck, now)
            {
                events.extend(lifecycle.promote_wake_up_check(state, task, now));
            }
        }

        let emergency_due = state
            .session
            .as_ref()
            .is_some_and(|s| state.escalation.is_due(s.alarm_id(), EscalationKind::Emergency, now));
        if emergency_due {
            events.extend(lifecycle.on_emergency_fire(state, now));
        }

        self.last_tick = Some(self.last_tick.map_or(now, |prev| prev.max(now)));
        events
    }

    /// Host "fire me at T" callback for `alarm_id`. Fires it if its minute
    /// is within the catch-up window and it has not fired for that minute,
    /// then runs a regular tick.
    pub fn on_wake(
        &mut self,
        lifecycle: &mut LifecycleController,
        state: &mut EngineState,
        alarm_id: &str,
        now: NaiveDateTime,
    ) -> Vec<Event> {
        let mut events = Vec::new();
        match lifecycle.store().get(alarm_id) {
            Ok(Some(alarm)) if alarm.active => match self.latest_matching_minute(&alarm, now) {
                Some(minute) if self.last_fired.get(alarm_id) != Some(&minute) => {
                    self.last_fired.insert(alarm.id.clone(), minute);
                    events.extend(lifecycle.on_fire(state, alarm, now, FireOrigin::WakeCallback));
                }
                Some(_) => debug!(alarm_id, "wake callback for an alarm that already fired"),
                None => debug!(alarm_id, %now, "stale wake callback ignored"),
            },
            Ok(_) => debug!(alarm_id, "wake callback for missing or inactive alarm"),
            Err(e) => warn!(alarm_id, error = %e, "store error in wake callback"),
        }
        events.extend(self.tick(lifecycle, state, now));
        events
    }

    /// Register the earliest upcoming instant with the host: exact first,
    /// inexact when refused. Never fails.
    pub fn rearm(
        &mut self,
        lifecycle: &LifecycleController,
        state: &EngineState,
        now: NaiveDateTime,
    ) -> Option<NaiveDateTime> {
        let alarms = list_or_empty(lifecycle);
        let next = alarms
            .iter()
            .filter(|a| a.active)
            .map(|a| next_trigger(a, now))
            .chain(state.escalation.next_deadline())
            .min();

        let Some(at) = next else {
            self.registered = None;
            return None;
        };
        if self.registered == Some(at) {
            return Some(at);
        }

        match self.registrar.register_exact(at) {
            Ok(()) => debug!(%at, "exact wake-up registered"),
            Err(exact_err) => {
                warn!(%at, error = %exact_err, "exact wake-up refused, falling back to inexact");
                if let Err(e) = self.registrar.register_inexact(at) {
                    warn!(%at, error = %e, "inexact wake-up registration failed; relying on ticks");
                }
            }
        }
        self.registered = Some(at);
        Some(at)
    }

    /// Boot reconciliation. Volatile state is discarded; the next trigger of
    /// every active alarm is recomputed from the store and the host wake-up
    /// re-armed. A store error counts as no alarms.
    pub fn recover(
        &mut self,
        lifecycle: &mut LifecycleController,
        state: &mut EngineState,
        now: NaiveDateTime,
    ) -> Vec<(AlarmId, NaiveDateTime)> {
        lifecycle.reset(state);
        self.last_tick = None;
        self.registered = None;

        let mut upcoming: Vec<(AlarmId, NaiveDateTime)> = list_or_empty(lifecycle)
            .into_iter()
            .filter(|a| a.active)
            .map(|a| {
                let next = next_trigger(&a, now);
                (a.id, next)
            })
            .collect();
        upcoming.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        info!(alarms = upcoming.len(), "recovered alarm schedule");
        self.rearm(lifecycle, state, now);
        upcoming
    }

    /// Alarms whose minute falls in `(last tick, now]`, bounded by the
    /// catch-up window, that have not fired for that minute. Earliest first.
    fn due_alarms(
        &mut self,
        alarms: &[AlarmDefinition],
        now: NaiveDateTime,
    ) -> Vec<(NaiveDateTime, AlarmDefinition)> {
        let current = minute_floor(now);
        let window_start = current - Duration::minutes(self.settings.catch_up_minutes as i64);
        let start = match self.last_tick {
            Some(prev) if prev < now => (minute_floor(prev) + Duration::minutes(1)).max(window_start),
            _ => current,
        }
        .min(current);

        let mut due = Vec::new();
        for alarm in alarms.iter().filter(|a| a.active) {
            let mut minute = current;
            while minute >= start {
                if alarm.matches_minute(minute) {
                    if self.last_fired.get(&alarm.id) != Some(&minute) {
                        self.last_fired.insert(alarm.id.clone(), minute);
                        due.push((minute, alarm.clone()));
                    }
                    break;
                }
                minute -= Duration::minutes(1);
            }
        }
        due.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        due
    }

    fn latest_matching_minute(&self, alarm: &AlarmDefinition, now: NaiveDateTime) -> Option<NaiveDateTime> {
        let current = minute_floor(now);
        (0..=self.settings.catch_up_minutes as i64)
            .map(|back| current - Duration::minutes(back))
            .find(|m| alarm.matches_minute(*m))
    }

    fn drain_deferred(
        &mut self,
        lifecycle: &mut LifecycleController,
        state: &mut EngineState,
        now: NaiveDateTime,
    ) -> Vec<Event> {
        while state.session.is_none() {
            let Some(id) = state.deferred.pop_front() else {
                break;
            };
            match lifecycle.store().get(&id) {
                Ok(Some(alarm)) if alarm.active => {
                    return lifecycle.on_fire(state, alarm, now, FireOrigin::Deferred);
                }
                Ok(_) => debug!(alarm_id = %id, "deferred alarm no longer active, dropped"),
                Err(e) => warn!(alarm_id = %id, error = %e, "deferred alarm unreadable, dropped"),
            }
        }
        Vec::new()
    }
}

fn list_or_empty(lifecycle: &LifecycleController) -> Vec<AlarmDefinition> {
    lifecycle.store().list().unwrap_or_else(|e| {
        warn!(error = %e, "alarm store unavailable; treating as no alarms");
        Vec::new()
    })
}
