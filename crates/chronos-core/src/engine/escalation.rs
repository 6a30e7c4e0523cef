//! Per-alarm cancelable delayed tasks.
//!
//! Every pending task is a `(deadline, payload)` entry keyed by
//! `(alarm id, kind)`. Nothing runs on its own: the dispatcher compares
//! deadlines against `now` on each tick. Scheduling replaces any existing
//! entry for the same key, and canceling a missing entry is a no-op, so
//! cancellation is complete the moment the map removal returns.

use std::collections::HashMap;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::alarm::{AlarmDefinition, AlarmId, EmergencySpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationKind {
    /// Arrival of a wake-up check after dismissal.
    WakeUpCheck,
    /// Deadline for confirming a wake-up check that is on screen.
    ConfirmDeadline,
    /// Emergency-contact escalation for an un-dismissed ring.
    Emergency,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EscalationPayload {
    WakeUpCheck {
        confirm_window: Duration,
        /// The definition as it was when the ring was dismissed.
        snapshot: Box<AlarmDefinition>,
    },
    ConfirmDeadline,
    Emergency {
        spec: EmergencySpec,
    },
}

impl EscalationPayload {
    pub fn kind(&self) -> EscalationKind {
        match self {
            EscalationPayload::WakeUpCheck { .. } => EscalationKind::WakeUpCheck,
            EscalationPayload::ConfirmDeadline => EscalationKind::ConfirmDeadline,
            EscalationPayload::Emergency { .. } => EscalationKind::Emergency,
        }
    }
}

/// Identifies one scheduling call. Replacing a task issues a new token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskToken(u64);

#[derive(Debug, Clone, PartialEq)]
pub struct PendingTask {
    pub alarm_id: AlarmId,
    pub deadline: NaiveDateTime,
    pub payload: EscalationPayload,
    pub token: TaskToken,
}

#[derive(Debug, Default)]
pub struct EscalationScheduler {
    tasks: HashMap<(AlarmId, EscalationKind), PendingTask>,
    next_token: u64,
}

impl EscalationScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a wake-up check arriving `arrival_delay` from `now`.
    pub fn schedule_wake_up_check(
        &mut self,
        snapshot: &AlarmDefinition,
        now: NaiveDateTime,
        arrival_delay: Duration,
        confirm_window: Duration,
    ) -> &PendingTask {
        self.insert(
            snapshot.id.clone(),
            now + arrival_delay,
            EscalationPayload::WakeUpCheck {
                confirm_window,
                snapshot: Box::new(snapshot.clone()),
            },
        )
    }

    /// Queue the emergency action `fire_delay` from `now`.
    pub fn schedule_emergency(
        &mut self,
        alarm_id: &str,
        now: NaiveDateTime,
        fire_delay: Duration,
        spec: EmergencySpec,
    ) -> &PendingTask {
        self.insert(
            alarm_id.to_string(),
            now + fire_delay,
            EscalationPayload::Emergency { spec },
        )
    }

    pub fn schedule_confirm_deadline(
        &mut self,
        alarm_id: &str,
        deadline: NaiveDateTime,
    ) -> &PendingTask {
        self.insert(alarm_id.to_string(), deadline, EscalationPayload::ConfirmDeadline)
    }

    /// Remove one task. Returns it if it existed.
    pub fn cancel(&mut self, alarm_id: &str, kind: EscalationKind) -> Option<PendingTask> {
        self.tasks.remove(&(alarm_id.to_string(), kind))
    }

    /// Remove every task for `alarm_id`. Returns how many were removed.
    pub fn cancel_all(&mut self, alarm_id: &str) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|(id, _), _| id != alarm_id);
        before - self.tasks.len()
    }

    pub fn get(&self, alarm_id: &str, kind: EscalationKind) -> Option<&PendingTask> {
        self.tasks.get(&(alarm_id.to_string(), kind))
    }

    pub fn is_due(&self, alarm_id: &str, kind: EscalationKind, now: NaiveDateTime) -> bool {
        self.get(alarm_id, kind).is_some_and(|t| t.deadline <= now)
    }

    /// Remove and return the task for `(alarm_id, kind)` if its deadline has passed.
    pub fn take_if_due(
        &mut self,
        alarm_id: &str,
        kind: EscalationKind,
        now: NaiveDateTime,
    ) -> Option<PendingTask> {
        if self.is_due(alarm_id, kind, now) {
            self.cancel(alarm_id, kind)
        } else {
            None
        }
    }

    /// Remove and return the earliest due task of `kind`, ties broken by token.
    pub fn take_earliest_due(
        &mut self,
        kind: EscalationKind,
        now: NaiveDateTime,
    ) -> Option<PendingTask> {
        let key = self
            .tasks
            .iter()
            .filter(|((_, k), t)| *k == kind && t.deadline <= now)
            .min_by_key(|(_, t)| (t.deadline, t.token))
            .map(|(key, _)| key.clone())?;
        self.tasks.remove(&key)
    }

    /// Pending tasks of `kind`, earliest first.
    pub fn pending(&self, kind: EscalationKind) -> Vec<&PendingTask> {
        let mut tasks: Vec<&PendingTask> = self
            .tasks
            .iter()
            .filter(|((_, k), _)| *k == kind)
            .map(|(_, t)| t)
            .collect();
        tasks.sort_by_key(|t| (t.deadline, t.token));
        tasks
    }

    pub fn next_deadline(&self) -> Option<NaiveDateTime> {
        self.tasks.values().map(|t| t.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
    }

    fn insert(
        &mut self,
        alarm_id: AlarmId,
        deadline: NaiveDateTime,
        payload: EscalationPayload,
    ) -> &PendingTask {
        self.next_token += 1;
        let key = (alarm_id.clone(), payload.kind());
        let task = PendingTask {
            alarm_id,
            deadline,
            payload,
            token: TaskToken(self.next_token),
        };
        self.tasks.insert(key.clone(), task);
        &self.tasks[&key]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{DaySet, EmergencyMethod};
    use chrono::NaiveDate;

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(7, 0, 0)
            .unwrap()
    }

    fn spec() -> EmergencySpec {
        EmergencySpec {
            enabled: true,
            contact_name: "Sam".into(),
            contact_number: "+15550100".into(),
            method: EmergencyMethod::Sms,
            message: None,
            trigger_delay: 10,
        }
    }

    #[test]
    fn rescheduling_replaces_instead_of_duplicating() {
        let mut sched = EscalationScheduler::new();
        let first = sched
            .schedule_emergency("a", t0(), Duration::minutes(10), spec())
            .token;
        let second = sched
            .schedule_emergency("a", t0(), Duration::minutes(20), spec())
            .token;
        assert_ne!(first, second);
        assert_eq!(sched.len(), 1);
        assert_eq!(
            sched.get("a", EscalationKind::Emergency).unwrap().deadline,
            t0() + Duration::minutes(20)
        );
    }

    #[test]
    fn cancel_missing_is_noop() {
        let mut sched = EscalationScheduler::new();
        assert!(sched.cancel("ghost", EscalationKind::WakeUpCheck).is_none());
        assert_eq!(sched.cancel_all("ghost"), 0);
    }

    #[test]
    fn kinds_are_independent_per_alarm() {
        let mut sched = EscalationScheduler::new();
        let def = AlarmDefinition::new(7, 0, DaySet::EMPTY).unwrap();
        sched.schedule_wake_up_check(&def, t0(), Duration::minutes(5), Duration::minutes(1));
        sched.schedule_emergency(&def.id, t0(), Duration::minutes(10), spec());
        assert_eq!(sched.len(), 2);
        sched.cancel(&def.id, EscalationKind::Emergency);
        assert!(sched.get(&def.id, EscalationKind::WakeUpCheck).is_some());
        assert_eq!(sched.cancel_all(&def.id), 1);
        assert!(sched.is_empty());
    }

    #[test]
    fn take_if_due_respects_deadline() {
        let mut sched = EscalationScheduler::new();
        sched.schedule_confirm_deadline("a", t0() + Duration::minutes(1));
        assert!(sched
            .take_if_due("a", EscalationKind::ConfirmDeadline, t0())
            .is_none());
        let task = sched
            .take_if_due("a", EscalationKind::ConfirmDeadline, t0() + Duration::minutes(1))
            .unwrap();
        assert_eq!(task.payload, EscalationPayload::ConfirmDeadline);
        assert!(sched.is_empty());
    }

    #[test]
    fn earliest_due_wins() {
        let mut sched = EscalationScheduler::new();
        let late = AlarmDefinition::new(7, 0, DaySet::EMPTY).unwrap();
        let early = AlarmDefinition::new(7, 0, DaySet::EMPTY).unwrap();
        sched.schedule_wake_up_check(&late, t0(), Duration::minutes(5), Duration::minutes(1));
        sched.schedule_wake_up_check(&early, t0(), Duration::minutes(3), Duration::minutes(1));

        let now = t0() + Duration::minutes(6);
        let first = sched
            .take_earliest_due(EscalationKind::WakeUpCheck, now)
            .unwrap();
        assert_eq!(first.alarm_id, early.id);
        assert_eq!(sched.next_deadline(), Some(t0() + Duration::minutes(5)));
        assert_eq!(sched.pending(EscalationKind::WakeUpCheck).len(), 1);
    }
}
