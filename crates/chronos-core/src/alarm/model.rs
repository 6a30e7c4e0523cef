//! Durable alarm definitions and the specs hanging off them.

use std::fmt;

use chrono::{Datelike, NaiveDateTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

pub type AlarmId = String;

/// Set of weekdays an alarm repeats on. Empty means one-time.
///
/// Serialized as a sorted list of indices, 0 = Sunday .. 6 = Saturday.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct DaySet(u8);

impl DaySet {
    pub const EMPTY: DaySet = DaySet(0);

    /// Build from Sunday-based indices, rejecting duplicates and values >= 7.
    pub fn from_indices(indices: &[u8]) -> Result<Self, ValidationError> {
        let mut bits = 0u8;
        for &idx in indices {
            if idx >= 7 {
                return Err(ValidationError::InvalidWeekday(idx));
            }
            let bit = 1 << idx;
            if bits & bit != 0 {
                return Err(ValidationError::DuplicateWeekday(idx));
            }
            bits |= bit;
        }
        Ok(DaySet(bits))
    }

    pub fn from_weekdays(days: impl IntoIterator<Item = Weekday>) -> Self {
        days.into_iter()
            .fold(DaySet::EMPTY, |set, day| set.with(day))
    }

    pub fn with(self, day: Weekday) -> Self {
        DaySet(self.0 | (1 << day.num_days_from_sunday()))
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.contains_index(day.num_days_from_sunday() as u8)
    }

    pub fn contains_index(&self, idx: u8) -> bool {
        idx < 7 && self.0 & (1 << idx) != 0
    }

    /// Sunday-based indices in ascending order.
    pub fn indices(&self) -> impl Iterator<Item = u8> + '_ {
        (0u8..7).filter(move |&i| self.contains_index(i))
    }
}

impl TryFrom<Vec<u8>> for DaySet {
    type Error = ValidationError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        DaySet::from_indices(&value)
    }
}

impl From<DaySet> for Vec<u8> {
    fn from(set: DaySet) -> Self {
        set.indices().collect()
    }
}

impl fmt::Display for DaySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
        if self.is_empty() {
            return write!(f, "once");
        }
        let names: Vec<&str> = self.indices().map(|i| NAMES[i as usize]).collect();
        write!(f, "{}", names.join(","))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChallengeKind {
    Math,
    Burst,
    Memory,
    Typing,
    Bluetooth,
    Velocity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Difficulty {
    Normal,
    Hard,
}

/// Parameters interpreted by the challenge surface only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChallengeParams {
    /// Burst taps, memory sequence length, math problem count, typing phrases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rounds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// km/h
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_speed: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeSpec {
    pub id: String,
    pub kind: ChallengeKind,
    #[serde(default)]
    pub params: ChallengeParams,
}

impl ChallengeSpec {
    pub fn new(kind: ChallengeKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            params: ChallengeParams::default(),
        }
    }

    pub fn with_params(mut self, params: ChallengeParams) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeUpCheckSpec {
    pub enabled: bool,
    /// Minutes after dismissal before the check arrives.
    pub check_delay: u32,
    /// Minutes the user has to confirm once the check arrives.
    pub confirm_window: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmergencyMethod {
    Sms,
    Call,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencySpec {
    pub enabled: bool,
    pub contact_name: String,
    pub contact_number: String,
    pub method: EmergencyMethod,
    /// SMS body. Ignored for calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Minutes after the ring starts.
    pub trigger_delay: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GeneratedTone {
    Classic,
    Digital,
    Zen,
    Hazard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemSound {
    Marimba,
    Cosmic,
    Ripple,
    Circuit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum AudioSpec {
    Generated { tone: GeneratedTone },
    System { sound: SystemSound },
    Url { url: String },
    File { name: String },
}

impl Default for AudioSpec {
    fn default() -> Self {
        AudioSpec::Generated {
            tone: GeneratedTone::Classic,
        }
    }
}

fn default_label() -> String {
    "ALARM".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmDefinition {
    pub id: AlarmId,
    pub hour: u32,
    pub minute: u32,
    #[serde(default = "default_label")]
    pub label: String,
    pub active: bool,
    #[serde(default)]
    pub days: DaySet,
    /// Dismissal gate, cleared strictly in order.
    #[serde(default)]
    pub challenges: Vec<ChallengeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_up_check: Option<WakeUpCheckSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emergency: Option<EmergencySpec>,
    #[serde(default)]
    pub audio: AudioSpec,
}

impl AlarmDefinition {
    /// New active alarm with a fresh id.
    pub fn new(hour: u32, minute: u32, days: DaySet) -> Result<Self, ValidationError> {
        let alarm = Self {
            id: Uuid::new_v4().to_string(),
            hour,
            minute,
            label: default_label(),
            active: true,
            days,
            challenges: Vec::new(),
            wake_up_check: None,
            emergency: None,
            audio: AudioSpec::default(),
        };
        alarm.validate()?;
        Ok(alarm)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.hour >= 24 {
            return Err(ValidationError::InvalidHour(self.hour));
        }
        if self.minute >= 60 {
            return Err(ValidationError::InvalidMinute(self.minute));
        }
        if let Some(em) = &self.emergency {
            if em.enabled && em.contact_number.trim().is_empty() {
                return Err(ValidationError::InvalidValue {
                    field: "emergency.contact_number".into(),
                    message: "required when emergency escalation is enabled".into(),
                });
            }
        }
        Ok(())
    }

    pub fn is_one_time(&self) -> bool {
        self.days.is_empty()
    }

    pub fn wake_up_check_enabled(&self) -> Option<WakeUpCheckSpec> {
        self.wake_up_check.filter(|w| w.enabled)
    }

    pub fn emergency_enabled(&self) -> Option<&EmergencySpec> {
        self.emergency.as_ref().filter(|e| e.enabled)
    }

    /// Whether this alarm rings in the calendar minute containing `at`.
    pub fn matches_minute(&self, at: NaiveDateTime) -> bool {
        self.active
            && at.hour() == self.hour
            && at.minute() == self.minute
            && (self.days.is_empty() || self.days.contains(at.weekday()))
    }

    /// `HH:MM` in 24h form.
    pub fn time_str(&self) -> String {
        format!("{:02}:{:02}", self.hour, self.minute)
    }
}

/// Parse `HH:MM` (24h) into hour and minute.
pub fn parse_time(s: &str) -> Result<(u32, u32), ValidationError> {
    let invalid = || ValidationError::InvalidTime(s.to_string());
    let (h, m) = s.trim().split_once(':').ok_or_else(invalid)?;
    let hour: u32 = h.parse().map_err(|_| invalid())?;
    let minute: u32 = m.parse().map_err(|_| invalid())?;
    if hour >= 24 {
        return Err(ValidationError::InvalidHour(hour));
    }
    if minute >= 60 {
        return Err(ValidationError::InvalidMinute(minute));
    }
    Ok((hour, minute))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn dayset_rejects_duplicates_and_out_of_range() {
        assert_eq!(
            DaySet::from_indices(&[1, 3, 1]),
            Err(ValidationError::DuplicateWeekday(1))
        );
        assert_eq!(
            DaySet::from_indices(&[7]),
            Err(ValidationError::InvalidWeekday(7))
        );
        let set = DaySet::from_indices(&[5, 1, 3]).unwrap();
        assert_eq!(set.indices().collect::<Vec<_>>(), vec![1, 3, 5]);
        assert!(set.contains(Weekday::Wed));
        assert!(!set.contains(Weekday::Sun));
    }

    #[test]
    fn dayset_serde_is_sorted_index_list() {
        let set = DaySet::from_weekdays([Weekday::Fri, Weekday::Mon]);
        assert_eq!(serde_json::to_string(&set).unwrap(), "[1,5]");
        assert!(serde_json::from_str::<DaySet>("[2,2]").is_err());
        assert_eq!(set.to_string(), "Mon,Fri");
        assert_eq!(DaySet::EMPTY.to_string(), "once");
    }

    #[test]
    fn definition_json_uses_defaults() {
        let json = r#"{"id":"a1","hour":7,"minute":30,"active":true}"#;
        let def: AlarmDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(def.label, "ALARM");
        assert!(def.is_one_time());
        assert!(def.challenges.is_empty());
        assert_eq!(def.audio, AudioSpec::default());
    }

    #[test]
    fn validate_rejects_bad_time() {
        assert_eq!(
            AlarmDefinition::new(24, 0, DaySet::EMPTY).unwrap_err(),
            ValidationError::InvalidHour(24)
        );
        assert_eq!(
            AlarmDefinition::new(7, 60, DaySet::EMPTY).unwrap_err(),
            ValidationError::InvalidMinute(60)
        );
    }

    #[test]
    fn matches_minute_respects_days_and_active_flag() {
        let mut def =
            AlarmDefinition::new(7, 0, DaySet::from_weekdays([Weekday::Mon])).unwrap();
        // 2024-01-01 is a Monday.
        let monday = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(7, 0, 42)
            .unwrap();
        assert!(def.matches_minute(monday));
        assert!(!def.matches_minute(monday + chrono::Duration::days(1)));
        def.active = false;
        assert!(!def.matches_minute(monday));
    }

    #[test]
    fn parse_time_accepts_hh_mm() {
        assert_eq!(parse_time("07:05"), Ok((7, 5)));
        assert_eq!(parse_time("23:59"), Ok((23, 59)));
        assert!(parse_time("7").is_err());
        assert_eq!(parse_time("25:00"), Err(ValidationError::InvalidHour(25)));
    }
}
