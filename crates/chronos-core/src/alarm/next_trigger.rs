//! Next-trigger arithmetic.
//!
//! Pure functions of `(definition, now)`. They never look at the `active`
//! flag; callers decide whether an inactive alarm should be armed at all.
//! A target equal to `now` counts as already passed, so the dispatcher's own
//! due-check is the only path that can fire "right now".

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, NaiveTime, TimeZone};
use serde::{Deserialize, Serialize};

use super::model::AlarmDefinition;

/// Next wall-clock instant the alarm rings strictly after `now`.
pub fn next_trigger(def: &AlarmDefinition, now: NaiveDateTime) -> NaiveDateTime {
    let time = NaiveTime::from_hms_opt(def.hour, def.minute, 0).unwrap_or(NaiveTime::MIN);
    let target = now.date().and_time(time);

    if def.days.is_empty() {
        return if target <= now {
            target + Duration::days(1)
        } else {
            target
        };
    }

    let current = now.weekday().num_days_from_sunday() as u8;
    if def.days.contains_index(current) && target > now {
        return target;
    }

    let offset = match def.days.indices().find(|&d| d > current) {
        Some(next) => (next - current) as i64,
        None => {
            // Non-empty set, so there is always a first day to wrap to.
            let first = def.days.indices().next().unwrap_or(current);
            (7 - current + first) as i64
        }
    };
    target + Duration::days(offset)
}

/// Time-zone aware variant. Local times skipped by a DST gap resolve to the
/// first valid instant after the gap; ambiguous ones to the earlier instant.
pub fn next_trigger_in<Tz: TimeZone>(def: &AlarmDefinition, now: &DateTime<Tz>) -> DateTime<Tz> {
    let naive = next_trigger(def, now.naive_local());
    let tz = now.timezone();
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .unwrap_or_else(|| tz.from_utc_datetime(&naive))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeFormat {
    #[default]
    #[serde(rename = "24h")]
    H24,
    #[serde(rename = "12h")]
    H12,
}

/// Render an alarm time for display.
pub fn format_time(hour: u32, minute: u32, format: TimeFormat) -> String {
    match format {
        TimeFormat::H24 => format!("{hour:02}:{minute:02}"),
        TimeFormat::H12 => {
            let period = if hour >= 12 { "PM" } else { "AM" };
            let h12 = match hour % 12 {
                0 => 12,
                h => h,
            };
            format!("{h12:02}:{minute:02} {period}")
        }
    }
}

/// Countdown text for the alarm list: "Due now" or "Alarm in 1h 5m".
pub fn time_until(next: NaiveDateTime, now: NaiveDateTime) -> String {
    let mins = (next - now).num_minutes();
    if mins < 1 {
        return "Due now".into();
    }
    let hours = mins / 60;
    let minutes = mins % 60;
    let mut parts = Vec::new();
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    format!("Alarm in {}", parts.join(" "))
}
