use chrono::{Local, Weekday};
use clap::{Subcommand, ValueEnum};
use chronos_core::alarm::{
    format_time, next_trigger, parse_time, time_until, AlarmDefinition, ChallengeKind,
    ChallengeParams, ChallengeSpec, DaySet, Difficulty, EmergencyMethod, EmergencySpec,
    WakeUpCheckSpec,
};
use chronos_core::engine::AlarmStore;
use chronos_core::Config;

use super::open_engine;

#[derive(Clone, Copy, ValueEnum)]
pub enum ChallengeArg {
    Math,
    Burst,
    Memory,
    Typing,
    Bluetooth,
    Velocity,
}

impl From<ChallengeArg> for ChallengeKind {
    fn from(arg: ChallengeArg) -> Self {
        match arg {
            ChallengeArg::Math => ChallengeKind::Math,
            ChallengeArg::Burst => ChallengeKind::Burst,
            ChallengeArg::Memory => ChallengeKind::Memory,
            ChallengeArg::Typing => ChallengeKind::Typing,
            ChallengeArg::Bluetooth => ChallengeKind::Bluetooth,
            ChallengeArg::Velocity => ChallengeKind::Velocity,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum MethodArg {
    Sms,
    Call,
}

#[derive(Subcommand)]
pub enum AlarmAction {
    /// Create an alarm
    Add {
        /// Time of day, HH:MM (24h)
        time: String,
        /// Repeat days: "mon,wed,fri", "0,6", "weekdays", "weekends" or "daily".
        /// Omit for a one-time alarm.
        #[arg(long)]
        days: Option<String>,
        #[arg(long)]
        label: Option<String>,
        /// Dismissal challenge; repeat to chain them in order
        #[arg(long = "challenge", value_enum)]
        challenges: Vec<ChallengeArg>,
        /// Use hard difficulty for challenges that support it
        #[arg(long)]
        hard: bool,
        /// Minutes after dismissal before the wake-up check appears
        #[arg(long)]
        check_delay: Option<u32>,
        /// Minutes allowed to confirm the wake-up check
        #[arg(long, default_value = "1")]
        confirm_window: u32,
        /// Emergency contact number; enables escalation
        #[arg(long)]
        emergency_number: Option<String>,
        #[arg(long, default_value = "Emergency contact")]
        emergency_name: String,
        #[arg(long, value_enum, default_value = "sms")]
        emergency_method: MethodArg,
        /// Minutes of ringing before the emergency contact is notified
        #[arg(long, default_value = "10")]
        emergency_delay: u32,
        #[arg(long)]
        emergency_message: Option<String>,
        /// Create the alarm switched off
        #[arg(long)]
        inactive: bool,
    },
    /// List alarms
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print one alarm as JSON
    Show { id: String },
    /// Switch an alarm on or off
    Toggle { id: String },
    /// Delete an alarm
    Delete { id: String },
    /// Upcoming triggers, soonest first
    Next {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Parse a day list into a [`DaySet`].
pub fn parse_days(input: &str) -> Result<DaySet, String> {
    let input = input.trim().to_ascii_lowercase();
    match input.as_str() {
        "" | "once" => return Ok(DaySet::EMPTY),
        "daily" | "everyday" => return Ok(DaySet::from_weekdays(all_days())),
        "weekdays" => return Ok(DaySet::from_weekdays(all_days().into_iter().take(5))),
        "weekends" => return Ok(DaySet::from_weekdays([Weekday::Sat, Weekday::Sun])),
        _ => {}
    }

    let mut indices = Vec::new();
    for part in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let idx = match part.parse::<u8>() {
            Ok(n) => n,
            Err(_) => part
                .parse::<Weekday>()
                .map(|d| d.num_days_from_sunday() as u8)
                .map_err(|_| format!("unknown day '{part}'"))?,
        };
        indices.push(idx);
    }
    DaySet::from_indices(&indices).map_err(|e| e.to_string())
}

fn all_days() -> [Weekday; 7] {
    [
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ]
}

pub fn run(action: AlarmAction) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    let format = config.display.time_format;
    let now = Local::now().naive_local();
    let mut engine = open_engine(&config)?;

    match action {
        AlarmAction::Add {
            time,
            days,
            label,
            challenges,
            hard,
            check_delay,
            confirm_window,
            emergency_number,
            emergency_name,
            emergency_method,
            emergency_delay,
            emergency_message,
            inactive,
        } => {
            let (hour, minute) = parse_time(&time)?;
            let days = match days {
                Some(d) => parse_days(&d)?,
                None => DaySet::EMPTY,
            };
            let mut def = AlarmDefinition::new(hour, minute, days)?;
            if let Some(label) = label {
                def.label = label;
            }
            def.active = !inactive;
            def.challenges = challenges
                .into_iter()
                .map(|c| {
                    let spec = ChallengeSpec::new(c.into());
                    if hard {
                        spec.with_params(ChallengeParams {
                            difficulty: Some(Difficulty::Hard),
                            ..ChallengeParams::default()
                        })
                    } else {
                        spec
                    }
                })
                .collect();
            def.wake_up_check = check_delay.map(|check_delay| WakeUpCheckSpec {
                enabled: true,
                check_delay,
                confirm_window,
            });
            def.emergency = emergency_number.map(|number| EmergencySpec {
                enabled: true,
                contact_name: emergency_name,
                contact_number: number,
                method: match emergency_method {
                    MethodArg::Sms => EmergencyMethod::Sms,
                    MethodArg::Call => EmergencyMethod::Call,
                },
                message: emergency_message,
                trigger_delay: emergency_delay,
            });

            engine.schedule_alarm(def.clone(), now)?;
            println!("{}", serde_json::to_string_pretty(&def)?);
        }
        AlarmAction::List { json } => {
            let alarms = engine.store().list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&alarms)?);
            } else if alarms.is_empty() {
                println!("no alarms");
            } else {
                for a in &alarms {
                    let status = if a.active {
                        time_until(next_trigger(a, now), now)
                    } else {
                        "off".to_string()
                    };
                    println!(
                        "{}  {}  {:<27}  {:<12}  {}",
                        a.id,
                        format_time(a.hour, a.minute, format),
                        a.days.to_string(),
                        a.label,
                        status
                    );
                }
            }
        }
        AlarmAction::Show { id } => {
            let def = engine
                .store()
                .get(&id)?
                .ok_or_else(|| format!("alarm not found: {id}"))?;
            println!("{}", serde_json::to_string_pretty(&def)?);
        }
        AlarmAction::Toggle { id } => {
            engine.toggle_alarm(&id, now)?;
            let active = engine.store().get(&id)?.is_some_and(|d| d.active);
            println!("alarm {id} {}", if active { "on" } else { "off" });
        }
        AlarmAction::Delete { id } => {
            engine.delete_alarm(&id, now)?;
            println!("alarm {id} deleted");
        }
        AlarmAction::Next { json } => {
            let mut upcoming: Vec<_> = engine
                .store()
                .list()?
                .into_iter()
                .filter(|a| a.active)
                .map(|a| (next_trigger(&a, now), a))
                .collect();
            upcoming.sort_by(|x, y| x.0.cmp(&y.0));

            if json {
                let rows: Vec<_> = upcoming
                    .iter()
                    .map(|(at, a)| {
                        serde_json::json!({
                            "id": a.id,
                            "label": a.label,
                            "next_trigger": at,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if upcoming.is_empty() {
                println!("no active alarms");
            } else {
                for (at, a) in &upcoming {
                    println!(
                        "{}  {} {}  {}  ({})",
                        a.id,
                        at.format("%a %Y-%m-%d"),
                        format_time(a.hour, a.minute, format),
                        a.label,
                        time_until(*at, now)
                    );
                }
            }
        }
    }
    Ok(())
}
