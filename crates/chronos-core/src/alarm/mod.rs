mod model;
mod next_trigger;

pub use model::{
    parse_time, AlarmDefinition, AlarmId, AudioSpec, ChallengeKind, ChallengeParams,
    ChallengeSpec, DaySet, Difficulty, EmergencyMethod, EmergencySpec, GeneratedTone,
    SystemSound, WakeUpCheckSpec,
};
pub use next_trigger::{format_time, next_trigger, next_trigger_in, time_until, TimeFormat};
