use std::fmt;
use std::str::FromStr;

use serde_json::{json, Value};
use thiserror::Error;

/// Highest manual schedule slot index the firmware accepts.
pub const MAX_TIME_SLOT: u8 = 9;

/// Caller input rejected before anything is sent.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{field} must be a finite, non-negative number (got {value})")]
    NotNonNegative { field: &'static str, value: f64 },
    #[error("{field} must be HH:MM (got {value:?})")]
    InvalidTime { field: &'static str, value: String },
    #[error("time slot must be between 0 and 9 (got {0})")]
    TimeSlot(u8),
    #[error("weekday index must be between 0 and 6 (got {0})")]
    Weekday(u8),
    #[error("manual schedule needs at least one weekday")]
    NoWeekdays,
}

/// Day of week, indexed from Monday = 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Weekday {
    pub const ALL: [Weekday; 7] = [
        Weekday::Monday,
        Weekday::Tuesday,
        Weekday::Wednesday,
        Weekday::Thursday,
        Weekday::Friday,
        Weekday::Saturday,
        Weekday::Sunday,
    ];

    pub fn from_index(index: u8) -> Result<Self, ValidationError> {
        Self::ALL
            .get(usize::from(index))
            .copied()
            .ok_or(ValidationError::Weekday(index))
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    /// Bit `index` of the `week_set` byte; Monday is the least significant bit.
    pub fn bit(self) -> u8 {
        1 << self.index()
    }
}

/// The device's `week_set` byte. Bit 7 is unused and always cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WeekdaySet(u8);

impl WeekdaySet {
    pub const EVERY_DAY: WeekdaySet = WeekdaySet(0x7f);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0x7f)
    }

    pub fn from_indices(indices: &[u8]) -> Result<Self, ValidationError> {
        let mut set = Self::empty();
        for index in indices {
            set.insert(Weekday::from_index(*index)?);
        }
        Ok(set)
    }

    pub fn insert(&mut self, day: Weekday) {
        self.0 |= day.bit();
    }

    pub fn contains(self, day: Weekday) -> bool {
        self.0 & day.bit() != 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn days(self) -> Vec<Weekday> {
        Weekday::ALL
            .into_iter()
            .filter(|day| self.contains(*day))
            .collect()
    }
}

impl FromIterator<Weekday> for WeekdaySet {
    fn from_iter<I: IntoIterator<Item = Weekday>>(iter: I) -> Self {
        let mut set = Self::empty();
        for day in iter {
            set.insert(day);
        }
        set
    }
}

/// Wall-clock time of day as the device expects it (`HH:MM`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTime {
    pub hour: u8,
    pub minute: u8,
}

impl ClockTime {
    fn parse_field(field: &'static str, value: &str) -> Result<Self, ValidationError> {
        value.parse().map_err(|_| ValidationError::InvalidTime {
            field,
            value: value.to_string(),
        })
    }
}

impl FromStr for ClockTime {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (hour, minute) = value.trim().split_once(':').ok_or(())?;
        let hour: u8 = hour.parse().map_err(|_| ())?;
        let minute: u8 = minute.parse().map_err(|_| ())?;
        if hour > 23 || minute > 59 {
            return Err(());
        }
        Ok(Self { hour, minute })
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManualSchedule {
    pub time_slot: u8,
    pub start: ClockTime,
    pub end: ClockTime,
    pub weekdays: WeekdaySet,
    pub power_w: f64,
    pub enable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PassiveConfig {
    pub power_w: f64,
    pub cooldown_secs: f64,
}

/// Operating mode requests accepted by `ES.SetMode`.
#[derive(Debug, Clone, PartialEq)]
pub enum ModeConfig {
    Auto,
    Ai,
    Manual(ManualSchedule),
    Passive(PassiveConfig),
}

impl ModeConfig {
    pub fn manual(
        time_slot: u8,
        start: &str,
        end: &str,
        weekdays: WeekdaySet,
        power_w: f64,
        enable: bool,
    ) -> Result<Self, ValidationError> {
        if time_slot > MAX_TIME_SLOT {
            return Err(ValidationError::TimeSlot(time_slot));
        }
        if weekdays.is_empty() {
            return Err(ValidationError::NoWeekdays);
        }
        Ok(Self::Manual(ManualSchedule {
            time_slot,
            start: ClockTime::parse_field("start_time", start)?,
            end: ClockTime::parse_field("end_time", end)?,
            weekdays,
            power_w: non_negative("power", power_w)?,
            enable,
        }))
    }

    pub fn passive(power_w: f64, cooldown_secs: f64) -> Result<Self, ValidationError> {
        Ok(Self::Passive(PassiveConfig {
            power_w: non_negative("power", power_w)?,
            cooldown_secs: non_negative("cd_time", cooldown_secs)?,
        }))
    }

    pub fn mode_name(&self) -> &'static str {
        match self {
            ModeConfig::Auto => "Auto",
            ModeConfig::Ai => "AI",
            ModeConfig::Manual(_) => "Manual",
            ModeConfig::Passive(_) => "Passive",
        }
    }

    /// Params object for an `ES.SetMode` request.
    pub fn to_params(&self) -> Value {
        let config = match self {
            ModeConfig::Auto => json!({
                "mode": self.mode_name(),
                "auto_cfg": { "enable": 1 },
            }),
            ModeConfig::Ai => json!({
                "mode": self.mode_name(),
                "ai_cfg": { "enable": 1 },
            }),
            ModeConfig::Manual(schedule) => json!({
                "mode": self.mode_name(),
                "manual_cfg": {
                    "time_num": schedule.time_slot,
                    "start_time": schedule.start.to_string(),
                    "end_time": schedule.end.to_string(),
                    "week_set": schedule.weekdays.bits(),
                    "power": schedule.power_w.round() as i64,
                    "enable": u8::from(schedule.enable),
                },
            }),
            ModeConfig::Passive(passive) => json!({
                "mode": self.mode_name(),
                "passive_cfg": {
                    "power": passive.power_w.round() as i64,
                    "cd_time": passive.cooldown_secs.round() as i64,
                },
            }),
        };
        json!({ "id": 0, "config": config })
    }
}

/// True when a `result` explicitly refuses the configuration (`set_result: false`).
pub fn is_negative_ack(result: &Value) -> bool {
    match result.get("set_result") {
        Some(Value::Bool(accepted)) => !accepted,
        Some(Value::Number(number)) => number.as_i64() == Some(0),
        _ => false,
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<f64, ValidationError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(ValidationError::NotNonNegative { field, value })
    }
}
