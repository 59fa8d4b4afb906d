//! Closed schedule grammar for time-triggered definitions.
//!
//! Schedules are stored as JSON (`{"kind": ...}`) and deserialized into
//! [`Schedule`]. Unknown kinds fail deserialization; the caller treats such
//! definitions as disabled and records an audit entry. Event-kind
//! definitions carry their event-type subscription in the same descriptor.

use chrono::{DateTime, Datelike, Duration, DurationRound, Timelike, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Grid of epoch-minute multiples of `n`.
    EveryNMinutes { n: u32 },
    /// Once per hour at the given minute.
    Hourly { minute: u32 },
    /// Once per day at "HH:MM".
    Daily { time: String },
    /// Monday through Friday at "HH:MM".
    Weekdays { time: String },
    /// Once per week; weekday 0 = Monday.
    Weekly { weekday: u32, time: String },
    /// Subscription descriptor for event-kind definitions.
    Event {
        #[serde(default)]
        event_types: Vec<String>,
    },
}

impl Schedule {
    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Schedule::EveryNMinutes { n } => {
                if *n < 1 {
                    return Err("every_n_minutes requires n >= 1".into());
                }
            }
            Schedule::Hourly { minute } => {
                if *minute > 59 {
                    return Err(format!("hourly minute out of range: {minute}"));
                }
            }
            Schedule::Daily { time } | Schedule::Weekdays { time } => {
                parse_hhmm(time).ok_or_else(|| format!("invalid time: {time}"))?;
            }
            Schedule::Weekly { weekday, time } => {
                if *weekday > 6 {
                    return Err(format!("weekly weekday out of range: {weekday}"));
                }
                parse_hhmm(time).ok_or_else(|| format!("invalid time: {time}"))?;
            }
            Schedule::Event { .. } => {}
        }
        Ok(())
    }

    /// Whether this schedule fires at the given minute slot. The caller
    /// passes slots already floored to the minute.
    pub fn matches_slot(&self, slot: DateTime<Utc>) -> bool {
        match self {
            Schedule::EveryNMinutes { n } => {
                *n >= 1 && (slot.timestamp() / 60) % i64::from(*n) == 0
            }
            Schedule::Hourly { minute } => *minute <= 59 && slot.minute() == *minute,
            Schedule::Daily { time } => match parse_hhmm(time) {
                Some((hh, mm)) => slot.hour() == hh && slot.minute() == mm,
                None => false,
            },
            Schedule::Weekdays { time } => match parse_hhmm(time) {
                Some((hh, mm)) => {
                    slot.weekday().num_days_from_monday() < 5
                        && slot.hour() == hh
                        && slot.minute() == mm
                }
                None => false,
            },
            Schedule::Weekly { weekday, time } => match parse_hhmm(time) {
                Some((hh, mm)) => {
                    slot.weekday().num_days_from_monday() == *weekday
                        && slot.hour() == hh
                        && slot.minute() == mm
                }
                None => false,
            },
            Schedule::Event { .. } => false,
        }
    }

    /// The first grid point at or after `t`, if the schedule has one.
    pub fn next_slot_at_or_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.validate().is_err() {
            return None;
        }
        let floored = floor_to_minute(t);
        // Round sub-minute time up to the next whole minute.
        let start = if floored == t {
            floored
        } else {
            floored + Duration::minutes(1)
        };
        match self {
            Schedule::Event { .. } => None,
            // Weekly has the widest grid: one match within any 7-day span.
            _ => (0..=7 * 24 * 60)
                .map(|i| start + Duration::minutes(i))
                .find(|slot| self.matches_slot(*slot)),
        }
    }

    /// Event types an event-kind definition subscribes to; empty for time
    /// schedules.
    pub fn subscribed_event_types(&self) -> &[String] {
        match self {
            Schedule::Event { event_types } => event_types,
            _ => &[],
        }
    }
}

pub fn floor_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(Duration::minutes(1)).unwrap_or(t)
}

fn parse_hhmm(value: &str) -> Option<(u32, u32)> {
    let (hh, mm) = value.trim().split_once(':')?;
    let hh: u32 = hh.parse().ok()?;
    let mm: u32 = mm.parse().ok()?;
    if hh > 23 || mm > 59 {
        return None;
    }
    Some((hh, mm))
}
