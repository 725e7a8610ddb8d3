//! Task schedules.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The next thing a schedule will do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePoint {
    /// Fire at this time.
    At(DateTime<Utc>),
    /// The schedule will not fire again.
    Ended,
}

/// When a task fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Schedule {
    /// Fires every `interval`, forever.
    Simple {
        #[serde(with = "duration_string")]
        interval: Duration,
    },
    /// Fires every `interval` inside `[start, stop]`; either endpoint
    /// may be open.
    Windowed {
        #[serde(with = "duration_string")]
        interval: Duration,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop: Option<DateTime<Utc>>,
    },
    /// Reserved discriminator; not yet implemented.
    Cron { spec: String },
}

impl Schedule {
    pub fn simple(interval: Duration) -> Self {
        Schedule::Simple { interval }
    }

    /// Reject schedules the scheduler cannot run.
    pub fn validate(&self) -> Result<()> {
        match self {
            Schedule::Simple { interval } | Schedule::Windowed { interval, .. } => {
                if interval.is_zero() {
                    return Err(Error::validation("schedule interval must be positive"));
                }
            }
            Schedule::Cron { .. } => {
                return Err(Error::validation("cron schedules are reserved"));
            }
        }
        match self {
            Schedule::Windowed {
                start: Some(start),
                stop: Some(stop),
                ..
            } if stop <= start => Err(Error::validation("schedule window stops before it starts")),
            _ => Ok(()),
        }
    }

    /// The firing after `last` (or the first firing when `None`), as
    /// seen from `now`.
    pub fn next_fire(&self, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> SchedulePoint {
        match self {
            Schedule::Simple { interval } => {
                let base = last.unwrap_or(now);
                SchedulePoint::At(base + chrono_duration(*interval))
            }
            Schedule::Windowed {
                interval,
                start,
                stop,
            } => {
                let candidate = match last {
                    Some(last) => last + chrono_duration(*interval),
                    None => match start {
                        Some(start) if *start > now => *start,
                        _ => now + chrono_duration(*interval),
                    },
                };
                match stop {
                    Some(stop) if candidate > *stop => SchedulePoint::Ended,
                    _ => SchedulePoint::At(candidate),
                }
            }
            // Unreachable through the scheduler; creation rejects cron.
            Schedule::Cron { .. } => SchedulePoint::Ended,
        }
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Parse a Go-style duration literal: integer plus one of `ms`, `s`,
/// `m`, `h`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| Error::validation(format!("duration missing unit: {input}")))?;
    let (digits, unit) = trimmed.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::validation(format!("bad duration: {input}")))?;
    let duration = match unit {
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        _ => return Err(Error::validation(format!("bad duration unit: {input}"))),
    };
    Ok(duration)
}

/// Render a duration in the smallest exact unit.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 || ms % 1000 != 0 {
        return format!("{ms}ms");
    }
    let secs = ms / 1000;
    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

mod duration_string {
    use super::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        d: &Duration,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_format_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("3m").unwrap(), Duration::from_secs(180));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("5d").is_err());

        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
        assert_eq!(format_duration(Duration::from_secs(120)), "2m");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
    }

    #[test]
    fn test_duration_roundtrip_through_serde() {
        let schedule = Schedule::simple(Duration::from_millis(500));
        let json = serde_json::to_string(&schedule).unwrap();
        assert!(json.contains("\"500ms\""));
        let back: Schedule = serde_json::from_str(&json).unwrap();
        assert_eq!(schedule, back);
    }

    #[test]
    fn test_simple_next_fire() {
        let schedule = Schedule::simple(Duration::from_secs(10));
        let now = Utc::now();
        match schedule.next_fire(None, now) {
            SchedulePoint::At(t) => assert_eq!(t, now + chrono::Duration::seconds(10)),
            SchedulePoint::Ended => panic!("simple schedules never end"),
        }
        let last = now + chrono::Duration::seconds(30);
        match schedule.next_fire(Some(last), now) {
            SchedulePoint::At(t) => assert_eq!(t, last + chrono::Duration::seconds(10)),
            SchedulePoint::Ended => panic!(),
        }
    }

    #[test]
    fn test_windowed_respects_start_and_stop() {
        let now = Utc::now();
        let start = now + chrono::Duration::seconds(60);
        let stop = now + chrono::Duration::seconds(120);
        let schedule = Schedule::Windowed {
            interval: Duration::from_secs(10),
            start: Some(start),
            stop: Some(stop),
        };

        // First fire waits for the window to open.
        assert_eq!(schedule.next_fire(None, now), SchedulePoint::At(start));
        // Inside the window, ticks advance by the interval.
        assert_eq!(
            schedule.next_fire(Some(start), now),
            SchedulePoint::At(start + chrono::Duration::seconds(10))
        );
        // Past the stop, the schedule ends.
        assert_eq!(schedule.next_fire(Some(stop), now), SchedulePoint::Ended);
    }

    #[test]
    fn test_cron_reserved() {
        let schedule = Schedule::Cron {
            spec: "* * * * *".to_string(),
        };
        let err = schedule.validate().unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(Schedule::simple(Duration::ZERO).validate().is_err());
    }

    #[test]
    fn test_inverted_window_rejected() {
        let now = Utc::now();
        let schedule = Schedule::Windowed {
            interval: Duration::from_secs(1),
            start: Some(now),
            stop: Some(now - chrono::Duration::seconds(5)),
        };
        assert!(schedule.validate().is_err());
    }
}
