//! Trigger specifications and next-fire computation.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveTime, TimeZone, Utc};
use tokio::time::Instant;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Invalid trigger specification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TriggerError {
    #[error("hour {0} is out of range (expected 0-23)")]
    InvalidHour(u32),
    #[error("minute {0} is out of range (expected 0-59)")]
    InvalidMinute(u32),
    #[error("a daily trigger needs at least one hour")]
    NoHours,
    #[error("interval must be greater than zero")]
    ZeroInterval,
}

/// When a job fires.
///
/// Calendar variants are evaluated in the wall clock's time zone; the
/// scheduler passes its configured calendar offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerSpec {
    /// Fire once as soon as the scheduler starts, then leave the schedule.
    Once,
    /// Fire every `every`; the first fire is at startup when
    /// `fire_immediately` is set, otherwise one interval after startup.
    Interval {
        every: Duration,
        fire_immediately: bool,
    },
    /// Fire every day at `hour:minute`.
    DailyAt { hour: u32, minute: u32 },
    /// Fire every day at each of `hours`, at `minute` past the hour.
    MultiDailyAt { hours: Vec<u32>, minute: u32 },
}

impl TriggerSpec {
    pub fn every(every: Duration) -> Self {
        Self::Interval {
            every,
            fire_immediately: false,
        }
    }

    pub fn every_starting_now(every: Duration) -> Self {
        Self::Interval {
            every,
            fire_immediately: true,
        }
    }

    pub fn daily_at(hour: u32, minute: u32) -> Self {
        Self::DailyAt { hour, minute }
    }

    /// Several fixed times a day, e.g. `daily_at_hours([8, 20], 0)` for 08:00 and 20:00.
    ///
    /// Hours are sorted and deduplicated.
    pub fn daily_at_hours(hours: impl IntoIterator<Item = u32>, minute: u32) -> Self {
        let mut hours: Vec<u32> = hours.into_iter().collect();
        hours.sort_unstable();
        hours.dedup();
        Self::MultiDailyAt { hours, minute }
    }

    pub fn validate(&self) -> Result<(), TriggerError> {
        match self {
            TriggerSpec::Once => Ok(()),
            TriggerSpec::Interval { every, .. } => {
                if every.is_zero() {
                    return Err(TriggerError::ZeroInterval);
                }
                Ok(())
            }
            TriggerSpec::DailyAt { hour, minute } => validate_time(*hour, *minute),
            TriggerSpec::MultiDailyAt { hours, minute } => {
                if hours.is_empty() {
                    return Err(TriggerError::NoHours);
                }
                hours.iter().try_for_each(|hour| validate_time(*hour, *minute))
            }
        }
    }

    /// First fire time after the scheduler starts at `now` (wall clock `wall`).
    ///
    /// Calendar variants are evaluated in `wall`'s time zone. `None` means
    /// the trigger never fires, e.g. an interval too long to represent.
    pub fn first_fire<Tz: TimeZone>(&self, now: Instant, wall: DateTime<Tz>) -> Option<Instant> {
        match self {
            TriggerSpec::Once => Some(now),
            TriggerSpec::Interval {
                every,
                fire_immediately: true,
            } if !every.is_zero() => Some(now),
            TriggerSpec::Interval { every, .. } if !every.is_zero() => now.checked_add(*every),
            TriggerSpec::Interval { .. } => None,
            TriggerSpec::DailyAt { .. } | TriggerSpec::MultiDailyAt { .. } => {
                self.calendar_fire_after(now, wall)
            }
        }
    }

    /// Fire time following the one scheduled at `due`, evaluated at `now`.
    ///
    /// Fires missed while the process was busy are skipped, never replayed.
    pub fn next_fire<Tz: TimeZone>(
        &self,
        due: Instant,
        now: Instant,
        wall: DateTime<Tz>,
    ) -> Option<Instant> {
        match self {
            TriggerSpec::Once => None,
            TriggerSpec::Interval { every, .. } if every.is_zero() => None,
            TriggerSpec::Interval { every, .. } => {
                let next = due.checked_add(*every)?;
                if next > now {
                    return Some(next);
                }
                let every_nanos = every.as_nanos();
                let behind = now.saturating_duration_since(next).as_nanos();
                let ahead = (behind / every_nanos + 1).checked_mul(every_nanos)?;
                let secs = u64::try_from(ahead / NANOS_PER_SEC).ok()?;
                let nanos = u32::try_from(ahead % NANOS_PER_SEC).ok()?;
                next.checked_add(Duration::new(secs, nanos))
            }
            TriggerSpec::DailyAt { .. } | TriggerSpec::MultiDailyAt { .. } => {
                self.calendar_fire_after(now, wall)
            }
        }
    }

    /// Next calendar time strictly after `wall`, or `None` for non-calendar
    /// triggers and invalid hour/minute values.
    ///
    /// Hours are read in `wall`'s time zone; a local time that does not exist
    /// in that zone is skipped for the day.
    pub fn next_calendar_time<Tz: TimeZone>(&self, wall: DateTime<Tz>) -> Option<DateTime<Utc>> {
        let (hours, minute): (&[u32], u32) = match self {
            TriggerSpec::DailyAt { hour, minute } => (std::slice::from_ref(hour), *minute),
            TriggerSpec::MultiDailyAt { hours, minute } => (hours.as_slice(), *minute),
            TriggerSpec::Once | TriggerSpec::Interval { .. } => return None,
        };

        let zone = wall.timezone();
        let today = wall.date_naive();
        let tomorrow = today.checked_add_days(Days::new(1))?;
        let after = wall.with_timezone(&Utc);
        [today, tomorrow]
            .into_iter()
            .flat_map(move |day| {
                let zone = zone.clone();
                hours.iter().filter_map(move |hour| {
                    let time = NaiveTime::from_hms_opt(*hour, minute, 0)?;
                    zone.from_local_datetime(&day.and_time(time))
                        .earliest()
                        .map(|at| at.with_timezone(&Utc))
                })
            })
            .filter(|candidate| *candidate > after)
            .min()
    }

    fn calendar_fire_after<Tz: TimeZone>(
        &self,
        now: Instant,
        wall: DateTime<Tz>,
    ) -> Option<Instant> {
        let after = wall.with_timezone(&Utc);
        let target = self.next_calendar_time(wall)?;
        let wait = (target - after).to_std().unwrap_or(Duration::ZERO);
        now.checked_add(wait)
    }
}

fn validate_time(hour: u32, minute: u32) -> Result<(), TriggerError> {
    if hour >= 24 {
        return Err(TriggerError::InvalidHour(hour));
    }
    if minute >= 60 {
        return Err(TriggerError::InvalidMinute(minute));
    }
    Ok(())
}

impl fmt::Display for TriggerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSpec::Once => f.write_str("once at startup"),
            TriggerSpec::Interval {
                every,
                fire_immediately,
            } => {
                write!(f, "every {}s", every.as_secs_f64())?;
                if *fire_immediately {
                    f.write_str(" (starting now)")?;
                }
                Ok(())
            }
            TriggerSpec::DailyAt { hour, minute } => write!(f, "daily at {hour:02}:{minute:02}"),
            TriggerSpec::MultiDailyAt { hours, minute } => {
                f.write_str("daily at ")?;
                for (i, hour) in hours.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{hour:02}:{minute:02}")?;
                }
                Ok(())
            }
        }
    }
}
