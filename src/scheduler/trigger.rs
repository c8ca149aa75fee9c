//! Trigger shapes and the `Interval` type (ported from
//! `domovoy/applications/types.py::Interval`).

use chrono::{DateTime, NaiveTime, TimeZone};
use chrono_tz::Tz;

use crate::errors::SchedulerError;

/// Nonnegative composite duration. At least one field must be non-zero when
/// used as a recurrence (spec GLOSSARY, §4.3).
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Interval {
    #[serde(default)]
    pub days: i64,
    #[serde(default)]
    pub hours: i64,
    #[serde(default)]
    pub minutes: i64,
    #[serde(default)]
    pub seconds: i64,
    #[serde(default)]
    pub milliseconds: i64,
}

impl Interval {
    pub fn is_valid(&self) -> bool {
        self.days != 0 || self.hours != 0 || self.minutes != 0 || self.seconds != 0 || self.milliseconds != 0
    }

    pub fn to_duration(self) -> chrono::Duration {
        chrono::Duration::days(self.days)
            + chrono::Duration::hours(self.hours)
            + chrono::Duration::minutes(self.minutes)
            + chrono::Duration::seconds(self.seconds)
            + chrono::Duration::milliseconds(self.milliseconds)
    }

    pub fn total_seconds(self) -> f64 {
        ((self.days as f64 * 24.0 + self.hours as f64) * 60.0 + self.minutes as f64) * 60.0 + self.seconds as f64
            + (self.milliseconds as f64 / 1000.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SunEvent {
    Dawn,
    Sunrise,
    Noon,
    Sunset,
    Dusk,
}

/// What a scheduled job will do once it has computed its next fire time.
#[derive(Debug, Clone)]
pub enum TriggerSpec {
    /// Fire once at the given instant, then the job is done.
    Once(DateTime<Tz>),
    /// Fire every `interval`, first firing at `start` if given, else ASAP.
    Interval { interval: Interval, start: Option<DateTime<Tz>> },
    /// Fire once a day at wall-clock `time` in the configured timezone.
    Daily(NaiveTime),
    /// Fire once a day at a location-relative sun event, optionally offset.
    DailySunEvent { event: SunEvent, delta: Option<chrono::Duration> },
}

impl TriggerSpec {
    pub fn validate(&self, now: DateTime<Tz>) -> Result<(), SchedulerError> {
        match self {
            TriggerSpec::Once(at) => {
                if *at <= now {
                    return Err(SchedulerError::PastDatetime);
                }
            }
            TriggerSpec::Interval { interval, .. } => {
                if !interval.is_valid() {
                    return Err(SchedulerError::EmptyInterval);
                }
            }
            TriggerSpec::Daily(_) | TriggerSpec::DailySunEvent { .. } => {}
        }
        Ok(())
    }

    /// Next fire time strictly after `now`, or `None` if the job (a one-shot)
    /// has already fired and should be removed.
    pub fn next_after(&self, now: DateTime<Tz>, location: Option<&crate::configuration::AstralLocation>) -> Option<DateTime<Tz>> {
        match self {
            TriggerSpec::Once(at) => (*at > now).then_some(*at),
            TriggerSpec::Interval { interval, start } => {
                let duration = interval.to_duration();
                match start {
                    Some(start) if *start > now => Some(*start),
                    _ => Some(now + duration),
                }
            }
            TriggerSpec::Daily(time) => {
                let mut candidate = now.date_naive().and_time(*time);
                let tz = now.timezone();
                let mut next = tz.from_local_datetime(&candidate).single()?;
                if next <= now {
                    candidate += chrono::Duration::days(1);
                    next = tz.from_local_datetime(&candidate).single()?;
                }
                Some(next)
            }
            TriggerSpec::DailySunEvent { event, delta } => {
                let base = crate::scheduler::sun::next_sun_event(now, *event, location)?;
                let base = base + delta.unwrap_or_default();
                if base > now {
                    Some(base)
                } else {
                    let tomorrow = crate::scheduler::sun::next_sun_event(now + chrono::Duration::days(1), *event, location)?;
                    Some(tomorrow + delta.unwrap_or_default())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Interval::default(), false)]
    #[case(Interval { seconds: 1, ..Default::default() }, true)]
    #[case(Interval { minutes: 1, ..Default::default() }, true)]
    #[case(Interval { hours: 1, ..Default::default() }, true)]
    #[case(Interval { days: 1, ..Default::default() }, true)]
    #[case(Interval { milliseconds: 1, ..Default::default() }, true)]
    fn interval_validity_requires_nonzero_component(#[case] interval: Interval, #[case] expected_valid: bool) {
        assert_eq!(interval.is_valid(), expected_valid);
    }

    #[test]
    fn interval_total_seconds_matches_components() {
        let i = Interval { days: 1, hours: 1, minutes: 1, seconds: 1, milliseconds: 500 };
        assert_eq!(i.total_seconds(), 90061.5);
    }
}
