//! Recurring cadence descriptors.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Trigger validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TriggerError {
    #[error("trigger end {end} is before start {start}")]
    EndBeforeStart {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("trigger interval must be positive, got {0}")]
    NonPositiveInterval(i64),
    #[error("unknown interval unit: {0}")]
    UnknownUnit(String),
}

/// Unit of a trigger's repeat interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntervalUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl IntervalUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalUnit::Millisecond => "MILLISECOND",
            IntervalUnit::Second => "SECOND",
            IntervalUnit::Minute => "MINUTE",
            IntervalUnit::Hour => "HOUR",
            IntervalUnit::Day => "DAY",
            IntervalUnit::Week => "WEEK",
            IntervalUnit::Month => "MONTH",
            IntervalUnit::Year => "YEAR",
        }
    }

    /// Length in milliseconds for units of fixed duration.
    fn fixed_millis(&self) -> Option<i64> {
        match self {
            IntervalUnit::Millisecond => Some(1),
            IntervalUnit::Second => Some(1_000),
            IntervalUnit::Minute => Some(60_000),
            IntervalUnit::Hour => Some(3_600_000),
            IntervalUnit::Day => Some(86_400_000),
            IntervalUnit::Week => Some(604_800_000),
            IntervalUnit::Month | IntervalUnit::Year => None,
        }
    }

    /// Length in months for calendar units.
    fn months(&self) -> Option<u32> {
        match self {
            IntervalUnit::Month => Some(1),
            IntervalUnit::Year => Some(12),
            _ => None,
        }
    }
}

impl FromStr for IntervalUnit {
    type Err = TriggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MILLISECOND" => Ok(IntervalUnit::Millisecond),
            "SECOND" => Ok(IntervalUnit::Second),
            "MINUTE" => Ok(IntervalUnit::Minute),
            "HOUR" => Ok(IntervalUnit::Hour),
            "DAY" => Ok(IntervalUnit::Day),
            "WEEK" => Ok(IntervalUnit::Week),
            "MONTH" => Ok(IntervalUnit::Month),
            "YEAR" => Ok(IntervalUnit::Year),
            _ => Err(TriggerError::UnknownUnit(s.to_string())),
        }
    }
}

/// Identity of a trigger registered with the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerKey {
    pub name: String,
    pub group: String,
}

impl TriggerKey {
    pub fn new(name: &str, group: &str) -> Self {
        Self {
            name: name.to_string(),
            group: group.to_string(),
        }
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// Wire shape of a trigger: `intervalType`, `start`, `end`, `interval`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerShape {
    interval_type: IntervalUnit,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    interval: i64,
}

/// A validated recurring cadence.
///
/// Fires at `start + k * interval` for every `k >= 0` up to and including
/// `end`. The key is assigned when the trigger is first scheduled and is
/// never serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TriggerShape", into = "TriggerShape")]
pub struct TriggerConfig {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    interval: u32,
    unit: IntervalUnit,
    key: Option<TriggerKey>,
}

impl TriggerConfig {
    pub fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: i64,
        unit: IntervalUnit,
    ) -> Result<Self, TriggerError> {
        if end < start {
            return Err(TriggerError::EndBeforeStart { start, end });
        }
        if interval <= 0 || interval > u32::MAX as i64 {
            return Err(TriggerError::NonPositiveInterval(interval));
        }

        Ok(Self {
            start,
            end,
            interval: interval as u32,
            unit,
            key: None,
        })
    }

    /// A trigger starting at `start` that never ends.
    pub fn repeat_forever(
        start: DateTime<Utc>,
        interval: i64,
        unit: IntervalUnit,
    ) -> Result<Self, TriggerError> {
        Self::new(start, far_future(), interval, unit)
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    pub fn unit(&self) -> IntervalUnit {
        self.unit
    }

    pub fn key(&self) -> Option<&TriggerKey> {
        self.key.as_ref()
    }

    /// Whether the trigger has been registered and received a key.
    pub fn is_saved(&self) -> bool {
        self.key.is_some()
    }

    pub fn with_key(mut self, key: TriggerKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Same cadence, compared without regard to the key.
    pub fn same_cadence(&self, other: &TriggerConfig) -> bool {
        self.start == other.start
            && self.end == other.end
            && self.interval == other.interval
            && self.unit == other.unit
    }

    /// The first fire time at or after `now`, or `None` once past `end`.
    /// Fixed units compare at millisecond precision, so a slot less than a
    /// millisecond before `now` still counts.
    pub fn next_fire_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let candidate = if now <= self.start {
            self.start
        } else if let Some(unit_ms) = self.unit.fixed_millis() {
            let step = unit_ms.checked_mul(self.interval as i64)?;
            let elapsed = (now - self.start).num_milliseconds();
            let steps = (elapsed + step - 1) / step;
            self.start
                .checked_add_signed(ChronoDuration::milliseconds(steps.checked_mul(step)?))?
        } else {
            let step = self.unit.months()?.checked_mul(self.interval)?;
            let elapsed = months_between(self.start, now);
            let mut k = elapsed / step;
            loop {
                let t = self
                    .start
                    .checked_add_months(Months::new(k.checked_mul(step)?))?;
                if t >= now {
                    break t;
                }
                k += 1;
            }
        };

        (candidate <= self.end).then_some(candidate)
    }
}

impl TryFrom<TriggerShape> for TriggerConfig {
    type Error = TriggerError;

    fn try_from(shape: TriggerShape) -> Result<Self, Self::Error> {
        TriggerConfig::new(shape.start, shape.end, shape.interval, shape.interval_type)
    }
}

impl From<TriggerConfig> for TriggerShape {
    fn from(config: TriggerConfig) -> Self {
        TriggerShape {
            interval_type: config.unit,
            start: config.start,
            end: config.end,
            interval: config.interval as i64,
        }
    }
}

/// End bound for triggers that repeat indefinitely.
pub fn far_future() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .and_then(|d| d.and_hms_opt(23, 59, 59))
        .map(|dt| dt.and_utc())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Whole calendar months from `from` to `to`, never negative.
fn months_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u32 {
    let months = (to.year() - from.year()) as i64 * 12 + to.month() as i64 - from.month() as i64;
    months.clamp(0, u32::MAX as i64) as u32
}
