use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Calendar granularity of a time bucket, ordered finest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Minute,
    Hour,
    Day,
    Month,
}

impl Granularity {
    /// All granularities from finest to coarsest.
    pub const ALL: [Granularity; 4] = [
        Granularity::Minute,
        Granularity::Hour,
        Granularity::Day,
        Granularity::Month,
    ];

    /// Returns the lowercase name used in role names and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
        }
    }

    fn rank(self) -> u32 {
        match self {
            Self::Minute => 0,
            Self::Hour => 1,
            Self::Day => 2,
            Self::Month => 3,
        }
    }

    /// Smallest integer with this granularity's digit count. Together with a
    /// bucket value it bounds a range scan over one granularity.
    pub fn floor(self) -> i64 {
        match self {
            Self::Minute => 100_000_000_000,
            Self::Hour => 1_000_000_000,
            Self::Day => 10_000_000,
            Self::Month => 100_000,
        }
    }

    /// Infers the granularity from the number of decimal digits.
    fn from_digits(value: i64) -> Option<Self> {
        match value {
            100_000..=999_999 => Some(Self::Month),
            10_000_000..=99_999_999 => Some(Self::Day),
            1_000_000_000..=9_999_999_999 => Some(Self::Hour),
            100_000_000_000..=999_999_999_999 => Some(Self::Minute),
            _ => None,
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An integer-encoded calendar slot.
///
/// Encodings are `YYYYMMDDhhmm`, `YYYYMMDDhh`, `YYYYMMDD` and `YYYYMM`. Each
/// step to a coarser granularity drops the two trailing digits, so
/// downsampling never depends on wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeBucket {
    value: i64,
    granularity: Granularity,
}

impl TimeBucket {
    /// Parses and validates an encoded bucket.
    pub fn new(value: i64) -> Result<Self, PipelineError> {
        let granularity =
            Granularity::from_digits(value).ok_or(PipelineError::InvalidTimeBucket(value))?;

        if start_of(value, granularity).is_none() {
            return Err(PipelineError::InvalidTimeBucket(value));
        }

        Ok(Self { value, granularity })
    }

    /// Buckets a UTC timestamp in milliseconds at the given granularity.
    pub fn from_timestamp_millis(
        millis: i64,
        granularity: Granularity,
    ) -> Result<Self, PipelineError> {
        let dt = DateTime::<Utc>::from_timestamp_millis(millis)
            .ok_or(PipelineError::InvalidTimeBucket(millis))?;

        let minute_value = i64::from(dt.year()) * 100_000_000
            + i64::from(dt.month()) * 1_000_000
            + i64::from(dt.day()) * 10_000
            + i64::from(dt.hour()) * 100
            + i64::from(dt.minute());

        Self::new(minute_value)?
            .to_granularity(granularity)
            .ok_or(PipelineError::InvalidTimeBucket(minute_value))
    }

    pub fn value(self) -> i64 {
        self.value
    }

    pub fn granularity(self) -> Granularity {
        self.granularity
    }

    /// Projects onto an equal or coarser granularity.
    ///
    /// Returns `None` when `target` is finer than this bucket.
    pub fn to_granularity(self, target: Granularity) -> Option<Self> {
        let steps = target.rank().checked_sub(self.granularity.rank())?;
        Some(Self {
            value: self.value / 100_i64.pow(steps),
            granularity: target,
        })
    }

    pub fn to_hour(self) -> Option<Self> {
        self.to_granularity(Granularity::Hour)
    }

    pub fn to_day(self) -> Option<Self> {
        self.to_granularity(Granularity::Day)
    }

    pub fn to_month(self) -> Option<Self> {
        self.to_granularity(Granularity::Month)
    }

    /// First instant covered by the bucket.
    pub fn start(self) -> NaiveDateTime {
        // Construction validated the calendar fields.
        start_of(self.value, self.granularity).unwrap_or_default()
    }
}

impl fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl TryFrom<i64> for TimeBucket {
    type Error = PipelineError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

fn start_of(value: i64, granularity: Granularity) -> Option<NaiveDateTime> {
    let (year_month, day, hour, minute) = match granularity {
        Granularity::Month => (value, 1, 0, 0),
        Granularity::Day => (value / 100, value % 100, 0, 0),
        Granularity::Hour => (value / 10_000, value / 100 % 100, value % 100, 0),
        Granularity::Minute => (
            value / 1_000_000,
            value / 10_000 % 100,
            value / 100 % 100,
            value % 100,
        ),
    };

    let year = i32::try_from(year_month / 100).ok()?;
    let month = u32::try_from(year_month % 100).ok()?;

    NaiveDate::from_ymd_opt(year, month, u32::try_from(day).ok()?)?
        .and_hms_opt(u32::try_from(hour).ok()?, u32::try_from(minute).ok()?, 0)
}
