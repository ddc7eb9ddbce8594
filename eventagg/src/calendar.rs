//! Calendar buckets an event is filed under.
//!
//! Deriving buckets for an app's time zone belongs to the request layer; the
//! engine receives request-level [`TimeBuckets`] and asks a [`Calendar`] only
//! when an individual event carries its own timestamp.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Timestamps above this are taken to be milliseconds.
const MILLISECOND_THRESHOLD: i64 = 9_999_999_999;

/// Calendar position of one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBuckets {
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    /// Calendar year.
    pub year: i32,
    /// Month of year, 1-based.
    pub month: u32,
    /// Day of month, 1-based.
    pub day: u32,
    /// Hour of day, 0-23.
    pub hour: u32,
}

impl TimeBuckets {
    /// Buckets of a UTC timestamp given in seconds or milliseconds.
    pub fn from_timestamp(timestamp: i64) -> Option<Self> {
        let seconds = if timestamp > MILLISECOND_THRESHOLD {
            timestamp / 1000
        } else {
            timestamp
        };
        DateTime::<Utc>::from_timestamp(seconds, 0).map(|moment| Self::from_datetime(&moment))
    }

    /// Buckets of a UTC instant.
    pub fn from_datetime(moment: &DateTime<Utc>) -> Self {
        Self {
            timestamp: moment.timestamp(),
            year: moment.year(),
            month: moment.month(),
            day: moment.day(),
            hour: moment.hour(),
        }
    }

    /// Coarse year bucket (`YYYY:0`) keying meta documents.
    pub fn zero(&self) -> String {
        format!("{}:0", self.year)
    }

    /// Month bucket (`YYYY:M`) keying aggregate documents.
    pub fn month_id(&self) -> String {
        format!("{}:{}", self.year, self.month)
    }

    /// Day label (`YYYY.M.D`) stored on raw records.
    pub fn daily(&self) -> String {
        format!("{}.{}.{}", self.year, self.month, self.day)
    }

    /// The bucketed instant in UTC.
    pub fn utc_time(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp(self.timestamp, 0)
    }
}

/// Resolves per-event timestamps into buckets.
pub trait Calendar: Send + Sync {
    /// Buckets for `timestamp` in the app's `timezone`, or `None` if the
    /// timestamp is unusable (the request-level buckets are used instead).
    fn buckets(&self, timezone: &str, timestamp: i64) -> Option<TimeBuckets>;
}

/// Calendar that ignores the app time zone and files everything in UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct UtcCalendar;

impl Calendar for UtcCalendar {
    fn buckets(&self, _timezone: &str, timestamp: i64) -> Option<TimeBuckets> {
        TimeBuckets::from_timestamp(timestamp)
    }
}
