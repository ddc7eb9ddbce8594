//! Inputs handed to the engine by the request layer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::calendar::TimeBuckets;
use crate::config::AppLimits;
use crate::types::AppId;

/// One decoded event exactly as the client sent it.
///
/// Fields are kept loosely typed: a malformed field drops the event during
/// normalization instead of failing the whole batch at decode time, and the
/// raw record keeps the payload verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncomingEvent {
    /// Event key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Value>,
    /// Occurrence count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<Value>,
    /// Summed value, e.g. revenue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum: Option<Value>,
    /// Duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dur: Option<Value>,
    /// Dimension name to value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segmentation: Option<Value>,
    /// Client-side occurrence time, seconds or milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
    /// Anything else the client attached.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IncomingEvent {
    /// Event with a key and count.
    pub fn new(key: impl Into<String>, count: impl Into<Value>) -> Self {
        Self {
            key: Some(Value::String(key.into())),
            count: Some(count.into()),
            ..Self::default()
        }
    }

    /// Attach a sum.
    #[must_use]
    pub fn with_sum(mut self, sum: impl Into<Value>) -> Self {
        self.sum = Some(sum.into());
        self
    }

    /// Attach a duration.
    #[must_use]
    pub fn with_dur(mut self, dur: impl Into<Value>) -> Self {
        self.dur = Some(dur.into());
        self
    }

    /// Attach a client timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(Value::from(timestamp));
        self
    }

    /// Add one segmentation entry.
    #[must_use]
    pub fn with_segment(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let segmentation = self
            .segmentation
            .get_or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(entries) = segmentation {
            let _ = entries.insert(name.into(), value.into());
        }
        self
    }

    /// The key, if it is a non-empty string.
    pub fn key_str(&self) -> Option<&str> {
        self.key
            .as_ref()
            .and_then(Value::as_str)
            .filter(|key| !key.is_empty())
    }

    /// Segmentation entries, if the field is an object.
    pub fn segmentation_map(&self) -> Option<&Map<String, Value>> {
        self.segmentation.as_ref().and_then(Value::as_object)
    }
}

/// The app an event batch belongs to, with its resolved settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppContext {
    /// App identifier.
    pub app_id: AppId,
    /// Display name, copied onto raw records.
    pub app_name: String,
    /// Platform family of the app, copied onto raw records.
    pub app_type: Option<String>,
    /// IANA time zone name of the app.
    pub timezone: String,
    /// Resolved per-app limits and write mode.
    pub limits: AppLimits,
}

impl AppContext {
    /// Context with default limits, UTC and the id as name.
    pub fn new(app_id: AppId) -> Self {
        Self {
            app_name: app_id.as_ref().to_string(),
            app_id,
            app_type: None,
            timezone: "UTC".to_string(),
            limits: AppLimits::default(),
        }
    }

    /// Builder-style limits.
    #[must_use]
    pub fn with_limits(mut self, limits: AppLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Device and location of the user that sent the batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppUser {
    /// Device identifier.
    pub device_id: Option<String>,
    /// App version on the device.
    pub app_version: Option<String>,
    /// Country code.
    pub country: Option<String>,
    /// City.
    pub city: Option<String>,
    /// Operating system.
    pub platform: Option<String>,
    /// Operating system version.
    pub platform_version: Option<String>,
}

/// One request worth of events.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRequest {
    /// Owning app.
    pub app: AppContext,
    /// Sending user, when known.
    pub user: Option<AppUser>,
    /// Request-level calendar buckets.
    pub time: TimeBuckets,
    /// Decoded events.
    pub events: Vec<IncomingEvent>,
    /// Part of a bulk import: the caller sends no per-request reply.
    pub bulk: bool,
}

impl EventRequest {
    /// Request for `app` at `time` carrying `events`.
    pub fn new(app: AppContext, time: TimeBuckets, events: Vec<IncomingEvent>) -> Self {
        Self {
            app,
            user: None,
            time,
            events,
            bulk: false,
        }
    }

    /// Builder-style user.
    #[must_use]
    pub fn with_user(mut self, user: AppUser) -> Self {
        self.user = Some(user);
        self
    }

    /// Builder-style bulk flag.
    #[must_use]
    pub fn bulk(mut self) -> Self {
        self.bulk = true;
        self
    }
}
