//! Engine, per-app and bus configuration.
//!
//! Loading and merging per-app overrides is the caller's job; this module only
//! defines the typed shapes the engine consumes. Numeric knobs that have a
//! sane range use `nutype` so an out-of-range value cannot be constructed.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::errors::ConfigError;
use crate::publish::PublishRules;

/// Upper bound on in-flight document writes for one request.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1024),
    default = 64,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct WriteConcurrency(usize);

/// How segmentation keys are rewritten before they become field names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySanitization {
    /// Strip every leading `$` and replace `.` with `:`.
    #[default]
    Unified,
    /// Replace one leading `$` and every `.` with `:`, matching names already
    /// stored by older deployments (`$a.b` becomes `:a:b`).
    Legacy,
}

/// Per-app limits and write mode, already resolved by the caller.
///
/// A limit of `0` (or `None`) disables that limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppLimits {
    /// Maximum number of distinct event keys per app.
    pub event_limit: Option<usize>,
    /// Maximum number of distinct segmentation dimensions per event key.
    pub event_segmentation_limit: Option<usize>,
    /// Maximum number of distinct values per dimension and coarse bucket.
    pub event_segmentation_value_limit: Option<usize>,
    /// Wait for writes and compensate partial failures.
    pub safe: bool,
}

impl AppLimits {
    /// Limits with every cap disabled.
    pub const fn unlimited() -> Self {
        Self {
            event_limit: None,
            event_segmentation_limit: None,
            event_segmentation_value_limit: None,
            safe: false,
        }
    }

    /// Same limits in safe write mode.
    #[must_use]
    pub const fn safe(mut self) -> Self {
        self.safe = true;
        self
    }

    pub(crate) fn events(&self) -> Option<usize> {
        self.event_limit.filter(|limit| *limit > 0)
    }

    pub(crate) fn segments(&self) -> Option<usize> {
        self.event_segmentation_limit.filter(|limit| *limit > 0)
    }

    pub(crate) fn values(&self) -> Option<usize> {
        self.event_segmentation_value_limit.filter(|limit| *limit > 0)
    }
}

impl Default for AppLimits {
    fn default() -> Self {
        Self {
            event_limit: Some(500),
            event_segmentation_limit: Some(100),
            event_segmentation_value_limit: Some(1000),
            safe: false,
        }
    }
}

/// Process-wide engine settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bound on concurrent document operations per request.
    pub write_concurrency: WriteConcurrency,
    /// Reserved-prefix event keys that are still accepted.
    pub internal_events: Vec<String>,
    /// Dimensions never aggregated, per event key.
    pub internal_omit_segments: HashMap<String, Vec<String>>,
    /// Segmentation key rewriting policy.
    pub key_sanitization: KeySanitization,
    /// Raw-record forwarding rules; `None` disables publishing.
    pub publish: Option<PublishRules>,
}

impl EngineConfig {
    /// Parse a JSON configuration document.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(text).map_err(|error| ConfigError::Parse(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(rules) = &self.publish {
            if rules.topic.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "publish.topic must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Builder-style override of the write concurrency bound.
    #[must_use]
    pub fn with_write_concurrency(mut self, concurrency: WriteConcurrency) -> Self {
        self.write_concurrency = concurrency;
        self
    }

    /// Builder-style publish rules.
    #[must_use]
    pub fn with_publish_rules(mut self, rules: PublishRules) -> Self {
        self.publish = Some(rules);
        self
    }

    /// Builder-style key sanitization policy.
    #[must_use]
    pub fn with_key_sanitization(mut self, mode: KeySanitization) -> Self {
        self.key_sanitization = mode;
        self
    }

    pub(crate) fn is_whitelisted_internal(&self, key: &str) -> bool {
        self.internal_events.iter().any(|internal| internal == key)
    }

    pub(crate) fn is_internally_omitted(&self, key: &str, segment: &str) -> bool {
        self.internal_omit_segments
            .get(key)
            .is_some_and(|omitted| omitted.iter().any(|name| name == segment))
    }
}

/// Connection settings for the message bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Instance id for hosted deployments that authenticate as `id:password`.
    pub instance_id: String,
    /// Password; empty means no authentication.
    pub password: String,
}

impl BusConfig {
    /// Credential sent on connect, if any.
    ///
    /// `instance_id:password` when both are set, the bare password when only
    /// it is set, nothing otherwise.
    pub fn credential(&self) -> Option<String> {
        match (self.instance_id.is_empty(), self.password.is_empty()) {
            (_, true) => None,
            (true, false) => Some(self.password.clone()),
            (false, false) => Some(format!("{}:{}", self.instance_id, self.password)),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            instance_id: String::new(),
            password: String::new(),
        }
    }
}
