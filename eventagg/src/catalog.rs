//! Per-app catalog of known event keys and segmentation dimensions.

use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::errors::{StoreError, StoreResult};
use crate::store::{Document, DocumentStore, Update};
use crate::types::AppId;

/// Collection holding one catalog document per app, keyed by app id.
pub const CATALOG_COLLECTION: &str = "events";

const CATALOG_FIELDS: [&str; 3] = ["list", "segments", "omitted_segments"];

/// Snapshot of an app's catalog document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EventCatalog {
    /// Known short event keys, in insertion order.
    pub list: Vec<String>,
    /// Dimensions seen per catalog key.
    pub segments: HashMap<String, Vec<String>>,
    /// Dimensions excluded from aggregation per event key.
    pub omitted_segments: HashMap<String, Vec<String>>,
}

impl EventCatalog {
    /// Parse a stored catalog document.
    pub fn from_document(document: Document) -> StoreResult<Self> {
        serde_json::from_value(Value::Object(document))
            .map_err(|error| StoreError::Malformed(format!("event catalog: {error}")))
    }

    /// Load the catalog for `app_id`.
    ///
    /// A missing, unreadable or malformed catalog yields an empty one: the app
    /// is treated as brand new rather than failing the request.
    pub async fn load<S>(store: &S, app_id: &AppId) -> Self
    where
        S: DocumentStore + ?Sized,
    {
        let fetched = store
            .find_one(CATALOG_COLLECTION, app_id.as_ref(), &CATALOG_FIELDS)
            .await
            .and_then(|document| document.map(Self::from_document).transpose());

        match fetched {
            Ok(catalog) => catalog.unwrap_or_default(),
            Err(error) => {
                warn!(app_id = %app_id, %error, "event catalog unavailable, treating app as new");
                Self::default()
            }
        }
    }

    /// Whether `short_key` is already a known event.
    pub fn knows_event(&self, short_key: &str) -> bool {
        self.list.iter().any(|known| known == short_key)
    }

    /// Dimensions recorded for `catalog_key`.
    pub fn segments_of(&self, catalog_key: &str) -> &[String] {
        self.segments.get(catalog_key).map_or(&[], Vec::as_slice)
    }

    /// Whether the app excludes `segment` from aggregation for any of `keys`.
    pub fn is_omitted(&self, keys: &[&str], segment: &str) -> bool {
        keys.iter().any(|key| {
            self.omitted_segments
                .get(*key)
                .is_some_and(|omitted| omitted.iter().any(|name| name == segment))
        })
    }

    pub(crate) fn record_event(&mut self, short_key: &str) {
        if !self.knows_event(short_key) {
            self.list.push(short_key.to_string());
        }
    }

    pub(crate) fn record_segment(&mut self, catalog_key: &str, segment: &str) {
        let known = self.segments.entry(catalog_key.to_string()).or_default();
        if !known.iter().any(|name| name == segment) {
            known.push(segment.to_string());
        }
    }
}

/// Additions to an app catalog produced by one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogUpdate {
    events: Vec<String>,
    segments: BTreeMap<String, Vec<String>>,
}

impl CatalogUpdate {
    /// Note an event key as seen.
    pub fn add_event(&mut self, short_key: &str) {
        if !self.events.iter().any(|known| known == short_key) {
            self.events.push(short_key.to_string());
        }
    }

    /// Note a dimension as seen for a catalog key.
    pub fn add_segment(&mut self, catalog_key: &str, segment: &str) {
        let known = self.segments.entry(catalog_key.to_string()).or_default();
        if !known.iter().any(|name| name == segment) {
            known.push(segment.to_string());
        }
    }

    /// Event keys seen, in first-seen order.
    pub fn events(&self) -> &[String] {
        &self.events
    }

    /// Dimensions seen per catalog key.
    pub const fn segments(&self) -> &BTreeMap<String, Vec<String>> {
        &self.segments
    }

    /// True when the batch contributed nothing.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Set-union update against the catalog document.
    pub fn to_update(&self) -> Update {
        let with_events = Update::new().add_each("list", self.events.iter().cloned());
        self.segments
            .iter()
            .fold(with_events, |update, (catalog_key, names)| {
                update.add_each(format!("segments.{catalog_key}"), names.iter().cloned())
            })
    }
}
