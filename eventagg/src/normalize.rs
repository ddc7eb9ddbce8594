//! Validation, canonicalization and cardinality limiting of incoming events.
//!
//! Normalization never fails. Anything malformed or over a limit is dropped,
//! either the whole event or just one dimension, and counted.
//!
//! It runs in two phases so the per-dimension value limit can be checked
//! against stored meta documents without a read per value:
//!
//! 1. [`Normalizer::screen`] applies the key, count, event-limit and
//!    dimension-limit rules and reports which meta buckets it touched.
//! 2. [`Normalizer::finalize`] applies the value limit against a
//!    [`SegmentValueIndex`] prefetched for those buckets.
//!
//! Every key, dimension and value accepted is written back into the working
//! snapshot, so the limits hold inside one batch as well as across batches.

use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

use crate::calendar::{Calendar, TimeBuckets};
use crate::catalog::EventCatalog;
use crate::config::{AppLimits, EngineConfig};
use crate::keys::{
    catalog_key, collection_name, fix_event_key, meta_document_id, sanitize_segment_key,
    sanitize_segment_value, shard_postfix, value_as_text, INTERNAL_EVENT_PREFIX,
};
use crate::request::IncomingEvent;
use crate::store::{validate_path, Document, DocumentStore};
use crate::types::{AppId, CollectionName, ShardPostfix};

const META_FIELD: &str = "meta_v2";

/// Numeric value of a JSON number or numeric string.
pub fn numeric(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}

fn non_zero(value: Option<&Value>) -> Option<f64> {
    value.and_then(numeric).filter(|n| *n != 0.0)
}

fn round_sum(sum: f64) -> f64 {
    (sum * 100_000.0).round() / 100_000.0
}

/// A segmentation entry that survived validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedSegment {
    /// Sanitized dimension name.
    pub name: String,
    /// Sanitized value.
    pub value: String,
    /// Shard of the value.
    pub postfix: ShardPostfix,
}

/// An event that passed the event-level rules; value limits still pending.
#[derive(Debug, Clone, PartialEq)]
pub struct ScreenedEvent {
    event: NormalizedEvent,
}

impl ScreenedEvent {
    /// Meta documents the value limit needs: one per touched shard.
    pub fn meta_targets(&self) -> impl Iterator<Item = MetaTarget> + '_ {
        self.event
            .segments
            .iter()
            .map(|segment| MetaTarget::of(&self.event, segment.postfix))
    }
}

/// Event ready for aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    /// Key as sent.
    pub key: String,
    /// Canonical key.
    pub short_key: String,
    /// Catalog form of the canonical key.
    pub catalog_key: String,
    /// Aggregate collection.
    pub collection: CollectionName,
    /// Occurrence count.
    pub count: f64,
    /// Rounded sum, if provided.
    pub sum: Option<f64>,
    /// Duration, if provided.
    pub dur: Option<f64>,
    /// Calendar buckets.
    pub buckets: TimeBuckets,
    /// Accepted dimensions.
    pub segments: Vec<AcceptedSegment>,
}

/// One `(collection, zero, postfix)` meta document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetaTarget {
    /// Aggregate collection.
    pub collection: CollectionName,
    /// Coarse bucket id.
    pub zero: String,
    /// Shard of the meta document.
    pub postfix: ShardPostfix,
}

impl MetaTarget {
    fn of(event: &NormalizedEvent, postfix: ShardPostfix) -> Self {
        Self {
            collection: event.collection.clone(),
            zero: event.buckets.zero(),
            postfix,
        }
    }

    /// Id of the meta document.
    pub fn document_id(&self) -> String {
        meta_document_id(&self.zero, self.postfix)
    }
}

/// Distinct values already recorded per dimension in each meta document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentValueIndex {
    values: HashMap<MetaTarget, HashMap<String, Vec<String>>>,
}

impl SegmentValueIndex {
    /// Read the meta document of each target, one read per document.
    ///
    /// Read failures are logged and treated as an empty document.
    pub async fn prefetch<S>(store: &S, targets: &BTreeSet<MetaTarget>, concurrency: usize) -> Self
    where
        S: DocumentStore + ?Sized,
    {
        let fetched: Vec<(&MetaTarget, Option<Document>)> = stream::iter(targets)
            .map(|target| async move {
                let id = target.document_id();
                match store
                    .find_one(target.collection.as_str(), &id, &[META_FIELD])
                    .await
                {
                    Ok(document) => (target, document),
                    Err(error) => {
                        warn!(collection = %target.collection, document = %id, %error, "meta document unavailable");
                        (target, None)
                    }
                }
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut index = Self::default();
        for (target, document) in fetched {
            if let Some(document) = document {
                index.absorb(target, &document);
            }
        }
        index
    }

    /// Merge the `meta_v2` map of one meta document into the index.
    pub fn absorb(&mut self, target: &MetaTarget, document: &Document) {
        let Some(Value::Object(meta)) = document.get(META_FIELD) else {
            return;
        };

        let dimensions = self.values.entry(target.clone()).or_default();
        for (dimension, values) in meta {
            if let Value::Object(values) = values {
                let known = dimensions.entry(dimension.clone()).or_default();
                for value in values.keys() {
                    if !known.contains(value) {
                        known.push(value.clone());
                    }
                }
            }
        }
    }

    /// Values known for `dimension` in `target`.
    pub fn values(&self, target: &MetaTarget, dimension: &str) -> &[String] {
        self.values
            .get(target)
            .and_then(|dimensions| dimensions.get(dimension))
            .map_or(&[], Vec::as_slice)
    }

    fn record(&mut self, target: &MetaTarget, dimension: &str, value: &str) {
        let known = self
            .values
            .entry(target.clone())
            .or_default()
            .entry(dimension.to_string())
            .or_default();
        if !known.iter().any(|existing| existing == value) {
            known.push(value.to_string());
        }
    }
}

/// Applies the normalization rules to one request's events.
pub struct Normalizer<'a> {
    config: &'a EngineConfig,
    limits: AppLimits,
    app_id: &'a AppId,
    timezone: &'a str,
    calendar: &'a dyn Calendar,
    request_time: &'a TimeBuckets,
    catalog: EventCatalog,
    dropped_events: usize,
    dropped_segments: usize,
}

impl<'a> Normalizer<'a> {
    /// Normalizer working on a private copy of `catalog`.
    pub fn new(
        config: &'a EngineConfig,
        limits: AppLimits,
        app_id: &'a AppId,
        timezone: &'a str,
        calendar: &'a dyn Calendar,
        request_time: &'a TimeBuckets,
        catalog: EventCatalog,
    ) -> Self {
        Self {
            config,
            limits,
            app_id,
            timezone,
            calendar,
            request_time,
            catalog,
            dropped_events: 0,
            dropped_segments: 0,
        }
    }

    /// Events dropped so far.
    pub const fn dropped_events(&self) -> usize {
        self.dropped_events
    }

    /// Dimensions or values dropped so far.
    pub const fn dropped_segments(&self) -> usize {
        self.dropped_segments
    }

    /// Apply the event-level and dimension-level rules.
    pub fn screen(&mut self, event: &IncomingEvent) -> Option<ScreenedEvent> {
        let screened = self.screen_event(event);
        if screened.is_none() {
            self.dropped_events += 1;
        }
        screened
    }

    fn screen_event(&mut self, event: &IncomingEvent) -> Option<ScreenedEvent> {
        let key = event.key_str()?;
        let count = non_zero(event.count.as_ref())?;

        if key.starts_with(INTERNAL_EVENT_PREFIX) && !self.config.is_whitelisted_internal(key) {
            debug!(app_id = %self.app_id, key, "reserved event key rejected");
            return None;
        }

        let short_key = fix_event_key(key)?;

        if let Some(limit) = self.limits.events() {
            if self.catalog.list.len() >= limit && !self.catalog.knows_event(&short_key) {
                debug!(app_id = %self.app_id, key, limit, "event limit reached");
                return None;
            }
        }
        self.catalog.record_event(&short_key);

        let catalog_key = catalog_key(&short_key);
        let buckets = non_zero(event.timestamp.as_ref())
            .and_then(|timestamp| self.calendar.buckets(self.timezone, timestamp as i64))
            .unwrap_or_else(|| self.request_time.clone());

        let mut normalized = NormalizedEvent {
            key: key.to_string(),
            collection: collection_name(self.app_id, &short_key),
            short_key,
            catalog_key,
            count,
            sum: non_zero(event.sum.as_ref()).map(round_sum),
            dur: non_zero(event.dur.as_ref()),
            buckets,
            segments: Vec::new(),
        };

        if let Some(segmentation) = event.segmentation_map() {
            for (raw_name, raw_value) in segmentation {
                match self.screen_segment(&normalized, raw_name, raw_value) {
                    Some(segment) => normalized.segments.push(segment),
                    None => self.dropped_segments += 1,
                }
            }
        }

        Some(ScreenedEvent { event: normalized })
    }

    fn screen_segment(
        &mut self,
        event: &NormalizedEvent,
        raw_name: &str,
        raw_value: &Value,
    ) -> Option<AcceptedSegment> {
        let name = sanitize_segment_key(raw_name, self.config.key_sanitization);
        if validate_path(&name).is_err() || event.segments.iter().any(|seen| seen.name == name) {
            return None;
        }

        if self.config.is_internally_omitted(&event.key, &name)
            || self
                .catalog
                .is_omitted(&[event.key.as_str(), event.short_key.as_str()], &name)
        {
            return None;
        }

        if let Some(limit) = self.limits.segments() {
            let known = self.catalog.segments_of(&event.catalog_key);
            if known.len() >= limit && !known.contains(&name) {
                debug!(app_id = %self.app_id, key = %event.key, segment = %name, limit, "segment limit reached");
                return None;
            }
        }

        let text = value_as_text(raw_value);
        if text.is_empty() {
            return None;
        }
        let value = sanitize_segment_value(&text);
        if validate_path(&value).is_err() {
            return None;
        }

        self.catalog.record_segment(&event.catalog_key, &name);
        Some(AcceptedSegment {
            postfix: shard_postfix(&value),
            name,
            value,
        })
    }

    /// Apply the per-dimension value limit.
    pub fn finalize(&mut self, screened: ScreenedEvent, index: &mut SegmentValueIndex) -> NormalizedEvent {
        let mut event = screened.event;
        let Some(limit) = self.limits.values() else {
            return event;
        };

        let before = event.segments.len();
        let collection = event.collection.clone();
        let zero = event.buckets.zero();
        event.segments.retain(|segment| {
            let target = MetaTarget {
                collection: collection.clone(),
                zero: zero.clone(),
                postfix: segment.postfix,
            };
            let known = index.values(&target, &segment.name);
            let admitted = known.len() < limit || known.contains(&segment.value);
            if admitted {
                index.record(&target, &segment.name, &segment.value);
            } else {
                debug!(collection = %target.collection, segment = %segment.name, limit, "segment value limit reached");
            }
            admitted
        });
        self.dropped_segments += before - event.segments.len();

        event
    }

    /// Whether the value limit is active, i.e. whether a prefetch is needed.
    pub fn needs_value_index(&self) -> bool {
        self.limits.values().is_some()
    }
}
