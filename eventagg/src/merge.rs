//! Folds normalized events into per-document increments.

use std::collections::{BTreeMap, BTreeSet};

use crate::calendar::TimeBuckets;
use crate::catalog::CatalogUpdate;
use crate::keys::{meta_document_id, NO_SEGMENT};
use crate::normalize::NormalizedEvent;
use crate::types::{CollectionName, ShardPostfix};

/// Count field name.
pub const COUNT: &str = "c";
/// Sum field name.
pub const SUM: &str = "s";
/// Duration field name.
pub const DURATION: &str = "dur";

/// One aggregate document: an unsegmented month bucket, or one shard of a
/// dimension's month bucket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocumentKey {
    /// Owning collection.
    pub collection: CollectionName,
    /// Dimension name, or `no-segment`.
    pub segment: String,
    /// Month id (`YYYY:M`).
    pub month: String,
    /// Shard of segmented documents.
    pub postfix: Option<ShardPostfix>,
}

impl DocumentKey {
    fn unsegmented(collection: CollectionName, month: String) -> Self {
        Self {
            collection,
            segment: NO_SEGMENT.to_string(),
            month,
            postfix: None,
        }
    }

    /// Document id.
    pub fn id(&self) -> String {
        match self.postfix {
            Some(postfix) => format!("{}_{}_{postfix}", self.segment, self.month),
            None => format!("{}_{}", self.segment, self.month),
        }
    }
}

/// One meta document: a shard of a coarse bucket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetaKey {
    /// Owning collection.
    pub collection: CollectionName,
    /// Coarse bucket id (`YYYY:0`).
    pub zero: String,
    /// Shard.
    pub postfix: ShardPostfix,
}

impl MetaKey {
    /// Document id.
    pub fn id(&self) -> String {
        meta_document_id(&self.zero, self.postfix)
    }
}

/// Everything one request writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationBatch {
    /// Increments per aggregate document.
    pub documents: BTreeMap<DocumentKey, BTreeMap<String, f64>>,
    /// Meta field paths to mark per meta document.
    pub meta: BTreeMap<MetaKey, BTreeSet<String>>,
    /// Catalog additions.
    pub catalog: CatalogUpdate,
}

impl AggregationBatch {
    /// Fold every event into a fresh batch.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a NormalizedEvent>) -> Self {
        let mut batch = Self::default();
        for event in events {
            batch.fold(event);
        }
        batch
    }

    /// Merge one event into the batch.
    pub fn fold(&mut self, event: &NormalizedEvent) {
        let buckets = &event.buckets;
        let month = buckets.month_id();
        self.catalog.add_event(&event.short_key);

        let unsegmented = self
            .documents
            .entry(DocumentKey::unsegmented(event.collection.clone(), month.clone()))
            .or_default();
        for (metric, amount) in metrics(event) {
            fill_month(unsegmented, None, buckets, metric, amount);
        }

        for segment in &event.segments {
            self.catalog.add_segment(&event.catalog_key, &segment.name);

            let key = DocumentKey {
                collection: event.collection.clone(),
                segment: segment.name.clone(),
                month: month.clone(),
                postfix: Some(segment.postfix),
            };
            let increments = self.documents.entry(key).or_default();
            for (metric, amount) in metrics(event) {
                fill_month(increments, Some(&segment.value), buckets, metric, amount);
            }

            let meta = self
                .meta
                .entry(MetaKey {
                    collection: event.collection.clone(),
                    zero: buckets.zero(),
                    postfix: segment.postfix,
                })
                .or_default();
            let _ = meta.insert(format!("meta_v2.{}.{}", segment.name, segment.value));
            let _ = meta.insert(format!("meta_v2.segments.{}", segment.name));
        }
    }

    /// True when no event was folded in.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

fn metrics(event: &NormalizedEvent) -> impl Iterator<Item = (&'static str, f64)> {
    [
        Some((COUNT, event.count)),
        event.sum.map(|sum| (SUM, sum)),
        event.dur.map(|dur| (DURATION, dur)),
    ]
    .into_iter()
    .flatten()
}

/// Add `amount` of `metric` at every level of a month document.
///
/// Unsegmented documents get month, day and hour levels; a segment value gets
/// month and day levels only.
pub fn fill_month(
    increments: &mut BTreeMap<String, f64>,
    value: Option<&str>,
    buckets: &TimeBuckets,
    metric: &str,
    amount: f64,
) {
    let day = buckets.day;
    let paths = match value {
        None => vec![
            format!("d.{metric}"),
            format!("d.{day}.{metric}"),
            format!("d.{day}.{}.{metric}", buckets.hour),
        ],
        Some(value) => vec![
            format!("d.{value}.{metric}"),
            format!("d.{day}.{value}.{metric}"),
        ],
    };

    for path in paths {
        *increments.entry(path).or_insert(0.0) += amount;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{collection_name, shard_postfix};
    use crate::normalize::AcceptedSegment;
    use crate::types::AppId;

    fn event(count: f64, segments: &[(&str, &str)]) -> NormalizedEvent {
        let app_id = AppId::try_new("app1").expect("valid app id");
        NormalizedEvent {
            key: "purchase".to_string(),
            short_key: "purchase".to_string(),
            catalog_key: "purchase".to_string(),
            collection: collection_name(&app_id, "purchase"),
            count,
            sum: Some(2.5),
            dur: None,
            buckets: TimeBuckets::from_timestamp(1_709_649_000).expect("valid timestamp"),
            segments: segments
                .iter()
                .map(|(name, value)| AcceptedSegment {
                    name: (*name).to_string(),
                    value: (*value).to_string(),
                    postfix: shard_postfix(value),
                })
                .collect(),
        }
    }

    #[test]
    fn unsegmented_document_has_hour_level() {
        let batch = AggregationBatch::from_events(&[event(1.0, &[])]);

        let (key, increments) = batch.documents.iter().next().expect("one document");
        assert_eq!(key.id(), "no-segment_2024:3");
        assert_eq!(increments.get("d.c"), Some(&1.0));
        assert_eq!(increments.get("d.5.c"), Some(&1.0));
        assert_eq!(increments.get("d.5.14.c"), Some(&1.0));
        assert_eq!(increments.get("d.5.14.s"), Some(&2.5));
        assert!(batch.meta.is_empty());
    }

    #[test]
    fn segmented_document_is_sharded_without_hour_level() {
        let batch = AggregationBatch::from_events(&[event(1.0, &[("color", "red")])]);

        let segmented: Vec<_> = batch
            .documents
            .iter()
            .filter(|(key, _)| key.segment == "color")
            .collect();
        assert_eq!(segmented.len(), 1);

        let (key, increments) = segmented[0];
        assert_eq!(key.id(), "color_2024:3_v");
        assert_eq!(
            increments.keys().map(String::as_str).collect::<Vec<_>>(),
            ["d.5.red.c", "d.5.red.s", "d.red.c", "d.red.s"]
        );
    }

    #[test]
    fn events_in_one_batch_are_summed() {
        let batch = AggregationBatch::from_events(&[
            event(1.0, &[("color", "red")]),
            event(3.0, &[("color", "red")]),
            event(2.0, &[("color", "blue")]),
        ]);

        let unsegmented = batch
            .documents
            .iter()
            .find(|(key, _)| key.postfix.is_none())
            .map(|(_, increments)| increments)
            .expect("unsegmented document");
        assert_eq!(unsegmented.get("d.c"), Some(&6.0));

        let red = batch
            .documents
            .iter()
            .find(|(key, _)| key.postfix == Some(shard_postfix("red")))
            .map(|(_, increments)| increments)
            .expect("red shard");
        assert_eq!(red.get("d.red.c"), Some(&4.0));
    }

    #[test]
    fn meta_and_catalog_record_dimensions() {
        let batch = AggregationBatch::from_events(&[event(1.0, &[("color", "red")])]);

        let (meta_key, fields) = batch.meta.iter().next().expect("one meta document");
        assert_eq!(meta_key.id(), "no-segment_2024:0_v");
        assert!(fields.contains("meta_v2.color.red"));
        assert!(fields.contains("meta_v2.segments.color"));

        assert_eq!(batch.catalog.events(), ["purchase".to_string()]);
        assert_eq!(
            batch.catalog.segments().get("purchase"),
            Some(&vec!["color".to_string()])
        );
    }
}
