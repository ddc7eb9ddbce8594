//! Applies an aggregation batch to the document store.
//!
//! Two modes:
//!
//! - **Fast**: writes run in a detached task; the caller never sees their
//!   outcome.
//! - **Safe**: writes are awaited. If any fails, every write that succeeded is
//!   reverted with negated increments.
//!
//! Compensation is approximate. It is not atomic, a revert can itself fail, and
//! two overlapping safe batches on the same document can interleave. Failures
//! during compensation are logged and counted in [`Compensation`], never retried.
//!
//! In both modes the app catalog is updated after the document writes, whatever
//! their outcome.

use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::catalog::{CatalogUpdate, CATALOG_COLLECTION};
use crate::errors::{StoreError, StoreResult};
use crate::keys::NO_SEGMENT;
use crate::merge::AggregationBatch;
use crate::store::{DocumentStore, Update};
use crate::types::{AppId, CollectionName};

/// How a batch is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Fire and forget.
    Fast,
    /// Await and compensate on partial failure.
    Safe,
}

impl WriteMode {
    /// Mode selected by an app's `safe` flag.
    pub const fn from_safe_flag(safe: bool) -> Self {
        if safe {
            Self::Safe
        } else {
            Self::Fast
        }
    }
}

/// One planned single-document upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWrite {
    /// Target collection.
    pub collection: CollectionName,
    /// Target document id.
    pub id: String,
    /// Update to apply with upsert.
    pub update: Update,
    /// Increments to negate when compensating; `None` for writes that are not
    /// reverted.
    pub rollback: Option<BTreeMap<String, f64>>,
}

impl DocumentWrite {
    fn revert_update(&self) -> Option<Update> {
        self.rollback.as_ref().map(|increments| {
            increments
                .iter()
                .fold(Update::new(), |update, (path, amount)| update.inc(path.clone(), -amount))
        })
    }
}

/// Turn a batch into single-document writes, meta documents first.
pub fn plan(batch: &AggregationBatch) -> Vec<DocumentWrite> {
    let meta = batch.meta.iter().map(|(key, fields)| {
        let update = fields
            .iter()
            .fold(Update::new(), |update, field| update.set(field.clone(), true))
            .set("m", key.zero.clone())
            .set("s", NO_SEGMENT);
        DocumentWrite {
            collection: key.collection.clone(),
            id: key.id(),
            update,
            rollback: None,
        }
    });

    let aggregates = batch.documents.iter().map(|(key, increments)| {
        let update = increments
            .iter()
            .fold(Update::new(), |update, (path, amount)| update.inc(path.clone(), *amount))
            .set("m", key.month.clone())
            .set("s", key.segment.clone());
        DocumentWrite {
            collection: key.collection.clone(),
            id: key.id(),
            update,
            rollback: Some(increments.clone()),
        }
    });

    meta.chain(aggregates).collect()
}

/// A write that did not go through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedWrite {
    /// Target collection.
    pub collection: String,
    /// Target document id.
    pub id: String,
    /// Store error.
    pub error: StoreError,
}

impl FailedWrite {
    fn new(write: &DocumentWrite, error: StoreError) -> Self {
        Self {
            collection: write.collection.to_string(),
            id: write.id.clone(),
            error,
        }
    }
}

/// Result of compensating a partially applied safe batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compensation {
    /// Writes that failed in the first wave.
    pub failed: Vec<FailedWrite>,
    /// Successful writes that were reverted.
    pub reverted: usize,
    /// Reverts that failed; their documents keep the batch's increments.
    pub revert_failures: Vec<FailedWrite>,
}

/// Outcome of a safe-mode batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every write succeeded.
    Committed,
    /// Some writes failed and the rest were compensated.
    Compensated(Compensation),
}

/// Applies planned writes with bounded concurrency.
#[derive(Debug)]
pub struct WriteCoordinator<S: ?Sized> {
    store: Arc<S>,
    concurrency: usize,
}

impl<S: ?Sized> Clone for WriteCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            concurrency: self.concurrency,
        }
    }
}

impl<S> WriteCoordinator<S>
where
    S: DocumentStore + ?Sized + 'static,
{
    /// Coordinator over `store` allowing `concurrency` in-flight writes.
    pub fn new(store: Arc<S>, concurrency: usize) -> Self {
        Self {
            store,
            concurrency: concurrency.max(1),
        }
    }

    /// Apply every write; results are index-aligned with `writes`.
    pub async fn apply_all(&self, writes: &[DocumentWrite]) -> Vec<StoreResult<()>> {
        let mut completed: Vec<(usize, StoreResult<()>)> = stream::iter(writes.iter().cloned().enumerate())
            .map(|(index, write)| {
                let store = Arc::clone(&self.store);
                async move {
                    let result = store
                        .update(write.collection.as_str(), &write.id, &write.update, true)
                        .await;
                    (index, result)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        completed.sort_by_key(|(index, _)| *index);
        completed.into_iter().map(|(_, result)| result).collect()
    }

    /// Apply writes and compensate if any fails.
    pub async fn apply_safe(&self, writes: &[DocumentWrite]) -> BatchOutcome {
        let results = self.apply_all(writes).await;

        let mut applied = Vec::new();
        let mut failed = Vec::new();
        for (write, result) in writes.iter().zip(results) {
            match result {
                Ok(()) => applied.push(write),
                Err(error) => {
                    warn!(collection = %write.collection, document = %write.id, %error, "document write failed");
                    failed.push(FailedWrite::new(write, error));
                }
            }
        }

        if failed.is_empty() {
            BatchOutcome::Committed
        } else {
            BatchOutcome::Compensated(self.compensate(&applied, failed).await)
        }
    }

    /// Revert `applied` writes by negating their increments, without upsert.
    ///
    /// Writes without a rollback map are left alone.
    pub async fn compensate(&self, applied: &[&DocumentWrite], failed: Vec<FailedWrite>) -> Compensation {
        let reverts: Vec<(CollectionName, String, Update)> = applied
            .iter()
            .filter_map(|write| {
                write
                    .revert_update()
                    .map(|update| (write.collection.clone(), write.id.clone(), update))
            })
            .collect();

        let outcomes: Vec<(CollectionName, String, StoreResult<()>)> = stream::iter(reverts)
            .map(|(collection, id, update)| {
                let store = Arc::clone(&self.store);
                async move {
                    let result = store.update(collection.as_str(), &id, &update, false).await;
                    (collection, id, result)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut compensation = Compensation {
            failed,
            reverted: 0,
            revert_failures: Vec::new(),
        };
        for (collection, id, result) in outcomes {
            match result {
                Ok(()) => compensation.reverted += 1,
                Err(error) => {
                    error!(%collection, document = %id, %error, "compensating write failed");
                    compensation.revert_failures.push(FailedWrite {
                        collection: collection.to_string(),
                        id,
                        error,
                    });
                }
            }
        }
        compensation
    }

    /// Apply writes then the catalog update in a detached task.
    pub fn spawn_fast(
        &self,
        writes: Vec<DocumentWrite>,
        app_id: AppId,
        catalog: CatalogUpdate,
    ) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let results = coordinator.apply_all(&writes).await;
            for (write, result) in writes.iter().zip(results) {
                if let Err(error) = result {
                    warn!(collection = %write.collection, document = %write.id, %error, "document write failed");
                }
            }
            coordinator.update_catalog(&app_id, &catalog).await;
        })
    }

    /// Add newly seen keys and dimensions to the app catalog.
    pub async fn update_catalog(&self, app_id: &AppId, catalog: &CatalogUpdate) {
        if catalog.is_empty() {
            return;
        }

        let update = catalog.to_update();
        match self
            .store
            .update(CATALOG_COLLECTION, app_id.as_ref(), &update, true)
            .await
        {
            Ok(()) => debug!(app_id = %app_id, events = catalog.events().len(), "event catalog updated"),
            Err(error) => warn!(app_id = %app_id, %error, "event catalog update failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::TimeBuckets;
    use crate::keys::{collection_name, shard_postfix};
    use crate::normalize::{AcceptedSegment, NormalizedEvent};
    use serde_json::Value;

    fn planned_value<'a>(write: &'a DocumentWrite, path: &str) -> Option<&'a Value> {
        write.update.set.get(path)
    }

    fn batch() -> AggregationBatch {
        let app_id = AppId::try_new("app1").expect("valid app id");
        AggregationBatch::from_events(&[NormalizedEvent {
            key: "buy".to_string(),
            short_key: "buy".to_string(),
            catalog_key: "buy".to_string(),
            collection: collection_name(&app_id, "buy"),
            count: 2.0,
            sum: None,
            dur: None,
            buckets: TimeBuckets::from_timestamp(1_709_649_000).expect("valid timestamp"),
            segments: vec![AcceptedSegment {
                name: "color".to_string(),
                value: "red".to_string(),
                postfix: shard_postfix("red"),
            }],
        }])
    }

    #[test]
    fn plan_puts_meta_first_without_rollback() {
        let writes = plan(&batch());

        assert_eq!(writes.len(), 3);
        assert_eq!(writes[0].id, "no-segment_2024:0_v");
        assert!(writes[0].rollback.is_none());
        assert_eq!(planned_value(&writes[0], "meta_v2.color.red"), Some(&Value::Bool(true)));
        assert_eq!(planned_value(&writes[0], "m"), Some(&Value::from("2024:0")));
        assert!(writes[1..].iter().all(|write| write.rollback.is_some()));
    }

    #[test]
    fn aggregate_writes_set_month_and_segment() {
        let writes = plan(&batch());
        let segmented = writes
            .iter()
            .find(|write| write.id == "color_2024:3_v")
            .expect("segmented write");

        assert_eq!(planned_value(segmented, "m"), Some(&Value::from("2024:3")));
        assert_eq!(planned_value(segmented, "s"), Some(&Value::from("color")));
        assert_eq!(segmented.update.inc.get("d.red.c"), Some(&2.0));
    }

    #[test]
    fn revert_negates_increments() {
        let writes = plan(&batch());
        let revert = writes[1].revert_update().expect("aggregate write reverts");

        assert!(revert.inc.values().all(|amount| *amount == -2.0));
        assert!(revert.set.is_empty());
    }

    #[test]
    fn safe_flag_selects_mode() {
        assert_eq!(WriteMode::from_safe_flag(true), WriteMode::Safe);
        assert_eq!(WriteMode::from_safe_flag(false), WriteMode::Fast);
    }
}
