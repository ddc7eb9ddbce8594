//! Request orchestration.
//!
//! One request runs two independent branches:
//!
//! - raw recording and publishing, always detached
//! - catalog load, normalization, merge and writes
//!
//! Only a compensated safe-mode batch fails the request.

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use crate::bus::MessageBus;
use crate::calendar::{Calendar, UtcCalendar};
use crate::catalog::EventCatalog;
use crate::config::EngineConfig;
use crate::coordinator::{plan, BatchOutcome, WriteCoordinator, WriteMode};
use crate::errors::ProcessError;
use crate::merge::AggregationBatch;
use crate::normalize::{NormalizedEvent, Normalizer, ScreenedEvent, SegmentValueIndex};
use crate::publish::PublishRules;
use crate::raw::RawRecorder;
use crate::request::EventRequest;
use crate::store::DocumentStore;

/// Summary of an accepted request.
#[derive(Debug)]
pub struct Receipt {
    /// Events that reached aggregation.
    pub accepted: usize,
    /// Events dropped by validation or limits.
    pub dropped_events: usize,
    /// Dimensions or values dropped by validation or limits.
    pub dropped_segments: usize,
    /// Write mode used.
    pub mode: WriteMode,
    raw: JoinHandle<usize>,
    writes: Option<JoinHandle<()>>,
}

impl Receipt {
    /// Wait for the detached work of this request.
    ///
    /// Returns the number of raw records published to the bus.
    pub async fn settled(self) -> usize {
        if let Some(writes) = self.writes {
            if let Err(error) = writes.await {
                warn!(%error, "background writes did not finish");
            }
        }
        self.raw.await.unwrap_or_else(|error| {
            warn!(%error, "raw recording did not finish");
            0
        })
    }
}

/// Reply the request layer sends back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    /// HTTP-like status code.
    pub status: u16,
    /// Message body.
    pub message: &'static str,
}

/// Reply for a processed request; bulk imports get none.
pub fn response_for(bulk: bool, result: &Result<Receipt, ProcessError>) -> Option<Reply> {
    if bulk {
        return None;
    }
    Some(match result {
        Ok(_) => Reply {
            status: 200,
            message: "Success",
        },
        Err(_) => Reply {
            status: 500,
            message: "Failure",
        },
    })
}

/// The event aggregation engine.
pub struct EventEngine<S: ?Sized, B: ?Sized> {
    store: Arc<S>,
    bus: Arc<B>,
    config: Arc<EngineConfig>,
    rules: Option<Arc<PublishRules>>,
    calendar: Arc<dyn Calendar>,
}

impl<S: ?Sized, B: ?Sized> Clone for EventEngine<S, B> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            bus: Arc::clone(&self.bus),
            config: Arc::clone(&self.config),
            rules: self.rules.clone(),
            calendar: Arc::clone(&self.calendar),
        }
    }
}

impl<S, B> EventEngine<S, B>
where
    S: DocumentStore + ?Sized + 'static,
    B: MessageBus + ?Sized + 'static,
{
    /// Engine over `store` and `bus`, filing per-event timestamps in UTC.
    pub fn new(store: Arc<S>, bus: Arc<B>, config: EngineConfig) -> Self {
        let rules = config.publish.clone().map(Arc::new);
        Self {
            store,
            bus,
            config: Arc::new(config),
            rules,
            calendar: Arc::new(UtcCalendar),
        }
    }

    /// Use `calendar` for per-event timestamps.
    #[must_use]
    pub fn with_calendar(mut self, calendar: Arc<dyn Calendar>) -> Self {
        self.calendar = calendar;
        self
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Process one request.
    ///
    /// In fast mode the writes are still running when this returns; use
    /// [`Receipt::settled`] to wait for them.
    #[instrument(
        skip_all,
        fields(app_id = %request.app.app_id, events = request.events.len(), safe = request.app.limits.safe)
    )]
    pub async fn process(&self, request: EventRequest) -> Result<Receipt, ProcessError> {
        let mode = WriteMode::from_safe_flag(request.app.limits.safe);
        let recorder = RawRecorder::new(
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
            self.rules.clone(),
        );
        let raw = recorder.spawn(&request, self.config.key_sanitization);

        let app_id = &request.app.app_id;
        let catalog = EventCatalog::load(self.store.as_ref(), app_id).await;
        let concurrency = usize::from(self.config.write_concurrency);

        let mut normalizer = Normalizer::new(
            &self.config,
            request.app.limits,
            app_id,
            &request.app.timezone,
            self.calendar.as_ref(),
            &request.time,
            catalog,
        );

        let screened: Vec<_> = request
            .events
            .iter()
            .filter_map(|event| normalizer.screen(event))
            .collect();

        let mut index = if normalizer.needs_value_index() {
            let targets: BTreeSet<_> = screened.iter().flat_map(ScreenedEvent::meta_targets).collect();
            SegmentValueIndex::prefetch(self.store.as_ref(), &targets, concurrency).await
        } else {
            SegmentValueIndex::default()
        };

        let events: Vec<NormalizedEvent> = screened
            .into_iter()
            .map(|event| normalizer.finalize(event, &mut index))
            .collect();

        let mut receipt = Receipt {
            accepted: events.len(),
            dropped_events: normalizer.dropped_events(),
            dropped_segments: normalizer.dropped_segments(),
            mode,
            raw,
            writes: None,
        };

        let batch = AggregationBatch::from_events(&events);
        if batch.is_empty() {
            debug!(dropped = receipt.dropped_events, "nothing to aggregate");
            return Ok(receipt);
        }

        let writes = plan(&batch);
        let coordinator = WriteCoordinator::new(Arc::clone(&self.store), concurrency);
        debug!(documents = writes.len(), ?mode, "writing aggregates");

        match mode {
            WriteMode::Fast => {
                receipt.writes = Some(coordinator.spawn_fast(writes, app_id.clone(), batch.catalog));
                Ok(receipt)
            }
            WriteMode::Safe => {
                let outcome = coordinator.apply_safe(&writes).await;
                coordinator.update_catalog(app_id, &batch.catalog).await;
                match outcome {
                    BatchOutcome::Committed => Ok(receipt),
                    BatchOutcome::Compensated(compensation) => {
                        error!(
                            failed = compensation.failed.len(),
                            reverted = compensation.reverted,
                            revert_failures = compensation.revert_failures.len(),
                            "batch compensated"
                        );
                        Err(ProcessError::WritesCompensated(compensation))
                    }
                }
            }
        }
    }
}
