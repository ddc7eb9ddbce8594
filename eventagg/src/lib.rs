//! `EventAgg` - sharded, incremental aggregation of telemetry events
//!
//! Incoming events are validated, limited by per-app cardinality settings and
//! folded into counters bucketed by month and by segmentation value. Counters
//! live in hash-named collections and are spread over 64 shards per dimension,
//! so concurrent requests only ever issue commutative increments.
//!
//! Every event is also kept as an immutable raw record and, when it matches the
//! configured rules, forwarded onto a message bus.
//!
//! ```text
//! EventRequest ──┬─► normalize ─► merge ─► coordinator ─► DocumentStore
//!                └─► raw ─► publish ─► MessageBus
//! ```
//!
//! The store and bus are traits; `eventagg-memory` and `eventagg-redis`
//! provide implementations.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bus;
pub mod calendar;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod errors;
pub mod keys;
pub mod merge;
pub mod normalize;
pub mod publish;
pub mod raw;
pub mod request;
pub mod store;
pub mod types;

pub use bus::{MessageBus, MessageHandler};
pub use calendar::{Calendar, TimeBuckets, UtcCalendar};
pub use config::{AppLimits, BusConfig, EngineConfig, KeySanitization, WriteConcurrency};
pub use coordinator::{BatchOutcome, Compensation, WriteMode};
pub use engine::{response_for, EventEngine, Receipt, Reply};
pub use errors::{BusError, ConfigError, ProcessError, StoreError, StoreResult};
pub use publish::{Condition, DeliveryPolicy, PublishRules};
pub use request::{AppContext, AppUser, EventRequest, IncomingEvent};
pub use store::{Document, DocumentStore, Update};
pub use types::{AppId, CollectionName, ShardPostfix};
