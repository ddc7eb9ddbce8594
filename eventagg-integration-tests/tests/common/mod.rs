//! Shared fixtures for the engine scenarios.

use std::sync::Arc;

use eventagg::keys::collection_name;
use eventagg::{
    AppContext, AppId, AppLimits, DocumentStore, EngineConfig, EventEngine, EventRequest,
    IncomingEvent, TimeBuckets,
};
use eventagg_memory::InMemoryBus;

/// 2024-03-05 14:30:00 UTC.
pub const REQUEST_TIME: i64 = 1_709_649_000;

pub fn app_id(id: &str) -> AppId {
    AppId::try_new(id).expect("valid app id")
}

pub fn request(app: &str, limits: AppLimits, events: Vec<IncomingEvent>) -> EventRequest {
    let time = TimeBuckets::from_timestamp(REQUEST_TIME).expect("valid timestamp");
    EventRequest::new(AppContext::new(app_id(app)).with_limits(limits), time, events)
}

pub fn collection(app: &str, key: &str) -> String {
    collection_name(&app_id(app), key).to_string()
}

pub fn engine<S>(store: &Arc<S>, bus: &Arc<InMemoryBus>, config: EngineConfig) -> EventEngine<S, InMemoryBus>
where
    S: DocumentStore + 'static,
{
    EventEngine::new(Arc::clone(store), Arc::clone(bus), config)
}
