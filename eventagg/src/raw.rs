//! Raw event records.
//!
//! Every event of a request is stored verbatim, together with the request's
//! app, user and time context, before any validation. Records are immutable and
//! never read back by the engine. Each stored record is then offered to the
//! publish rules.
//!
//! This path runs detached from aggregation. Insert and publish failures are
//! logged and otherwise ignored.

use chrono::SecondsFormat;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::config::KeySanitization;
use crate::keys::sanitize_segment_key;
use crate::publish::PublishRules;
use crate::request::{EventRequest, IncomingEvent};
use crate::store::{Document, DocumentStore, ID_FIELD};
use crate::types::AppId;

/// Prefix of the per-app raw collections.
pub const RAW_COLLECTION_PREFIX: &str = "events_raw_";

/// Collection holding raw records of `app_id`.
pub fn raw_collection(app_id: &AppId) -> String {
    format!("{RAW_COLLECTION_PREFIX}{app_id}")
}

fn put(record: &mut Document, field: &str, value: Option<&String>) {
    if let Some(value) = value {
        let _ = record.insert(field.to_string(), Value::String(value.clone()));
    }
}

/// Request context shared by every raw record of one request.
pub fn context_record(request: &EventRequest) -> Document {
    let mut record = Map::new();
    let app = &request.app;
    let _ = record.insert("app_id".to_string(), Value::String(app.app_id.to_string()));
    let _ = record.insert("app_name".to_string(), Value::String(app.app_name.clone()));
    put(&mut record, "app_type", app.app_type.as_ref());

    if let Some(user) = &request.user {
        put(&mut record, "device_id", user.device_id.as_ref());
        put(&mut record, "app_version", user.app_version.as_ref());
        put(&mut record, "country", user.country.as_ref());
        put(&mut record, "city", user.city.as_ref());
        put(&mut record, "platform", user.platform.as_ref());
        put(&mut record, "platform_version", user.platform_version.as_ref());
    }

    let time = &request.time;
    let _ = record.insert("timestamp".to_string(), Value::from(time.timestamp));
    let _ = record.insert("date".to_string(), Value::String(time.daily()));
    if let Some(utc) = time.utc_time() {
        let _ = record.insert(
            "utc_time".to_string(),
            Value::String(utc.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
    }
    let _ = record.insert("year".to_string(), Value::from(time.year));
    record
}

/// Full raw record for one event: context, a fresh id and the payload.
///
/// Segmentation keys are rewritten to be storable as field names; values are
/// kept as sent.
pub fn build_record(context: &Document, event: &IncomingEvent, mode: KeySanitization) -> Document {
    let mut payload = match serde_json::to_value(event) {
        Ok(Value::Object(payload)) => payload,
        _ => Map::new(),
    };

    if let Some(Value::Object(segmentation)) = payload.remove("segmentation") {
        let sanitized: Map<String, Value> = segmentation
            .into_iter()
            .map(|(key, value)| (sanitize_segment_key(&key, mode), value))
            .collect();
        let _ = payload.insert("segmentation".to_string(), Value::Object(sanitized));
    }

    let mut record = context.clone();
    let _ = record.insert(ID_FIELD.to_string(), Value::String(Uuid::now_v7().to_string()));
    let _ = record.insert("event".to_string(), Value::Object(payload));
    record
}

/// Stores raw records and forwards them to the bus.
pub struct RawRecorder<S: ?Sized, B: ?Sized> {
    store: Arc<S>,
    bus: Arc<B>,
    rules: Option<Arc<PublishRules>>,
}

impl<S: ?Sized, B: ?Sized> Clone for RawRecorder<S, B> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            bus: Arc::clone(&self.bus),
            rules: self.rules.clone(),
        }
    }
}

impl<S, B> RawRecorder<S, B>
where
    S: DocumentStore + ?Sized + 'static,
    B: MessageBus + ?Sized + 'static,
{
    /// Recorder writing to `store` and publishing per `rules`.
    pub fn new(store: Arc<S>, bus: Arc<B>, rules: Option<Arc<PublishRules>>) -> Self {
        Self { store, bus, rules }
    }

    /// Insert one record, then publish it if the rules match.
    ///
    /// Returns the number of messages published.
    pub async fn record(&self, collection: &str, record: Document) -> usize {
        let view = Value::Object(record.clone());
        if let Err(error) = self.store.insert(collection, record).await {
            let id = view.get(ID_FIELD).and_then(Value::as_str).unwrap_or_default();
            warn!(%collection, record = %id, %error, "raw record insert failed");
        }

        match &self.rules {
            Some(rules) => rules.publish(self.bus.as_ref(), &view).await,
            None => 0,
        }
    }

    /// Record every event of `request` in a detached task.
    pub fn spawn(&self, request: &EventRequest, mode: KeySanitization) -> JoinHandle<usize> {
        let collection = raw_collection(&request.app.app_id);
        let context = context_record(request);
        let records: Vec<Document> = request
            .events
            .iter()
            .map(|event| build_record(&context, event, mode))
            .collect();

        let recorder = self.clone();
        tokio::spawn(async move {
            let mut published = 0;
            for record in records {
                published += recorder.record(&collection, record).await;
            }
            debug!(%collection, published, "raw records stored");
            published
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::TimeBuckets;
    use crate::request::{AppContext, AppUser};
    use serde_json::json;

    fn request() -> EventRequest {
        let app_id = AppId::try_new("X").expect("valid app id");
        let time = TimeBuckets::from_timestamp(1_709_649_000).expect("valid timestamp");
        EventRequest::new(
            AppContext::new(app_id),
            time,
            vec![IncomingEvent::new("buy", 1).with_segment("a.b", "v")],
        )
        .with_user(AppUser {
            device_id: Some("device-1".to_string()),
            country: Some("DE".to_string()),
            ..AppUser::default()
        })
    }

    #[test]
    fn context_carries_app_user_and_time() {
        let context = context_record(&request());

        assert_eq!(context.get("app_id"), Some(&json!("X")));
        assert_eq!(context.get("device_id"), Some(&json!("device-1")));
        assert_eq!(context.get("country"), Some(&json!("DE")));
        assert!(context.get("city").is_none());
        assert_eq!(context.get("date"), Some(&json!("2024.3.5")));
        assert_eq!(context.get("utc_time"), Some(&json!("2024-03-05T14:30:00Z")));
        assert_eq!(context.get("year"), Some(&json!(2024)));
    }

    #[test]
    fn record_sanitizes_segmentation_keys_and_gets_an_id() {
        let request = request();
        let context = context_record(&request);

        let first = build_record(&context, &request.events[0], KeySanitization::Unified);
        let second = build_record(&context, &request.events[0], KeySanitization::Unified);

        assert_eq!(first.get("event").and_then(|e| e.pointer("/segmentation/a:b")), Some(&json!("v")));
        assert_eq!(first.get("event").and_then(|e| e.get("key")), Some(&json!("buy")));
        assert_ne!(first.get(ID_FIELD), second.get(ID_FIELD));
    }

    #[test]
    fn collection_is_app_scoped() {
        let app_id = AppId::try_new("5f1a").expect("valid app id");
        assert_eq!(raw_collection(&app_id), "events_raw_5f1a");
    }
}
