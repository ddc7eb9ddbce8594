//! Raw-record publishing through the engine.

mod common;

use std::sync::Arc;

use common::{engine, request};
use eventagg::{AppLimits, Condition, DeliveryPolicy, EngineConfig, IncomingEvent, PublishRules};
use eventagg_memory::{InMemoryBus, InMemoryDocumentStore};
use serde_json::{json, Value};

const TOPIC: &str = "paywall-event";

fn paywall_rules() -> PublishRules {
    PublishRules::new(TOPIC).with_app(
        "X",
        vec![vec![Condition {
            key: "event.segmentation.cd5".to_string(),
            values: vec![json!("Y")],
        }]],
    )
}

fn paywall(value: &str) -> IncomingEvent {
    IncomingEvent::new("paywall_view", 1).with_segment("cd5", value)
}

async fn publish_count(config: EngineConfig, app: &str, events: Vec<IncomingEvent>) -> (usize, Arc<InMemoryBus>) {
    let store = Arc::new(InMemoryDocumentStore::new());
    let bus = Arc::new(InMemoryBus::new());
    let engine = engine(&store, &bus, config);

    let receipt = engine
        .process(request(app, AppLimits::default(), events))
        .await
        .expect("fast mode never fails");
    (receipt.settled().await, bus)
}

#[tokio::test]
async fn matching_record_is_published_once() {
    // Given: rules for app X on cd5 = Y
    let config = EngineConfig::default().with_publish_rules(paywall_rules());

    // When: a matching event arrives
    let (published, bus) = publish_count(config, "X", vec![paywall("Y")]).await;

    // Then: exactly one message carries the raw record
    assert_eq!(published, 1);
    let messages = bus.published_on(TOPIC);
    assert_eq!(messages.len(), 1);
    let record: Value = serde_json::from_str(&messages[0]).expect("payload is JSON");
    assert_eq!(record.get("app_id"), Some(&json!("X")));
    assert_eq!(record.pointer("/event/segmentation/cd5"), Some(&json!("Y")));
}

#[tokio::test]
async fn non_matching_value_is_not_published() {
    let config = EngineConfig::default().with_publish_rules(paywall_rules());

    let (published, bus) = publish_count(config, "X", vec![paywall("Z")]).await;

    assert_eq!(published, 0);
    assert!(bus.published().is_empty());
}

#[tokio::test]
async fn unlisted_apps_never_publish() {
    let config = EngineConfig::default().with_publish_rules(paywall_rules());

    let (published, bus) = publish_count(config, "other", vec![paywall("Y")]).await;

    assert_eq!(published, 0);
    assert!(bus.published().is_empty());
}

#[tokio::test]
async fn app_with_no_filter_groups_publishes_nothing() {
    let config = EngineConfig::default().with_publish_rules(PublishRules::new(TOPIC).with_app("X", Vec::new()));

    let (published, bus) = publish_count(config, "X", vec![IncomingEvent::new("buy", 1)]).await;

    assert_eq!(published, 0);
    assert!(bus.published().is_empty());
}

#[tokio::test]
async fn each_matching_record_is_published_separately() {
    let config = EngineConfig::default().with_publish_rules(paywall_rules());

    let (published, _) = publish_count(config, "X", vec![paywall("Y"), paywall("Z"), paywall("Y")]).await;

    assert_eq!(published, 2);
}

#[tokio::test]
async fn per_group_delivery_publishes_once_per_matching_group() {
    // Given: two groups that both match, delivered per group
    let rules = PublishRules::new(TOPIC)
        .with_app(
            "X",
            vec![
                vec![Condition {
                    key: "event.segmentation.cd5".to_string(),
                    values: vec![json!("Y")],
                }],
                vec![Condition {
                    key: "event.key".to_string(),
                    values: vec![json!("paywall_view")],
                }],
            ],
        )
        .with_delivery(DeliveryPolicy::OncePerMatchingGroup);
    let config = EngineConfig::default().with_publish_rules(rules);

    // When: one matching event arrives
    let (published, bus) = publish_count(config, "X", vec![paywall("Y")]).await;

    // Then: it is published once per group
    assert_eq!(published, 2);
    assert_eq!(bus.published_on(TOPIC).len(), 2);
}

#[tokio::test]
async fn rejecting_bus_does_not_fail_the_request() {
    // Given: a bus refusing every message
    let store = Arc::new(InMemoryDocumentStore::new());
    let bus = Arc::new(InMemoryBus::new());
    bus.reject_publishes(true);
    let engine = engine(&store, &bus, EngineConfig::default().with_publish_rules(paywall_rules()));

    // When: a matching event arrives
    let receipt = engine
        .process(request("X", AppLimits::default().safe(), vec![paywall("Y")]))
        .await
        .expect("bus failures never reach the caller");

    // Then: nothing is published but the raw record is still stored
    assert_eq!(receipt.settled().await, 0);
    assert_eq!(store.documents("events_raw_X").len(), 1);
}

#[tokio::test]
async fn without_rules_nothing_is_published() {
    let (published, bus) = publish_count(EngineConfig::default(), "X", vec![paywall("Y")]).await;

    assert_eq!(published, 0);
    assert!(bus.published().is_empty());
}
