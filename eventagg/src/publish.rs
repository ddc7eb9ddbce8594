//! Rule-based forwarding of raw records onto the message bus.
//!
//! A rule set lists apps; each app carries OR-ed groups of AND-ed conditions.
//! A condition names a dot path into the raw record and the values it may
//! hold. A path that does not resolve never matches.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::bus::MessageBus;

/// How many messages one matching record produces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// One publish when at least one group matches.
    #[default]
    OncePerRecord,
    /// One publish per matching group.
    OncePerMatchingGroup,
}

/// Single membership test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Dot path into the record, e.g. `event.segmentation.plan`.
    pub key: String,
    /// Allowed values.
    pub values: Vec<Value>,
}

impl Condition {
    /// Whether the value at `key` is one of `values`.
    pub fn holds(&self, record: &Value) -> bool {
        lookup(record, &self.key).is_some_and(|found| self.values.contains(found))
    }
}

/// Rules for one app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppRule {
    /// App the rule applies to.
    pub app_id: String,
    /// OR-ed groups of AND-ed conditions. Empty matches nothing.
    #[serde(default)]
    pub filter_keys: Vec<Vec<Condition>>,
}

impl AppRule {
    /// Number of groups matching `record`.
    pub fn matching_groups(&self, record: &Value) -> usize {
        self.filter_keys
            .iter()
            .filter(|group| group.iter().all(|condition| condition.holds(record)))
            .count()
    }
}

/// Complete forwarding configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRules {
    /// Bus topic matching records go to.
    pub topic: String,
    /// Per-app rules. Apps not listed publish nothing.
    #[serde(default)]
    pub apps: Vec<AppRule>,
    /// Delivery policy.
    #[serde(default)]
    pub delivery: DeliveryPolicy,
}

impl PublishRules {
    /// Rules publishing to `topic` with no apps yet.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            apps: Vec::new(),
            delivery: DeliveryPolicy::default(),
        }
    }

    /// Builder-style app rule.
    #[must_use]
    pub fn with_app(mut self, app_id: impl Into<String>, filter_keys: Vec<Vec<Condition>>) -> Self {
        self.apps.push(AppRule {
            app_id: app_id.into(),
            filter_keys,
        });
        self
    }

    /// Builder-style delivery policy.
    #[must_use]
    pub fn with_delivery(mut self, delivery: DeliveryPolicy) -> Self {
        self.delivery = delivery;
        self
    }

    /// How many times `record` must be published.
    pub fn deliveries(&self, record: &Value) -> usize {
        let Some(app_id) = record.get("app_id").and_then(app_id_text) else {
            return 0;
        };
        let Some(rule) = self.apps.iter().find(|rule| rule.app_id == app_id) else {
            return 0;
        };

        let groups = rule.matching_groups(record);
        match self.delivery {
            DeliveryPolicy::OncePerRecord => groups.min(1),
            DeliveryPolicy::OncePerMatchingGroup => groups,
        }
    }

    /// Publish `record` as many times as the rules require.
    ///
    /// Returns the number of messages the bus accepted.
    pub async fn publish<B>(&self, bus: &B, record: &Value) -> usize
    where
        B: MessageBus + ?Sized,
    {
        let deliveries = self.deliveries(record);
        if deliveries == 0 {
            return 0;
        }

        let payload = match serde_json::to_string(record) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(topic = %self.topic, %error, "raw record not serializable");
                return 0;
            }
        };

        let mut accepted = 0;
        for _ in 0..deliveries {
            if bus.publish(&self.topic, &payload).await {
                accepted += 1;
            } else {
                warn!(topic = %self.topic, "publish rejected by bus");
            }
        }
        debug!(topic = %self.topic, accepted, "raw record published");
        accepted
    }
}

fn app_id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Follow a dot path through nested objects.
pub fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(record, |current, segment| current.as_object()?.get(segment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cd5_rule(values: &[&str]) -> Vec<Vec<Condition>> {
        vec![vec![Condition {
            key: "event.segmentation.cd5".to_string(),
            values: values.iter().map(|value| json!(value)).collect(),
        }]]
    }

    #[test]
    fn lookup_follows_dot_paths() {
        let record = json!({"event": {"segmentation": {"cd5": "Y"}}});
        assert_eq!(lookup(&record, "event.segmentation.cd5"), Some(&json!("Y")));
        assert_eq!(lookup(&record, "event.missing.cd5"), None);
        assert_eq!(lookup(&record, "event.segmentation.cd5.deeper"), None);
    }

    #[test]
    fn matching_value_publishes_once() {
        let rules = PublishRules::new("paywall-event").with_app("X", cd5_rule(&["Y"]));

        let matching = json!({"app_id": "X", "event": {"segmentation": {"cd5": "Y"}}});
        let other = json!({"app_id": "X", "event": {"segmentation": {"cd5": "Z"}}});

        assert_eq!(rules.deliveries(&matching), 1);
        assert_eq!(rules.deliveries(&other), 0);
    }

    #[test]
    fn unlisted_app_never_publishes() {
        let rules = PublishRules::new("t").with_app("X", Vec::new());
        assert_eq!(rules.deliveries(&json!({"app_id": "W"})), 0);
        assert_eq!(rules.deliveries(&json!({"event": {}})), 0);
    }

    #[test]
    fn empty_filter_matches_no_record() {
        let rules = PublishRules::new("t").with_app("X", Vec::new());
        assert_eq!(rules.deliveries(&json!({"app_id": "X"})), 0);
        assert_eq!(rules.deliveries(&json!({"app_id": "X", "event": {"key": "buy"}})), 0);
    }

    #[test]
    fn conditions_in_a_group_must_all_hold() {
        let rules = PublishRules::new("t").with_app(
            "X",
            vec![vec![
                Condition {
                    key: "event.key".to_string(),
                    values: vec![json!("buy")],
                },
                Condition {
                    key: "country".to_string(),
                    values: vec![json!("DE"), json!("FR")],
                },
            ]],
        );

        assert_eq!(rules.deliveries(&json!({"app_id": "X", "country": "FR", "event": {"key": "buy"}})), 1);
        assert_eq!(rules.deliveries(&json!({"app_id": "X", "country": "US", "event": {"key": "buy"}})), 0);
    }

    #[test]
    fn delivery_policy_controls_duplicates() {
        let groups = vec![
            vec![Condition {
                key: "event.key".to_string(),
                values: vec![json!("buy")],
            }],
            vec![Condition {
                key: "country".to_string(),
                values: vec![json!("DE")],
            }],
        ];
        let record = json!({"app_id": "X", "country": "DE", "event": {"key": "buy"}});

        let once = PublishRules::new("t").with_app("X", groups.clone());
        let per_group = once.clone().with_delivery(DeliveryPolicy::OncePerMatchingGroup);

        assert_eq!(once.deliveries(&record), 1);
        assert_eq!(per_group.deliveries(&record), 2);
    }
}
