use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use eventagg::bus::{MessageBus, MessageHandler};
use eventagg::errors::BusError;
use parking_lot::Mutex;

#[derive(Default)]
struct BusState {
    published: Vec<(String, String)>,
    subscribers: HashMap<String, Vec<MessageHandler>>,
    rejecting: bool,
    closed: bool,
}

/// In-process message bus that records every publish.
///
/// Subscribers are invoked synchronously from `publish`.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl InMemoryBus {
    /// Create an open bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every accepted `(topic, payload)` pair, in publish order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.state.lock().published.clone()
    }

    /// Payloads accepted on `topic`.
    pub fn published_on(&self, topic: &str) -> Vec<String> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|(published_topic, _)| published_topic == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Make every following publish fail, as a broken connection would.
    pub fn reject_publishes(&self, rejecting: bool) {
        self.state.lock().rejecting = rejecting;
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, payload: &str) -> bool {
        let handlers = {
            let mut state = self.state.lock();
            if state.closed || state.rejecting {
                return false;
            }
            state.published.push((topic.to_string(), payload.to_string()));
            state.subscribers.get(topic).cloned().unwrap_or_default()
        };

        for handler in handlers {
            handler(topic, payload);
        }
        true
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), BusError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(BusError::Closed);
        }
        state
            .subscribers
            .entry(topic.to_string())
            .or_default()
            .push(handler);
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.subscribers.clear();
    }
}
