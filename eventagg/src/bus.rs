//! Publish/subscribe contract.
//!
//! Delivery is best effort: no acknowledgements, no backpressure, no replay.

use async_trait::async_trait;
use std::sync::Arc;

use crate::errors::BusError;

/// Callback invoked with `(topic, message)` for every received message.
pub type MessageHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// A topic-based message bus.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish `payload` on `topic`. Returns whether the bus accepted it.
    async fn publish(&self, topic: &str, payload: &str) -> bool;

    /// Invoke `handler` for every message published on `topic` from now on.
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), BusError>;

    /// Drop the connection and stop every subscription.
    async fn close(&self);
}
