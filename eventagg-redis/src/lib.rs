//! Redis adapter for the `EventAgg` message bus
//!
//! [`RedisBus`] implements `MessageBus` on Redis PUBLISH / SUBSCRIBE. The
//! publishing connection is opened on first use and reopened on demand after a
//! failure; each subscription owns a dedicated pub/sub connection serviced by a
//! background task.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use eventagg::bus::{MessageBus, MessageHandler};
use eventagg::config::BusConfig;
use eventagg::errors::BusError;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, ConnectionInfo, IntoConnectionInfo, RedisResult};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Connection info for `config`, carrying its credential as the AUTH password.
pub fn connection_info(config: &BusConfig) -> RedisResult<ConnectionInfo> {
    let mut info = (config.host.as_str(), config.port).into_connection_info()?;
    info.redis.password = config.credential();
    Ok(info)
}

/// Message bus backed by Redis pub/sub.
pub struct RedisBus {
    config: BusConfig,
    connection: Mutex<Option<ConnectionManager>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RedisBus {
    /// Client for `config`. No connection is made until first use.
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            connection: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn client(&self) -> Result<Client, BusError> {
        connection_info(&self.config)
            .and_then(Client::open)
            .map_err(|error| BusError::Connection(error.to_string()))
    }

    async fn connection(&self) -> Result<ConnectionManager, BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            return Ok(connection.clone());
        }

        let connection = ConnectionManager::new(self.client()?)
            .await
            .map_err(|error| BusError::Connection(error.to_string()))?;
        info!(host = %self.config.host, port = self.config.port, "bus connection established");
        *slot = Some(connection.clone());
        Ok(connection)
    }

    async fn drop_connection(&self) {
        *self.connection.lock().await = None;
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, topic: &str, payload: &str) -> bool {
        let mut connection = match self.connection().await {
            Ok(connection) => connection,
            Err(error) => {
                warn!(topic, %error, "bus unavailable, message dropped");
                return false;
            }
        };

        let published: RedisResult<i64> = connection.publish(topic, payload).await;
        match published {
            Ok(receivers) => {
                debug!(topic, receivers, "message published");
                true
            }
            Err(error) => {
                warn!(topic, %error, "publish failed, reconnecting on next use");
                self.drop_connection().await;
                false
            }
        }
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let subscribe_error = |error: redis::RedisError| BusError::Subscribe {
            topic: topic.to_string(),
            detail: error.to_string(),
        };
        let mut pubsub = self
            .client()?
            .get_async_pubsub()
            .await
            .map_err(subscribe_error)?;
        pubsub.subscribe(topic).await.map_err(subscribe_error)?;
        info!(topic, "subscribed");

        let owned_topic = topic.to_string();
        let listener = tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(message) = messages.next().await {
                match message.get_payload::<String>() {
                    Ok(payload) => handler(message.get_channel_name(), &payload),
                    Err(error) => error!(topic = %owned_topic, %error, "unreadable message payload"),
                }
            }
            warn!(topic = %owned_topic, "subscription ended");
        });
        self.listeners.lock().await.push(listener);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.drop_connection().await;
        for listener in self.listeners.lock().await.drain(..) {
            listener.abort();
        }
        info!("bus client closed");
    }
}
