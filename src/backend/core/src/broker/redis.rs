//! Redis-backed broker for production use.
//!
//! Topics map to Redis lists. Delivery uses the reliable-queue pattern:
//! `BLMOVE` shifts a message into a per-consumer processing list, `LREM`
//! on ack removes it, and nack moves it back onto the topic list. Messages
//! stranded in a processing list by a crashed consumer can be reclaimed by
//! an operator; in-process failures always go through nack.

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use super::{Acker, Broker, BrokerMessage, Delivery, Subscription};
use crate::error::{CausewayError, Result};

/// Redis list broker.
pub struct RedisBroker {
    client: redis::Client,
    namespace: String,
}

impl RedisBroker {
    /// Create a broker over an existing Redis client. `namespace` prefixes
    /// every key, e.g. `"causeway"` yields `causeway:raw-events`.
    pub fn new(client: redis::Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Connect to the given Redis URL.
    pub fn connect(url: &str, namespace: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| CausewayError::broker_unavailable(e.to_string()))?;
        Ok(Self::new(client, namespace))
    }

    fn topic_key(&self, topic: &str) -> String {
        format!("{}:{}", self.namespace, topic)
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CausewayError::broker_unavailable(e.to_string()))
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<Uuid> {
        let message = BrokerMessage {
            id: Uuid::new_v4(),
            payload,
        };
        let id = message.id;
        let serialized = serde_json::to_string(&message)?;

        let mut conn = self.conn().await?;
        redis::cmd("RPUSH")
            .arg(self.topic_key(topic))
            .arg(&serialized)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| CausewayError::broker_unavailable(e.to_string()))?;

        tracing::debug!(topic, message_id = %id, "Message published to Redis");
        Ok(id)
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>> {
        let topic_key = self.topic_key(topic);
        let processing_key = format!("{}:processing:{}", topic_key, Uuid::new_v4());
        Ok(Box::new(RedisSubscription {
            client: self.client.clone(),
            topic_key,
            processing_key,
        }))
    }
}

struct RedisSubscription {
    client: redis::Client,
    topic_key: String,
    processing_key: String,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Delivery>> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CausewayError::broker_unavailable(e.to_string()))?;

        let raw: Option<String> = redis::cmd("BLMOVE")
            .arg(&self.topic_key)
            .arg(&self.processing_key)
            .arg("LEFT")
            .arg("RIGHT")
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await
            .map_err(|e| CausewayError::broker_unavailable(e.to_string()))?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let message: BrokerMessage = serde_json::from_str(&raw)?;
        let acker = RedisAcker {
            client: self.client.clone(),
            topic_key: self.topic_key.clone(),
            processing_key: self.processing_key.clone(),
            raw,
        };
        Ok(Some(Delivery::new(message, Box::new(acker))))
    }
}

struct RedisAcker {
    client: redis::Client,
    topic_key: String,
    processing_key: String,
    raw: String,
}

impl RedisAcker {
    async fn remove_from_processing(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> Result<()> {
        redis::cmd("LREM")
            .arg(&self.processing_key)
            .arg(1)
            .arg(&self.raw)
            .query_async::<_, i64>(conn)
            .await
            .map_err(|e| CausewayError::broker_unavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Acker for RedisAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CausewayError::broker_unavailable(e.to_string()))?;
        self.remove_from_processing(&mut conn).await
    }

    async fn nack(self: Box<Self>) -> Result<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CausewayError::broker_unavailable(e.to_string()))?;
        self.remove_from_processing(&mut conn).await?;

        // Head of the list so redelivery is observed promptly.
        redis::cmd("LPUSH")
            .arg(&self.topic_key)
            .arg(&self.raw)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| CausewayError::broker_unavailable(e.to_string()))?;
        Ok(())
    }
}
