//! At-least-once message broker.
//!
//! The broker connects the ingestion gateway to the event writer and the
//! control plane to the analysis workers. Delivery semantics are
//! at-least-once: a message may be redelivered after a nack or an unclean
//! consumer exit, never silently dropped. Consumers are expected to be
//! idempotent; the dedup store and the job claim step make them so.
//!
//! Two backends are provided: an in-process broker used by tests and dev
//! mode, and a Redis list-based broker for production deployments.

mod redis;

pub use self::redis::RedisBroker;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::{CausewayError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Message
// ═══════════════════════════════════════════════════════════════════════════════

/// A message traveling through the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerMessage {
    /// Broker-assigned message identifier. Redeliveries keep the same id.
    pub id: Uuid,
    /// Message body. Producers publish JSON; consumers deserialize it.
    pub payload: serde_json::Value,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Broker Traits
// ═══════════════════════════════════════════════════════════════════════════════

/// Publisher half of the broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a message. Returns once the broker has accepted it.
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<Uuid>;

    /// Open a competing-consumer subscription on a topic.
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>>;
}

/// Consumer half of the broker. Each subscription competes with every other
/// subscription on the same topic for messages.
#[async_trait]
pub trait Subscription: Send {
    /// Block until a message is available or `timeout` elapses.
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Delivery>>;
}

/// Backend hook for acknowledging a single delivery.
#[async_trait]
pub trait Acker: Send {
    async fn ack(self: Box<Self>) -> Result<()>;
    async fn nack(self: Box<Self>) -> Result<()>;
}

/// A received message plus its acknowledgement handle.
///
/// Dropping a delivery without acking counts as a nack on backends that can
/// observe it; callers should ack or nack explicitly.
pub struct Delivery {
    pub message: BrokerMessage,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(message: BrokerMessage, acker: Box<dyn Acker>) -> Self {
        Self { message, acker }
    }

    /// Remove the message from the topic permanently.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Return the message to the topic for redelivery.
    pub async fn nack(self) -> Result<()> {
        self.acker.nack().await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Broker
// ═══════════════════════════════════════════════════════════════════════════════

struct TopicQueue {
    pending: Mutex<VecDeque<BrokerMessage>>,
    notify: Notify,
}

impl TopicQueue {
    fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push(&self, message: BrokerMessage) {
        self.pending.lock().push_back(message);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<BrokerMessage> {
        self.pending.lock().pop_front()
    }
}

/// In-process broker for tests and development.
///
/// Redelivery is implemented by handing each consumer an acker that returns
/// the message to the head of the queue on nack (or on drop, covering
/// consumers that die mid-message).
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<InMemoryInner>,
}

#[derive(Default)]
struct InMemoryInner {
    topics: Mutex<HashMap<String, Arc<TopicQueue>>>,
    fail_publish: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail. Lets tests exercise the
    /// publish-failure and reconciliation paths.
    pub fn set_fail_publish(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Number of undelivered messages currently parked on a topic.
    pub fn pending(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map(|q| q.pending.lock().len())
            .unwrap_or(0)
    }

    fn topic(&self, name: &str) -> Arc<TopicQueue> {
        self.inner
            .topics
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TopicQueue::new()))
            .clone()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<Uuid> {
        if self.inner.fail_publish.load(Ordering::SeqCst) {
            return Err(CausewayError::broker_unavailable(
                "in-memory broker publish failure injected",
            ));
        }

        let message = BrokerMessage {
            id: Uuid::new_v4(),
            payload,
        };
        let id = message.id;
        self.topic(topic).push(message);
        tracing::debug!(topic, message_id = %id, "Message published");
        Ok(id)
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>> {
        Ok(Box::new(InMemorySubscription {
            queue: self.topic(topic),
        }))
    }
}

struct InMemorySubscription {
    queue: Arc<TopicQueue>,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(message) = self.queue.pop() {
                let acker = InMemoryAcker {
                    queue: self.queue.clone(),
                    message: Some(message.clone()),
                };
                return Ok(Some(Delivery::new(message, Box::new(acker))));
            }

            let notified = self.queue.notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

struct InMemoryAcker {
    queue: Arc<TopicQueue>,
    message: Option<BrokerMessage>,
}

impl InMemoryAcker {
    fn requeue(&mut self) {
        if let Some(message) = self.message.take() {
            // Front of the queue so the redelivery is observed promptly.
            self.queue.pending.lock().push_front(message);
            self.queue.notify.notify_one();
        }
    }
}

#[async_trait]
impl Acker for InMemoryAcker {
    async fn ack(mut self: Box<Self>) -> Result<()> {
        self.message.take();
        Ok(())
    }

    async fn nack(mut self: Box<Self>) -> Result<()> {
        self.requeue();
        Ok(())
    }
}

impl Drop for InMemoryAcker {
    fn drop(&mut self) {
        self.requeue();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_receive_ack() {
        let broker = InMemoryBroker::new();
        let mut sub = broker.subscribe("t").await.unwrap();

        broker.publish("t", json!({"n": 1})).await.unwrap();

        let delivery = sub
            .receive(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message.payload["n"], 1);
        delivery.ack().await.unwrap();

        assert_eq!(broker.pending("t"), 0);
        assert!(sub
            .receive(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_nack_redelivers_same_message() {
        let broker = InMemoryBroker::new();
        let mut sub = broker.subscribe("t").await.unwrap();

        let id = broker.publish("t", json!({"n": 1})).await.unwrap();

        let first = sub
            .receive(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        first.nack().await.unwrap();

        let second = sub
            .receive(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.message.id, id);
        second.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_delivery_is_redelivered() {
        let broker = InMemoryBroker::new();
        let mut sub = broker.subscribe("t").await.unwrap();

        let id = broker.publish("t", json!({})).await.unwrap();

        let delivery = sub
            .receive(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        drop(delivery);

        let redelivered = sub
            .receive(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(redelivered.message.id, id);
    }

    #[tokio::test]
    async fn test_competing_consumers_split_messages() {
        let broker = InMemoryBroker::new();
        let mut a = broker.subscribe("t").await.unwrap();
        let mut b = broker.subscribe("t").await.unwrap();

        broker.publish("t", json!({"n": 1})).await.unwrap();
        broker.publish("t", json!({"n": 2})).await.unwrap();

        let da = a
            .receive(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        let db = b
            .receive(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(da.message.id, db.message.id);
        da.ack().await.unwrap();
        db.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_times_out_on_empty_topic() {
        let broker = InMemoryBroker::new();
        let mut sub = broker.subscribe("t").await.unwrap();

        let start = tokio::time::Instant::now();
        let delivery = sub.receive(Duration::from_millis(30)).await.unwrap();
        assert!(delivery.is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_publish_failure_injection() {
        let broker = InMemoryBroker::new();
        broker.set_fail_publish(true);
        let err = broker.publish("t", json!({})).await.unwrap_err();
        assert!(err.is_retryable());

        broker.set_fail_publish(false);
        broker.publish("t", json!({})).await.unwrap();
    }
}
