//! Event writer.
//!
//! Subscribes to the raw-events topic and performs idempotent writes into the
//! event store. Under arbitrary redelivery the store sees exactly one row per
//! idempotency key: the conditional insert is atomic, a duplicate is the
//! dedup path succeeding and is acked silently, and only infrastructure
//! failures leave a message unacknowledged for the broker to redeliver.

use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Delivery};
use crate::error::Result;
use crate::events::Event;
use crate::storage::{DedupStore, EventStore};

/// How one delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// New event row written
    Written,
    /// Idempotency key already present, row discarded
    DuplicateSuppressed,
    /// Payload was not a valid event; dropped as poison
    Malformed,
}

/// Counters exposed by a running writer.
#[derive(Debug, Clone, Default)]
pub struct WriterStats {
    pub written: Arc<AtomicU64>,
    pub duplicates: Arc<AtomicU64>,
}

impl WriterStats {
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }
}

/// Handle for controlling a running event writer.
pub struct WriterHandle {
    shutdown: watch::Sender<bool>,
    stats: WriterStats,
}

impl WriterHandle {
    /// Signal the writer to stop after its current message.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }
}

/// Broker consumer that persists events.
pub struct EventWriter {
    broker: Arc<dyn Broker>,
    events: Arc<dyn EventStore>,
    dedup: Arc<dyn DedupStore>,
    topic: String,
    poll_timeout: Duration,
    dedup_retention: Duration,
}

impl EventWriter {
    pub fn new(
        broker: Arc<dyn Broker>,
        events: Arc<dyn EventStore>,
        dedup: Arc<dyn DedupStore>,
        topic: impl Into<String>,
        poll_timeout: Duration,
        dedup_retention: Duration,
    ) -> Self {
        Self {
            broker,
            events,
            dedup,
            topic: topic.into(),
            poll_timeout,
            dedup_retention,
        }
    }

    /// Settle a single delivery against the store.
    pub async fn process(events: &dyn EventStore, delivery: Delivery) -> Result<WriteOutcome> {
        let event: Event = match serde_json::from_value(delivery.message.payload.clone()) {
            Ok(event) => event,
            Err(e) => {
                // Poison message: redelivery cannot fix it, so ack and move on.
                error!(message_id = %delivery.message.id, error = %e, "Malformed event message dropped");
                delivery.ack().await?;
                return Ok(WriteOutcome::Malformed);
            }
        };

        match events.write_if_absent(&event).await {
            Ok(true) => {
                counter!("causeway_events_written_total").increment(1);
                debug!(event_id = %event.idempotency_key, "Event written");
                delivery.ack().await?;
                Ok(WriteOutcome::Written)
            }
            Ok(false) => {
                counter!("causeway_events_duplicate_total").increment(1);
                info!(event_id = %event.idempotency_key, "Duplicate suppressed");
                delivery.ack().await?;
                Ok(WriteOutcome::DuplicateSuppressed)
            }
            Err(e) => {
                // Leave unacked; the broker redelivers and the conditional
                // insert keeps the retry harmless.
                warn!(event_id = %event.idempotency_key, error = %e, "Event write failed, message will be redelivered");
                delivery.nack().await?;
                Err(e)
            }
        }
    }

    /// Start the consume loop. Returns a control handle.
    pub async fn start(self) -> Result<WriterHandle> {
        let mut subscription = self.broker.subscribe(&self.topic).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = WriterStats::default();

        let events = self.events.clone();
        let dedup = self.dedup.clone();
        let poll_timeout = self.poll_timeout;
        let dedup_retention = self.dedup_retention;
        let topic = self.topic.clone();
        let loop_stats = stats.clone();

        tokio::spawn(async move {
            info!(topic = %topic, "Event writer started");
            let mut last_purge = tokio::time::Instant::now();

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                // Reclaim dedup keys past the retention horizon once an hour.
                if last_purge.elapsed() >= Duration::from_secs(3600) {
                    last_purge = tokio::time::Instant::now();
                    let cutoff = chrono::Utc::now()
                        - chrono::Duration::from_std(dedup_retention)
                            .unwrap_or_else(|_| chrono::Duration::days(30));
                    match dedup.purge_older_than(cutoff).await {
                        Ok(purged) if purged > 0 => {
                            info!(purged, "Reclaimed expired dedup keys")
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Dedup purge failed"),
                    }
                }

                match subscription.receive(poll_timeout).await {
                    Ok(Some(delivery)) => match Self::process(events.as_ref(), delivery).await {
                        Ok(WriteOutcome::Written) => {
                            loop_stats.written.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(WriteOutcome::DuplicateSuppressed) => {
                            loop_stats.duplicates.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(WriteOutcome::Malformed) => {}
                        Err(_) => {
                            // Store trouble; back off briefly before polling again.
                            tokio::time::sleep(Duration::from_millis(500)).await;
                        }
                    },
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "Broker receive failed, backing off");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }

            info!(topic = %topic, "Event writer stopped");
        });

        Ok(WriterHandle {
            shutdown: shutdown_tx,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::error::CausewayError;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    fn event_json(key: &str) -> serde_json::Value {
        serde_json::to_value(Event {
            idempotency_key: key.to_string(),
            occurred_at: Utc::now(),
            source: "client-1".to_string(),
            payload: json!({"event_type": "purchase"}),
        })
        .unwrap()
    }

    async fn deliver_one(broker: &InMemoryBroker, topic: &str) -> Delivery {
        let mut sub = broker.subscribe(topic).await.unwrap();
        sub.receive(Duration::from_millis(100))
            .await
            .unwrap()
            .expect("expected a delivery")
    }

    #[tokio::test]
    async fn test_process_writes_then_suppresses() {
        let broker = InMemoryBroker::new();
        let storage = Arc::new(MemoryStorage::new());

        broker.publish("t", event_json("evt-1")).await.unwrap();
        broker.publish("t", event_json("evt-1")).await.unwrap();

        let first = deliver_one(&broker, "t").await;
        assert_eq!(
            EventWriter::process(storage.as_ref(), first).await.unwrap(),
            WriteOutcome::Written
        );

        let second = deliver_one(&broker, "t").await;
        assert_eq!(
            EventWriter::process(storage.as_ref(), second)
                .await
                .unwrap(),
            WriteOutcome::DuplicateSuppressed
        );

        assert_eq!(crate::storage::EventStore::count(storage.as_ref()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_malformed_message_is_acked() {
        let broker = InMemoryBroker::new();
        let storage = Arc::new(MemoryStorage::new());

        broker.publish("t", json!({"not": "an event"})).await.unwrap();

        let delivery = deliver_one(&broker, "t").await;
        assert_eq!(
            EventWriter::process(storage.as_ref(), delivery)
                .await
                .unwrap(),
            WriteOutcome::Malformed
        );
        // Acked, so nothing is redelivered.
        assert_eq!(broker.pending("t"), 0);
    }

    struct FailingStore;

    #[async_trait]
    impl EventStore for FailingStore {
        async fn write_if_absent(&self, _event: &Event) -> crate::error::Result<bool> {
            Err(CausewayError::store_unavailable("down for the test"))
        }

        async fn get(&self, _key: &str) -> crate::error::Result<Option<Event>> {
            Ok(None)
        }

        async fn find_by_payload(
            &self,
            _filter: &serde_json::Value,
        ) -> crate::error::Result<Vec<Event>> {
            Ok(vec![])
        }

        async fn count(&self) -> crate::error::Result<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_store_failure_leaves_message_for_redelivery() {
        let broker = InMemoryBroker::new();

        broker.publish("t", event_json("evt-1")).await.unwrap();

        let delivery = deliver_one(&broker, "t").await;
        let err = EventWriter::process(&FailingStore, delivery)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(broker.pending("t"), 1);
    }

    #[tokio::test]
    async fn test_started_writer_drains_topic() {
        let broker = InMemoryBroker::new();
        let storage = Arc::new(MemoryStorage::new());

        let writer = EventWriter::new(
            Arc::new(broker.clone()),
            storage.clone(),
            storage.clone(),
            "raw-events",
            Duration::from_millis(20),
            Duration::from_secs(3600),
        );
        let handle = writer.start().await.unwrap();

        broker.publish("raw-events", event_json("a")).await.unwrap();
        broker.publish("raw-events", event_json("b")).await.unwrap();
        broker.publish("raw-events", event_json("a")).await.unwrap();

        // Wait for the loop to settle all three deliveries.
        for _ in 0..50 {
            if handle.stats().written() + handle.stats().duplicates() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(handle.stats().written(), 2);
        assert_eq!(handle.stats().duplicates(), 1);
        assert_eq!(
            crate::storage::EventStore::count(storage.as_ref()).await.unwrap(),
            2
        );
        handle.shutdown();
    }
}
