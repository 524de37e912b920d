//! Ingestion gateway.
//!
//! Accepts client events, normalizes them, and publishes to the broker. The
//! gateway never writes to the event store itself: acceptance is complete
//! once the broker acknowledges the publish, which decouples client-visible
//! latency from storage latency. Durable persistence is the event writer's
//! job on the other side of the broker.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::auth::Principal;
use crate::broker::Broker;
use crate::error::{CausewayError, Result};
use crate::events::{derive_idempotency_key, Event};

/// One event in a submission body.
#[derive(Debug, Clone, Deserialize)]
pub struct EventSubmission {
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub payload: serde_json::Value,
}

/// Gateway response for one accepted event.
#[derive(Debug, Clone, Serialize)]
pub struct SubmittedEvent {
    pub accepted: bool,
    pub event_id: String,
}

/// Publishes normalized events onto the raw-events topic.
pub struct IngestionGateway {
    broker: Arc<dyn Broker>,
    topic: String,
    key_bucket: Duration,
}

impl IngestionGateway {
    pub fn new(broker: Arc<dyn Broker>, topic: impl Into<String>, key_bucket: Duration) -> Self {
        Self {
            broker,
            topic: topic.into(),
            key_bucket,
        }
    }

    /// Accept one event from an authenticated caller.
    ///
    /// When the caller supplies no idempotency key, one is derived from the
    /// caller, the payload, and a coarse time bucket, so an identical retried
    /// call collapses onto the original. A publish failure is retryable;
    /// callers are expected to resubmit with the same key.
    pub async fn submit_event(
        &self,
        principal: &Principal,
        idempotency_key: Option<String>,
        payload: serde_json::Value,
    ) -> Result<SubmittedEvent> {
        if !payload.is_object() {
            return Err(CausewayError::validation("payload must be a JSON object"));
        }

        let occurred_at = extract_occurred_at(&payload)?;
        let source = payload
            .get("source")
            .and_then(|v| v.as_str())
            .unwrap_or(principal.id.as_str())
            .to_string();

        let idempotency_key = match idempotency_key {
            Some(key) => {
                Event::validate_key(&key)?;
                key.trim().to_string()
            }
            None => derive_idempotency_key(principal, &payload, occurred_at, self.key_bucket),
        };

        let event = Event {
            idempotency_key: idempotency_key.clone(),
            occurred_at,
            source,
            payload,
        };

        self.broker
            .publish(&self.topic, serde_json::to_value(&event)?)
            .await?;

        counter!("causeway_events_accepted_total").increment(1);
        debug!(event_id = %idempotency_key, "Event accepted");

        Ok(SubmittedEvent {
            accepted: true,
            event_id: idempotency_key,
        })
    }

    /// Accept a batch. Events are normalized and published individually;
    /// the first publish failure aborts and is reported as retryable.
    pub async fn submit_batch(
        &self,
        principal: &Principal,
        submissions: Vec<EventSubmission>,
    ) -> Result<Vec<SubmittedEvent>> {
        let mut accepted = Vec::with_capacity(submissions.len());
        for submission in submissions {
            accepted.push(
                self.submit_event(principal, submission.idempotency_key, submission.payload)
                    .await?,
            );
        }
        Ok(accepted)
    }
}

/// `occurred_at` from the payload when present and valid, otherwise now.
fn extract_occurred_at(payload: &serde_json::Value) -> Result<DateTime<Utc>> {
    match payload.get("occurred_at").and_then(|v| v.as_str()) {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|at| at.with_timezone(&Utc))
            .map_err(|e| {
                CausewayError::validation(format!("occurred_at must be RFC 3339: {e}"))
            }),
        None => Ok(Utc::now()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, Subscription};
    use serde_json::json;

    fn gateway(broker: &InMemoryBroker) -> IngestionGateway {
        IngestionGateway::new(
            Arc::new(broker.clone()),
            "raw-events",
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn test_submit_publishes_normalized_event() {
        let broker = InMemoryBroker::new();
        let mut sub = broker.subscribe("raw-events").await.unwrap();
        let gateway = gateway(&broker);

        let result = gateway
            .submit_event(
                &Principal::new("client-1"),
                Some("evt-42".to_string()),
                json!({"event_type": "purchase"}),
            )
            .await
            .unwrap();
        assert!(result.accepted);
        assert_eq!(result.event_id, "evt-42");

        let delivery = sub
            .receive(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        let event: Event = serde_json::from_value(delivery.message.payload.clone()).unwrap();
        assert_eq!(event.idempotency_key, "evt-42");
        assert_eq!(event.source, "client-1");
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_unkeyed_retry_collides() {
        let broker = InMemoryBroker::new();
        let gateway = gateway(&broker);
        let principal = Principal::new("client-1");
        let payload = json!({"event_type": "purchase", "occurred_at": "2024-01-15T10:00:00Z"});

        let first = gateway
            .submit_event(&principal, None, payload.clone())
            .await
            .unwrap();
        let second = gateway
            .submit_event(&principal, None, payload)
            .await
            .unwrap();
        assert_eq!(first.event_id, second.event_id);
    }

    #[tokio::test]
    async fn test_rejects_non_object_payload() {
        let broker = InMemoryBroker::new();
        let gateway = gateway(&broker);

        let err = gateway
            .submit_event(&Principal::new("c"), None, json!([1, 2, 3]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn test_publish_failure_is_retryable() {
        let broker = InMemoryBroker::new();
        broker.set_fail_publish(true);
        let gateway = gateway(&broker);

        let err = gateway
            .submit_event(&Principal::new("c"), None, json!({"a": 1}))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_batch_submission() {
        let broker = InMemoryBroker::new();
        let gateway = gateway(&broker);

        let accepted = gateway
            .submit_batch(
                &Principal::new("c"),
                vec![
                    EventSubmission {
                        idempotency_key: Some("a".to_string()),
                        payload: json!({"n": 1}),
                    },
                    EventSubmission {
                        idempotency_key: Some("b".to_string()),
                        payload: json!({"n": 2}),
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(accepted.len(), 2);
        assert_eq!(broker.pending("raw-events"), 2);
    }
}
