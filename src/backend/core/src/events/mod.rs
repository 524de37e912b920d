//! Canonical event model.
//!
//! An [`Event`] is both the wire message published by the ingestion gateway
//! and the row shape persisted by the event writer. For any accepted
//! idempotency key exactly one event row is ever visible, regardless of how
//! many times the message is delivered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::auth::Principal;
use crate::error::{CausewayError, Result};

/// Maximum accepted idempotency key length.
pub const MAX_KEY_LEN: usize = 256;

/// A normalized analytics event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Deduplication identity. Caller-supplied or gateway-derived.
    pub idempotency_key: String,
    /// When the event happened.
    pub occurred_at: DateTime<Utc>,
    /// Originating principal or platform.
    pub source: String,
    /// Opaque event body. The core never interprets it; analysis models do.
    pub payload: serde_json::Value,
}

impl Event {
    /// Validate an idempotency key supplied by a caller.
    pub fn validate_key(key: &str) -> Result<()> {
        let trimmed = key.trim();
        if trimmed.is_empty() {
            return Err(CausewayError::validation(
                "idempotency_key must be a non-empty string",
            ));
        }
        if trimmed.len() > MAX_KEY_LEN {
            return Err(CausewayError::validation(format!(
                "idempotency_key exceeds {MAX_KEY_LEN} characters"
            )));
        }
        Ok(())
    }
}

/// Derive a deterministic idempotency key for an unkeyed submission.
///
/// The key is a digest of `(caller, payload, coarse time bucket)`, so an
/// identical call retried by the same caller inside one bucket collides with
/// the original instead of producing a second event.
pub fn derive_idempotency_key(
    principal: &Principal,
    payload: &serde_json::Value,
    occurred_at: DateTime<Utc>,
    bucket: Duration,
) -> String {
    let bucket_secs = bucket.as_secs().max(1) as i64;
    let bucket_index = occurred_at.timestamp().div_euclid(bucket_secs);

    let mut hasher = Sha256::new();
    hasher.update(principal.id.as_bytes());
    hasher.update([0u8]);
    // serde_json orders object keys, so equal payloads hash equally.
    hasher.update(payload.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(bucket_index.to_be_bytes());

    hex::encode(hasher.finalize())
}
