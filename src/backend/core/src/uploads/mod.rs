//! Batch file uploads.
//!
//! Clients ask for a short-lived signed URL, then `PUT` file bytes directly
//! to it out of band. Completing an upload publishes a storage-change
//! notification on its own topic; parsing the object into events is a
//! downstream collaborator's job, not the gateway's.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::auth::Principal;
use crate::broker::Broker;
use crate::error::{CausewayError, Result};

/// Response to an upload-URL request.
#[derive(Debug, Clone, Serialize)]
pub struct UploadTicket {
    /// Pre-signed URL the client should `PUT` bytes to
    pub url: String,
    /// Object name the upload will land under
    pub object: String,
}

/// Notification published when an object finishes uploading.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct StorageNotification {
    pub object: String,
    pub uploaded_by: String,
    pub size_bytes: usize,
    pub uploaded_at: DateTime<Utc>,
}

/// Issues signed upload URLs and receives the uploaded bytes.
pub struct UploadManager {
    signing_key: String,
    ttl: Duration,
    base_url: String,
    broker: Arc<dyn Broker>,
    topic: String,
    objects: DashMap<String, Vec<u8>>,
}

impl UploadManager {
    pub fn new(
        signing_key: impl Into<String>,
        ttl: Duration,
        base_url: impl Into<String>,
        broker: Arc<dyn Broker>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            signing_key: signing_key.into(),
            ttl,
            base_url: base_url.into(),
            broker,
            topic: topic.into(),
            objects: DashMap::new(),
        }
    }

    /// Issue a signed URL for an out-of-band object upload.
    pub fn create_upload_url(&self, principal: &Principal) -> UploadTicket {
        let object = format!("{}/{}", principal.id, Uuid::new_v4());
        let expires = (Utc::now()
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::minutes(15)))
        .timestamp();
        let sig = self.sign(&object, expires);

        UploadTicket {
            url: format!(
                "{}/v1/uploads/{object}?expires={expires}&sig={sig}",
                self.base_url
            ),
            object,
        }
    }

    /// Accept the bytes for a previously signed object and publish the
    /// storage-change notification.
    ///
    /// The signature is the authorization: a valid signed URL was only ever
    /// handed to an authenticated caller, whose identity is the object's
    /// first path segment.
    pub async fn receive_object(
        &self,
        object: &str,
        expires: i64,
        sig: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        self.verify(object, expires, sig)?;

        let uploaded_by = object.split('/').next().unwrap_or("unknown").to_string();
        let size_bytes = bytes.len();
        self.objects.insert(object.to_string(), bytes);

        let notification = StorageNotification {
            object: object.to_string(),
            uploaded_by,
            size_bytes,
            uploaded_at: Utc::now(),
        };
        self.broker
            .publish(&self.topic, serde_json::to_value(&notification)?)
            .await?;

        info!(object, size_bytes, "Upload stored and notification published");
        Ok(())
    }

    /// Uploaded bytes for an object, if present.
    pub fn object(&self, name: &str) -> Option<Vec<u8>> {
        self.objects.get(name).map(|b| b.clone())
    }

    fn sign(&self, object: &str, expires: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.signing_key.as_bytes());
        hasher.update([0u8]);
        hasher.update(object.as_bytes());
        hasher.update([0u8]);
        hasher.update(expires.to_be_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }

    fn verify(&self, object: &str, expires: i64, sig: &str) -> Result<()> {
        if Utc::now().timestamp() > expires {
            return Err(CausewayError::validation("upload URL has expired"));
        }
        if self.sign(object, expires) != sig {
            return Err(CausewayError::validation("upload URL signature mismatch"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, Subscription};

    fn manager(broker: &InMemoryBroker) -> UploadManager {
        UploadManager::new(
            "test-signing-key",
            Duration::from_secs(900),
            "http://localhost:8082",
            Arc::new(broker.clone()),
            "storage-events",
        )
    }

    fn split_url(url: &str) -> (String, i64, String) {
        let (path, query) = url.split_once('?').unwrap();
        let object = path
            .strip_prefix("http://localhost:8082/v1/uploads/")
            .unwrap()
            .to_string();
        let mut expires = 0;
        let mut sig = String::new();
        for pair in query.split('&') {
            let (k, v) = pair.split_once('=').unwrap();
            match k {
                "expires" => expires = v.parse().unwrap(),
                "sig" => sig = v.to_string(),
                _ => {}
            }
        }
        (object, expires, sig)
    }

    #[tokio::test]
    async fn test_signed_upload_roundtrip() {
        let broker = InMemoryBroker::new();
        let mut sub = broker.subscribe("storage-events").await.unwrap();
        let manager = manager(&broker);
        let principal = Principal::new("client-1");

        let ticket = manager.create_upload_url(&principal);
        assert!(ticket.object.starts_with("client-1/"));

        let (object, expires, sig) = split_url(&ticket.url);
        assert_eq!(object, ticket.object);

        manager
            .receive_object(&object, expires, &sig, b"a,b,c\n".to_vec())
            .await
            .unwrap();
        assert_eq!(manager.object(&object).unwrap(), b"a,b,c\n".to_vec());

        let delivery = sub
            .receive(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        let notification: StorageNotification =
            serde_json::from_value(delivery.message.payload.clone()).unwrap();
        assert_eq!(notification.object, object);
        assert_eq!(notification.uploaded_by, "client-1");
        assert_eq!(notification.size_bytes, 6);
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_tampered_signature_rejected() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        let principal = Principal::new("client-1");

        let ticket = manager.create_upload_url(&principal);
        let (object, expires, _) = split_url(&ticket.url);

        let err = manager
            .receive_object(&object, expires, "forged", vec![1])
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ValidationError);
        assert!(manager.object(&object).is_none());
    }

    #[tokio::test]
    async fn test_expired_url_rejected() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);

        let object = "client-1/some-object";
        let expires = Utc::now().timestamp() - 10;
        let sig = manager.sign(object, expires);

        let err = manager
            .receive_object(object, expires, &sig, vec![1])
            .await
            .unwrap_err();
        assert!(err.user_message().contains("expired"));
    }
}
