//! In-memory storage backend for tests and development.
//!
//! One struct implements every store trait so a single `Arc<MemoryStorage>`
//! can be handed out as each seam. Atomicity of the conditional insert comes
//! from the dedup map's entry lock: the first writer through the entry wins,
//! concurrent duplicates observe an occupied entry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::{DedupStore, EventStore, JobStore, ResultRecord, ResultStore};
use crate::error::{CausewayError, Result};
use crate::events::Event;
use crate::jobs::{Job, JobId, JobStatus};

/// Process-local implementation of all four stores.
#[derive(Default)]
pub struct MemoryStorage {
    events: DashMap<String, Event>,
    dedup: DashMap<String, DateTime<Utc>>,
    jobs: DashMap<Uuid, Job>,
    results: DashMap<Uuid, ResultRecord>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryStorage {
    async fn write_if_absent(&self, event: &Event) -> Result<bool> {
        match self.dedup.entry(event.idempotency_key.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                // Insert the event row while the key's entry lock is held so
                // no concurrent duplicate can observe the key without the row.
                self.events
                    .insert(event.idempotency_key.clone(), event.clone());
                slot.insert(Utc::now());
                Ok(true)
            }
        }
    }

    async fn get(&self, idempotency_key: &str) -> Result<Option<Event>> {
        Ok(self.events.get(idempotency_key).map(|e| e.clone()))
    }

    async fn find_by_payload(&self, filter: &serde_json::Value) -> Result<Vec<Event>> {
        let filter = filter.as_object().cloned().unwrap_or_default();
        let mut events: Vec<Event> = self
            .events
            .iter()
            .filter(|e| {
                filter
                    .iter()
                    .all(|(k, v)| e.payload.get(k) == Some(v))
            })
            .map(|e| e.clone())
            .collect();
        events.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at));
        Ok(events)
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.events.len() as u64)
    }
}

#[async_trait]
impl DedupStore for MemoryStorage {
    async fn contains(&self, idempotency_key: &str) -> Result<bool> {
        Ok(self.dedup.contains_key(idempotency_key))
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let before = self.dedup.len();
        self.dedup.retain(|_, first_seen| *first_seen >= cutoff);
        Ok((before - self.dedup.len()) as u64)
    }
}

#[async_trait]
impl JobStore for MemoryStorage {
    async fn insert(&self, job: &Job) -> Result<()> {
        self.jobs.insert(job.job_id.0, job.clone());
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.get(&job_id.0).map(|j| j.clone()))
    }

    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .map(|j| j.clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn transition(
        &self,
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
        error: Option<String>,
    ) -> Result<Option<Job>> {
        let mut entry = self
            .jobs
            .get_mut(&job_id.0)
            .ok_or_else(|| CausewayError::not_found("Job", job_id))?;

        // The entry lock makes check-and-set atomic against other workers.
        if entry.status != from {
            return Ok(None);
        }

        entry.status = to;
        entry.updated_at = Utc::now();
        if error.is_some() {
            entry.error = error;
        }
        Ok(Some(entry.clone()))
    }

    async fn list_queued_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        Ok(self
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Queued && j.updated_at < cutoff)
            .map(|j| j.clone())
            .collect())
    }

    async fn record_publish_attempt(&self, job_id: JobId) -> Result<()> {
        let mut entry = self
            .jobs
            .get_mut(&job_id.0)
            .ok_or_else(|| CausewayError::not_found("Job", job_id))?;
        entry.publish_attempts += 1;
        entry.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl ResultStore for MemoryStorage {
    async fn upsert(&self, result: &ResultRecord) -> Result<()> {
        self.results.insert(result.job_id.0, result.clone());
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<ResultRecord>> {
        Ok(self.results.get(&job_id.0).map(|r| r.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;
    use serde_json::json;
    use std::sync::Arc;

    fn event(key: &str) -> Event {
        Event {
            idempotency_key: key.to_string(),
            occurred_at: Utc::now(),
            source: "client-1".to_string(),
            payload: json!({"event_type": "purchase"}),
        }
    }

    #[tokio::test]
    async fn test_write_if_absent_single_winner() {
        let store = MemoryStorage::new();
        assert!(store.write_if_absent(&event("evt-1")).await.unwrap());
        assert!(!store.write_if_absent(&event("evt-1")).await.unwrap());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_one_row() {
        let store = Arc::new(MemoryStorage::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.write_if_absent(&event("evt-42")).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dedup_purge_respects_cutoff() {
        let store = MemoryStorage::new();
        store.write_if_absent(&event("old")).await.unwrap();

        // Nothing is older than a cutoff in the past.
        let purged = store
            .purge_older_than(Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(purged, 0);

        let purged = store
            .purge_older_than(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(!store.contains("old").await.unwrap());
    }

    #[tokio::test]
    async fn test_find_by_payload_subset_match() {
        let store = MemoryStorage::new();
        let mut a = event("a");
        a.payload = json!({"campaign_id": "c1", "marketing_channel": "email"});
        let mut b = event("b");
        b.payload = json!({"campaign_id": "c2"});
        store.write_if_absent(&a).await.unwrap();
        store.write_if_absent(&b).await.unwrap();

        let hits = store
            .find_by_payload(&json!({"campaign_id": "c1"}))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].idempotency_key, "a");

        // Empty filter matches everything.
        let all = store.find_by_payload(&json!({})).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_transition_cas() {
        let store = MemoryStorage::new();
        let job = Job::new(&Principal::new("c"), "did", json!({}), 5);
        store.insert(&job).await.unwrap();

        let claimed = store
            .transition(job.job_id, JobStatus::Queued, JobStatus::Running, None)
            .await
            .unwrap();
        assert_eq!(claimed.unwrap().status, JobStatus::Running);

        // Second claim loses the race.
        let second = store
            .transition(job.job_id, JobStatus::Queued, JobStatus::Running, None)
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_transition_unknown_job_is_not_found() {
        let store = MemoryStorage::new();
        let err = store
            .transition(JobId::new(), JobStatus::Queued, JobStatus::Running, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::RecordNotFound);
    }

    #[tokio::test]
    async fn test_list_most_recent_first() {
        let store = MemoryStorage::new();
        let principal = Principal::new("c");
        for i in 0..3 {
            let mut job = Job::new(&principal, "did", json!({}), 5);
            job.created_at = Utc::now() + chrono::Duration::seconds(i);
            store.insert(&job).await.unwrap();
        }

        let listed = store.list(None, 10).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed[0].created_at >= listed[1].created_at);
        assert!(listed[1].created_at >= listed[2].created_at);

        let queued = store.list(Some(JobStatus::Queued), 2).await.unwrap();
        assert_eq!(queued.len(), 2);
    }

    #[tokio::test]
    async fn test_result_upsert_overwrites() {
        let store = MemoryStorage::new();
        let job_id = JobId::new();

        let first = ResultRecord {
            job_id,
            effect_estimates: json!({"effect": 1.0}),
            confidence_intervals: json!({}),
            diagnostics: json!({}),
            written_at: Utc::now(),
        };
        store.upsert(&first).await.unwrap();

        let second = ResultRecord {
            effect_estimates: json!({"effect": 2.0}),
            ..first.clone()
        };
        store.upsert(&second).await.unwrap();

        let stored = ResultStore::get(&store, job_id).await.unwrap().unwrap();
        assert_eq!(stored.effect_estimates["effect"], 2.0);
    }
}
