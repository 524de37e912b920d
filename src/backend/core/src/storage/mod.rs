//! Durable store seams.
//!
//! Four logical tables back the system: `events`, `dedup_keys`, `jobs`, and
//! `results`. Each has a trait here so components depend on behavior, not a
//! backend. The contracts encode the two concurrency-critical operations:
//! [`EventStore::write_if_absent`] is a single atomic conditional insert
//! (never a check-then-write pair), and [`JobStore::transition`] is a
//! compare-and-swap on the current status.

mod memory;
mod postgres;

pub use memory::MemoryStorage;
pub use postgres::PgStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::events::Event;
use crate::jobs::{Job, JobId, JobStatus};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Record
// ═══════════════════════════════════════════════════════════════════════════════

/// Persisted output of one successful analysis run. At most one row per job;
/// a retried job overwrites, never appends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub job_id: JobId,
    /// Point estimates keyed by effect name
    pub effect_estimates: serde_json::Value,
    /// Interval bounds keyed by effect name
    pub confidence_intervals: serde_json::Value,
    /// Model-specific diagnostic output
    pub diagnostics: serde_json::Value,
    pub written_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Traits
// ═══════════════════════════════════════════════════════════════════════════════

/// Append-only canonical event table plus its dedup companion.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically reserve the event's idempotency key and insert the row.
    ///
    /// Returns `Ok(true)` when the event was written, `Ok(false)` when the
    /// key was already present (the dedup path succeeding, not an error).
    /// The reservation and the insert are one atomic unit: concurrent
    /// duplicate deliveries resolve to exactly one winner.
    async fn write_if_absent(&self, event: &Event) -> Result<bool>;

    /// Fetch an event by idempotency key.
    async fn get(&self, idempotency_key: &str) -> Result<Option<Event>>;

    /// Events whose payload contains every field of `filter` (an empty
    /// object matches everything). This is the read path analysis models use.
    async fn find_by_payload(&self, filter: &serde_json::Value) -> Result<Vec<Event>>;

    /// Total visible rows.
    async fn count(&self) -> Result<u64>;
}

/// Record of previously accepted idempotency keys.
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn contains(&self, idempotency_key: &str) -> Result<bool>;

    /// Reclaim keys first seen before `cutoff`. Callers must not reuse keys
    /// older than the retention horizon.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Durable job registry. Created by the control plane, mutated by workers;
/// every status mutation is a CAS to avoid lost updates.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &Job) -> Result<()>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>>;

    /// List jobs most-recent-first, optionally filtered by status.
    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>>;

    /// Compare-and-swap the status: applies `from -> to` only if the current
    /// status equals `from`. Returns the updated job on success, `None` when
    /// the job exists but its status has moved on (the caller lost the race),
    /// and `RecordNotFound` when no such job exists.
    async fn transition(
        &self,
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
        error: Option<String>,
    ) -> Result<Option<Job>>;

    /// QUEUED jobs last touched before `cutoff`, for the reconciliation sweep.
    async fn list_queued_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Bump the publish-attempt counter and refresh `updated_at`.
    async fn record_publish_attempt(&self, job_id: JobId) -> Result<()>;
}

/// Per-job analysis outputs.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert or overwrite the single result row for the job.
    async fn upsert(&self, result: &ResultRecord) -> Result<()>;

    async fn get(&self, job_id: JobId) -> Result<Option<ResultRecord>>;
}
