//! PostgreSQL storage backend.
//!
//! The conditional insert and the job CAS are single SQL statements so their
//! atomicity rests on the database, not on application-level locking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

use super::{DedupStore, EventStore, JobStore, ResultRecord, ResultStore};
use crate::error::{CausewayError, Result};
use crate::events::Event;
use crate::jobs::{Job, JobId, JobStatus};

/// PostgreSQL implementation of all four stores.
pub struct PgStorage {
    pool: PgPool,
    call_timeout: Duration,
}

impl PgStorage {
    /// Connect a pool and apply the schema.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        call_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| CausewayError::store_unavailable(e.to_string()))?;

        let storage = Self { pool, call_timeout };
        storage.ensure_schema().await?;
        Ok(storage)
    }

    /// Wrap an existing pool (tests, shared pools).
    pub fn with_pool(pool: PgPool, call_timeout: Duration) -> Self {
        Self { pool, call_timeout }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the logical tables if they do not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        const STATEMENTS: &[&str] = &[
            "CREATE TABLE IF NOT EXISTS dedup_keys (
                idempotency_key TEXT PRIMARY KEY,
                first_seen_at   TIMESTAMPTZ NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS events (
                idempotency_key TEXT PRIMARY KEY,
                occurred_at     TIMESTAMPTZ NOT NULL,
                source          TEXT NOT NULL,
                payload         JSONB NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS jobs (
                job_id           UUID PRIMARY KEY,
                principal        TEXT NOT NULL,
                model_name       TEXT NOT NULL,
                params           JSONB NOT NULL,
                priority         INT NOT NULL,
                status           TEXT NOT NULL,
                created_at       TIMESTAMPTZ NOT NULL,
                updated_at       TIMESTAMPTZ NOT NULL,
                error            TEXT,
                publish_attempts INT NOT NULL DEFAULT 0
            )",
            "CREATE INDEX IF NOT EXISTS jobs_created_at_idx ON jobs (created_at DESC)",
            "CREATE INDEX IF NOT EXISTS jobs_status_idx ON jobs (status)",
            "CREATE TABLE IF NOT EXISTS results (
                job_id               UUID PRIMARY KEY,
                effect_estimates     JSONB NOT NULL,
                confidence_intervals JSONB NOT NULL,
                diagnostics          JSONB NOT NULL,
                written_at           TIMESTAMPTZ NOT NULL
            )",
        ];

        for statement in STATEMENTS {
            self.timed(sqlx::query(statement).execute(&self.pool))
                .await?;
        }
        Ok(())
    }

    /// Apply the per-call timeout to a store operation.
    async fn timed<T, E, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<CausewayError>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(CausewayError::store_unavailable(format!(
                "store call exceeded {:?}",
                self.call_timeout
            ))),
        }
    }
}

fn job_from_row(row: &PgRow) -> Result<Job> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<JobStatus>()
        .map_err(CausewayError::internal)?;

    Ok(Job {
        job_id: JobId(row.try_get::<Uuid, _>("job_id")?),
        principal: row.try_get("principal")?,
        model_name: row.try_get("model_name")?,
        params: row.try_get("params")?,
        priority: row.try_get("priority")?,
        status,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        error: row.try_get("error")?,
        publish_attempts: row.try_get::<i32, _>("publish_attempts")? as u32,
    })
}

const JOB_COLUMNS: &str = "job_id, principal, model_name, params, priority, status, \
                           created_at, updated_at, error, publish_attempts";

#[async_trait]
impl EventStore for PgStorage {
    async fn write_if_absent(&self, event: &Event) -> Result<bool> {
        // One statement: the event row is written iff the key reservation
        // took effect, so concurrent duplicates resolve inside Postgres.
        let result = self
            .timed(
                sqlx::query(
                    r#"
                    WITH reserved AS (
                        INSERT INTO dedup_keys (idempotency_key, first_seen_at)
                        VALUES ($1, $2)
                        ON CONFLICT (idempotency_key) DO NOTHING
                        RETURNING idempotency_key
                    )
                    INSERT INTO events (idempotency_key, occurred_at, source, payload)
                    SELECT $1, $3, $4, $5 FROM reserved
                    "#,
                )
                .bind(&event.idempotency_key)
                .bind(Utc::now())
                .bind(event.occurred_at)
                .bind(&event.source)
                .bind(&event.payload)
                .execute(&self.pool),
            )
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, idempotency_key: &str) -> Result<Option<Event>> {
        let row = self
            .timed(
                sqlx::query(
                    "SELECT idempotency_key, occurred_at, source, payload \
                     FROM events WHERE idempotency_key = $1",
                )
                .bind(idempotency_key)
                .fetch_optional(&self.pool),
            )
            .await?;

        row.map(|row| {
            Ok(Event {
                idempotency_key: row.try_get("idempotency_key")?,
                occurred_at: row.try_get("occurred_at")?,
                source: row.try_get("source")?,
                payload: row.try_get("payload")?,
            })
        })
        .transpose()
    }

    async fn find_by_payload(&self, filter: &serde_json::Value) -> Result<Vec<Event>> {
        let rows = self
            .timed(
                sqlx::query(
                    "SELECT idempotency_key, occurred_at, source, payload \
                     FROM events WHERE payload @> $1 ORDER BY occurred_at",
                )
                .bind(filter)
                .fetch_all(&self.pool),
            )
            .await?;

        rows.into_iter()
            .map(|row| {
                Ok(Event {
                    idempotency_key: row.try_get("idempotency_key")?,
                    occurred_at: row.try_get("occurred_at")?,
                    source: row.try_get("source")?,
                    payload: row.try_get("payload")?,
                })
            })
            .collect()
    }

    async fn count(&self) -> Result<u64> {
        let row = self
            .timed(sqlx::query("SELECT COUNT(*) AS n FROM events").fetch_one(&self.pool))
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }
}

#[async_trait]
impl DedupStore for PgStorage {
    async fn contains(&self, idempotency_key: &str) -> Result<bool> {
        let row = self
            .timed(
                sqlx::query("SELECT 1 AS one FROM dedup_keys WHERE idempotency_key = $1")
                    .bind(idempotency_key)
                    .fetch_optional(&self.pool),
            )
            .await?;
        Ok(row.is_some())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = self
            .timed(
                sqlx::query("DELETE FROM dedup_keys WHERE first_seen_at < $1")
                    .bind(cutoff)
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl JobStore for PgStorage {
    async fn insert(&self, job: &Job) -> Result<()> {
        self.timed(
            sqlx::query(
                "INSERT INTO jobs (job_id, principal, model_name, params, priority, status, \
                                   created_at, updated_at, error, publish_attempts) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(job.job_id.0)
            .bind(&job.principal)
            .bind(&job.model_name)
            .bind(&job.params)
            .bind(job.priority)
            .bind(job.status.as_str())
            .bind(job.created_at)
            .bind(job.updated_at)
            .bind(&job.error)
            .bind(job.publish_attempts as i32)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
        let row = self
            .timed(
                sqlx::query(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1"
                ))
                .bind(job_id.0)
                .fetch_optional(&self.pool),
            )
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        let rows = match status {
            Some(status) => {
                self.timed(
                    sqlx::query(&format!(
                        "SELECT {JOB_COLUMNS} FROM jobs WHERE status = $1 \
                         ORDER BY created_at DESC LIMIT $2"
                    ))
                    .bind(status.as_str())
                    .bind(limit as i64)
                    .fetch_all(&self.pool),
                )
                .await?
            }
            None => {
                self.timed(
                    sqlx::query(&format!(
                        "SELECT {JOB_COLUMNS} FROM jobs \
                         ORDER BY created_at DESC LIMIT $1"
                    ))
                    .bind(limit as i64)
                    .fetch_all(&self.pool),
                )
                .await?
            }
        };

        rows.iter().map(job_from_row).collect()
    }

    async fn transition(
        &self,
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
        error: Option<String>,
    ) -> Result<Option<Job>> {
        let row = self
            .timed(
                sqlx::query(&format!(
                    "UPDATE jobs \
                     SET status = $3, updated_at = $4, error = COALESCE($5, error) \
                     WHERE job_id = $1 AND status = $2 \
                     RETURNING {JOB_COLUMNS}"
                ))
                .bind(job_id.0)
                .bind(from.as_str())
                .bind(to.as_str())
                .bind(Utc::now())
                .bind(error)
                .fetch_optional(&self.pool),
            )
            .await?;

        match row {
            Some(row) => Ok(Some(job_from_row(&row)?)),
            None => {
                // Distinguish a lost CAS race from a missing job.
                let exists = self
                    .timed(
                        sqlx::query("SELECT 1 AS one FROM jobs WHERE job_id = $1")
                            .bind(job_id.0)
                            .fetch_optional(&self.pool),
                    )
                    .await?;
                if exists.is_some() {
                    Ok(None)
                } else {
                    Err(CausewayError::not_found("Job", job_id))
                }
            }
        }
    }

    async fn list_queued_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = self
            .timed(
                sqlx::query(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs \
                     WHERE status = 'queued' AND updated_at < $1"
                ))
                .bind(cutoff)
                .fetch_all(&self.pool),
            )
            .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn record_publish_attempt(&self, job_id: JobId) -> Result<()> {
        let result = self
            .timed(
                sqlx::query(
                    "UPDATE jobs SET publish_attempts = publish_attempts + 1, \
                     updated_at = $2 WHERE job_id = $1",
                )
                .bind(job_id.0)
                .bind(Utc::now())
                .execute(&self.pool),
            )
            .await?;

        if result.rows_affected() == 0 {
            return Err(CausewayError::not_found("Job", job_id));
        }
        Ok(())
    }
}

#[async_trait]
impl ResultStore for PgStorage {
    async fn upsert(&self, result: &ResultRecord) -> Result<()> {
        self.timed(
            sqlx::query(
                "INSERT INTO results (job_id, effect_estimates, confidence_intervals, \
                                      diagnostics, written_at) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (job_id) DO UPDATE SET \
                     effect_estimates = EXCLUDED.effect_estimates, \
                     confidence_intervals = EXCLUDED.confidence_intervals, \
                     diagnostics = EXCLUDED.diagnostics, \
                     written_at = EXCLUDED.written_at",
            )
            .bind(result.job_id.0)
            .bind(&result.effect_estimates)
            .bind(&result.confidence_intervals)
            .bind(&result.diagnostics)
            .bind(result.written_at)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<ResultRecord>> {
        let row = self
            .timed(
                sqlx::query(
                    "SELECT job_id, effect_estimates, confidence_intervals, diagnostics, \
                     written_at FROM results WHERE job_id = $1",
                )
                .bind(job_id.0)
                .fetch_optional(&self.pool),
            )
            .await?;

        row.map(|row| {
            Ok(ResultRecord {
                job_id: JobId(row.try_get::<Uuid, _>("job_id")?),
                effect_estimates: row.try_get("effect_estimates")?,
                confidence_intervals: row.try_get("confidence_intervals")?,
                diagnostics: row.try_get("diagnostics")?,
                written_at: row.try_get("written_at")?,
            })
        })
        .transpose()
    }
}
