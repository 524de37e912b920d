//! Control plane: job submission, status queries, cancellation, and the
//! reconciliation sweep.
//!
//! `submit_job` writes the QUEUED job row and publishes the job message in
//! one logical step. When the publish fails after the row is written the row
//! simply stays QUEUED; the background sweep re-publishes stale QUEUED jobs
//! and gives up (status FAILED) after a bounded number of attempts, so a
//! broker outage delays jobs instead of losing them.

use chrono::Utc;
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::auth::Principal;
use crate::broker::Broker;
use crate::config::ControlConfig;
use crate::error::{CausewayError, ErrorCode, Result};
use crate::jobs::{Job, JobId, JobMessage, JobStatus};
use crate::registry::{ModelInfo, ModelRegistry};
use crate::storage::{JobStore, ResultRecord, ResultStore};

/// Maximum rows a job listing returns regardless of the requested limit.
const LIST_LIMIT_CAP: usize = 500;

/// A job plus its result row, once one exists.
#[derive(Debug, Clone, Serialize)]
pub struct JobDetails {
    #[serde(flatten)]
    pub job: Job,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultRecord>,
}

/// Handle for stopping the reconciliation sweep.
pub struct ReconcilerHandle {
    shutdown: watch::Sender<bool>,
}

impl ReconcilerHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Orchestrates analysis jobs.
pub struct ControlPlane {
    registry: ModelRegistry,
    jobs: Arc<dyn JobStore>,
    results: Arc<dyn ResultStore>,
    broker: Arc<dyn Broker>,
    topic: String,
    config: ControlConfig,
}

impl ControlPlane {
    pub fn new(
        registry: ModelRegistry,
        jobs: Arc<dyn JobStore>,
        results: Arc<dyn ResultStore>,
        broker: Arc<dyn Broker>,
        topic: impl Into<String>,
        config: ControlConfig,
    ) -> Self {
        Self {
            registry,
            jobs,
            results,
            broker,
            topic: topic.into(),
            config,
        }
    }

    /// Submit a new analysis job.
    ///
    /// Validates the model and parameters, writes the QUEUED row, and
    /// publishes the job message. A failed publish is not surfaced: the row
    /// is durable and the reconciliation sweep retries the publish.
    pub async fn submit_job(
        &self,
        principal: &Principal,
        model_name: &str,
        params: serde_json::Value,
        priority: i32,
    ) -> Result<JobId> {
        if !self.registry.contains(model_name) {
            return Err(CausewayError::unknown_model(model_name));
        }
        if !params.is_object() {
            return Err(CausewayError::validation("params must be a JSON object"));
        }
        if !(1..=10).contains(&priority) {
            return Err(CausewayError::validation(
                "priority must be between 1 (highest) and 10",
            ));
        }

        let job = Job::new(principal, model_name, params, priority);
        let job_id = job.job_id;
        self.jobs.insert(&job).await?;

        if let Err(e) = self.publish_job(&job).await {
            // Row stays QUEUED; the sweep will re-publish it.
            counter!("causeway_job_publish_failures_total").increment(1);
            warn!(job_id = %job_id, error = %e, "Job publish failed, deferring to reconciliation");
        }

        counter!("causeway_jobs_submitted_total", "model" => model_name.to_string())
            .increment(1);
        info!(job_id = %job_id, model = model_name, priority, "Job submitted");
        Ok(job_id)
    }

    /// A job with its result attached once the job has succeeded.
    pub async fn get_job(&self, job_id: JobId) -> Result<JobDetails> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| CausewayError::not_found("Job", job_id))?;

        let result = if job.status == JobStatus::Succeeded {
            self.results.get(job_id).await?
        } else {
            None
        };

        Ok(JobDetails { job, result })
    }

    /// List jobs most-recent-first.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Job>> {
        let limit = limit.unwrap_or(50).min(LIST_LIMIT_CAP);
        self.jobs.list(status, limit).await
    }

    /// Registered model catalog.
    pub fn list_models(&self) -> Vec<ModelInfo> {
        self.registry.list()
    }

    /// Cancel a job that has not been claimed yet. The transition has the
    /// same CAS shape as a worker claim, so a cancellation and a claim racing
    /// on one job resolve to exactly one winner. RUNNING jobs are not
    /// interrupted; they run to completion or timeout.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<Job> {
        match self
            .jobs
            .transition(job_id, JobStatus::Queued, JobStatus::Cancelled, None)
            .await?
        {
            Some(job) => {
                info!(job_id = %job_id, "Job cancelled");
                Ok(job)
            }
            None => Err(CausewayError::new(
                ErrorCode::StatusConflict,
                "only queued jobs can be cancelled",
            )),
        }
    }

    async fn publish_job(&self, job: &Job) -> Result<()> {
        // Count the attempt even when the publish fails, so the sweep's
        // give-up bound covers broker outages.
        self.jobs.record_publish_attempt(job.job_id).await?;
        self.broker
            .publish(&self.topic, serde_json::to_value(JobMessage::from(job))?)
            .await?;
        Ok(())
    }

    /// One reconciliation pass: re-publish stale QUEUED jobs, failing those
    /// that exhausted their publish attempts. Returns how many jobs were
    /// re-published.
    pub async fn reconcile_once(&self) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.reconcile_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(120));

        let stale = self.jobs.list_queued_older_than(cutoff).await?;
        let mut republished = 0;

        for job in stale {
            if job.publish_attempts >= self.config.max_publish_attempts {
                let reason = format!(
                    "job message could not be published after {} attempts",
                    job.publish_attempts
                );
                if self
                    .jobs
                    .transition(job.job_id, JobStatus::Queued, JobStatus::Failed, Some(reason))
                    .await?
                    .is_some()
                {
                    counter!("causeway_jobs_reconcile_failed_total").increment(1);
                    warn!(job_id = %job.job_id, "Gave up publishing job");
                }
                continue;
            }

            match self.publish_job(&job).await {
                Ok(()) => {
                    republished += 1;
                    info!(job_id = %job.job_id, attempts = job.publish_attempts + 1, "Re-published stale job");
                }
                Err(e) => {
                    warn!(job_id = %job.job_id, error = %e, "Re-publish failed, will retry next sweep")
                }
            }
        }

        Ok(republished)
    }

    /// Start the periodic reconciliation sweep.
    pub fn start_reconciliation(self: Arc<Self>) -> ReconcilerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = self.config.reconcile_interval;
        let control = self;

        tokio::spawn(async move {
            info!(interval = ?interval, "Reconciliation sweep started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = control.reconcile_once().await {
                            warn!(error = %e, "Reconciliation sweep failed");
                        }
                    }
                }
            }
            info!("Reconciliation sweep stopped");
        });

        ReconcilerHandle {
            shutdown: shutdown_tx,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
