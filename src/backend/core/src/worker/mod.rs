//! Analysis worker.
//!
//! Consumes job messages and drives each job through its state machine:
//! claim (CAS QUEUED -> RUNNING), resolve the model, execute the two plugin
//! stages under the execution timeout, persist the outcome. Any number of
//! workers can run against the same topic; the claim step guarantees a
//! delivered-twice message is a no-op on the second delivery.
//!
//! Ack policy: domain outcomes (success, plugin error, timeout, lost claim)
//! always ack. Only infrastructure failures leave the message unacknowledged
//! so the broker redelivers it.

use chrono::Utc;
use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};

use crate::broker::{Broker, Delivery};
use crate::config::WorkerConfig;
use crate::error::{CausewayError, ErrorCode, Result};
use crate::jobs::{JobId, JobMessage, JobStatus};
use crate::registry::{AnalysisOutput, ModelContext, ModelRegistry};
use crate::storage::{EventStore, JobStore, ResultRecord, ResultStore};

/// How one job message was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Result persisted, job SUCCEEDED
    Succeeded,
    /// Plugin error or timeout captured, job FAILED
    Failed,
    /// Another worker (or an earlier delivery) owns the job
    Discarded,
    /// Message was not a valid job message; dropped as poison
    Malformed,
}

/// Counters exposed by a running worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub processed: Arc<AtomicU64>,
    pub succeeded: Arc<AtomicU64>,
    pub failed: Arc<AtomicU64>,
    pub discarded: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    fn record(&self, outcome: JobOutcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        match outcome {
            JobOutcome::Succeeded => self.succeeded.fetch_add(1, Ordering::Relaxed),
            JobOutcome::Failed => self.failed.fetch_add(1, Ordering::Relaxed),
            JobOutcome::Discarded => self.discarded.fetch_add(1, Ordering::Relaxed),
            JobOutcome::Malformed => 0,
        };
    }
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    stats: WorkerStats,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }
}

/// Job consumer executing analysis models.
#[derive(Clone)]
pub struct AnalysisWorker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    registry: ModelRegistry,
    broker: Arc<dyn Broker>,
    jobs: Arc<dyn JobStore>,
    results: Arc<dyn ResultStore>,
    events: Arc<dyn EventStore>,
    topic: String,
    poll_timeout: Duration,
    config: WorkerConfig,
    stats: WorkerStats,
}

impl AnalysisWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: ModelRegistry,
        broker: Arc<dyn Broker>,
        jobs: Arc<dyn JobStore>,
        results: Arc<dyn ResultStore>,
        events: Arc<dyn EventStore>,
        topic: impl Into<String>,
        poll_timeout: Duration,
        config: WorkerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                registry,
                broker,
                jobs,
                results,
                events,
                topic: topic.into(),
                poll_timeout,
                config,
                stats: WorkerStats::default(),
            }),
        }
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.inner.stats
    }

    /// Settle one delivery. Exposed for direct use in tests; the started
    /// worker calls this from its consume loop.
    pub async fn process_delivery(&self, delivery: Delivery) -> Result<JobOutcome> {
        let outcome = self.inner.process_delivery(delivery).await?;
        self.inner.stats.record(outcome);
        Ok(outcome)
    }

    /// Start the consume loop. Concurrent executions are bounded by the
    /// configured concurrency; the loop itself never blocks on a running
    /// analysis.
    pub async fn start(&self) -> Result<WorkerHandle> {
        let mut subscription = self.inner.broker.subscribe(&self.inner.topic).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(inner.config.concurrency));
            info!(
                worker = %inner.config.name,
                topic = %inner.topic,
                concurrency = inner.config.concurrency,
                "Analysis worker started"
            );

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                match subscription.receive(inner.poll_timeout).await {
                    Ok(Some(delivery)) => {
                        let task_inner = inner.clone();
                        tokio::spawn(async move {
                            let _permit = permit;
                            match task_inner.process_delivery(delivery).await {
                                Ok(outcome) => task_inner.stats.record(outcome),
                                Err(e) => {
                                    warn!(error = %e, "Job message left for redelivery")
                                }
                            }
                        });
                    }
                    Ok(None) => drop(permit),
                    Err(e) => {
                        drop(permit);
                        warn!(error = %e, "Broker receive failed, backing off");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }

            info!(worker = %inner.config.name, "Analysis worker stopped");
        });

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            stats: self.inner.stats.clone(),
        })
    }
}

impl WorkerInner {
    async fn process_delivery(&self, delivery: Delivery) -> Result<JobOutcome> {
        let message: JobMessage = match serde_json::from_value(delivery.message.payload.clone()) {
            Ok(message) => message,
            Err(e) => {
                error!(message_id = %delivery.message.id, error = %e, "Malformed job message dropped");
                delivery.ack().await?;
                return Ok(JobOutcome::Malformed);
            }
        };
        let job_id = message.job_id;

        // Claim: CAS QUEUED -> RUNNING. Losing the race means another worker
        // or an earlier delivery of this message owns the job.
        match self
            .jobs
            .transition(job_id, JobStatus::Queued, JobStatus::Running, None)
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => {
                info!(job_id = %job_id, "Job already claimed or terminal, discarding delivery");
                counter!("causeway_jobs_discarded_total").increment(1);
                delivery.ack().await?;
                return Ok(JobOutcome::Discarded);
            }
            Err(e) if e.code() == ErrorCode::RecordNotFound => {
                // No row to run against; redelivery cannot help.
                warn!(job_id = %job_id, "Job message without a job row, dropping");
                delivery.ack().await?;
                return Ok(JobOutcome::Malformed);
            }
            Err(e) => {
                delivery.nack().await?;
                return Err(e);
            }
        }

        info!(job_id = %job_id, model = %message.model_name, "Job running");
        let started = tokio::time::Instant::now();

        match self.execute(&message).await {
            Ok(output) => match self.persist_success(job_id, output).await {
                Ok(()) => {
                    counter!("causeway_jobs_succeeded_total", "model" => message.model_name.clone())
                        .increment(1);
                    info!(job_id = %job_id, elapsed = ?started.elapsed(), "Job succeeded");
                    delivery.ack().await?;
                    Ok(JobOutcome::Succeeded)
                }
                Err(e) => self.settle_infra_failure(job_id, delivery, e).await,
            },
            Err(e) if e.is_retryable() => {
                // Infrastructure trouble during data loading; not a verdict
                // on the job itself.
                self.settle_infra_failure(job_id, delivery, e).await
            }
            Err(e) => {
                let reason = e.user_message().to_string();
                match self.mark_failed(job_id, reason).await {
                    Ok(()) => {
                        counter!("causeway_jobs_failed_total", "model" => message.model_name.clone())
                            .increment(1);
                        warn!(job_id = %job_id, error = %e, "Job failed");
                        delivery.ack().await?;
                        Ok(JobOutcome::Failed)
                    }
                    Err(store_err) => self.settle_infra_failure(job_id, delivery, store_err).await,
                }
            }
        }
    }

    /// Run both plugin stages under the execution timeout. Plugin code is not
    /// trusted to self-terminate; when the bound is hit the job is failed and
    /// the worker slot freed.
    async fn execute(&self, message: &JobMessage) -> Result<AnalysisOutput> {
        let model = self.registry.resolve(&message.model_name)?;
        let ctx = ModelContext {
            events: self.events.clone(),
        };

        let run = async {
            let dataset = model.load_data(&ctx, &message.params).await?;
            model.run_analysis(dataset).await
        };

        match tokio::time::timeout(self.config.execution_timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(CausewayError::plugin_timeout(
                self.config.execution_timeout.as_secs(),
            )),
        }
    }

    /// Result row plus SUCCEEDED status in one logical step.
    async fn persist_success(&self, job_id: JobId, output: AnalysisOutput) -> Result<()> {
        self.results
            .upsert(&ResultRecord {
                job_id,
                effect_estimates: output.effect_estimates,
                confidence_intervals: output.confidence_intervals,
                diagnostics: output.diagnostics,
                written_at: Utc::now(),
            })
            .await?;

        self.jobs
            .transition(job_id, JobStatus::Running, JobStatus::Succeeded, None)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, job_id: JobId, reason: String) -> Result<()> {
        self.jobs
            .transition(job_id, JobStatus::Running, JobStatus::Failed, Some(reason))
            .await?;
        Ok(())
    }

    /// Infrastructure failed after the claim. Try to park the job as FAILED;
    /// if even that is impossible, leave the message unacknowledged so the
    /// broker retries once the stores are back.
    async fn settle_infra_failure(
        &self,
        job_id: JobId,
        delivery: Delivery,
        err: CausewayError,
    ) -> Result<JobOutcome> {
        warn!(job_id = %job_id, error = %err, "Infrastructure failure while processing job");
        let reason = format!("infrastructure failure: {}", err.user_message());
        match self.mark_failed(job_id, reason).await {
            Ok(()) => {
                delivery.ack().await?;
                Ok(JobOutcome::Failed)
            }
            Err(_) => {
                delivery.nack().await?;
                Err(err)
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
