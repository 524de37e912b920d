//! Analysis job definitions.
//!
//! A [`Job`] is the durable record of one requested analysis run. Its status
//! walks a monotonic state machine: once a job reaches a terminal state it
//! never leaves it, and every mutation goes through a compare-and-swap on the
//! current status so concurrent workers cannot double-claim or regress a job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::auth::Principal;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted and waiting for a worker
    Queued,
    /// Claimed by a worker and executing
    Running,
    /// Finished with a persisted result
    Succeeded,
    /// Finished with a captured error, no result
    Failed,
    /// Withdrawn before any worker claimed it
    Cancelled,
}

impl JobStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// The full machine: `Queued -> Running -> Succeeded | Failed`, plus
    /// `Queued -> Cancelled` and `Queued -> Failed` (reconciliation gives up
    /// on a job it could never publish).
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            Self::Queued => matches!(next, Self::Running | Self::Cancelled | Self::Failed),
            Self::Running => matches!(next, Self::Succeeded | Self::Failed),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Record
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable record of one analysis job. Never deleted; kept for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub job_id: JobId,
    /// Submitting caller
    pub principal: String,
    /// Registered model to run
    pub model_name: String,
    /// Model parameters, JSON object
    pub params: serde_json::Value,
    /// Priority, 1 (highest) to 10
    pub priority: i32,
    /// Current lifecycle state
    pub status: JobStatus,
    /// When the job was created
    pub created_at: DateTime<Utc>,
    /// When the job last changed state
    pub updated_at: DateTime<Utc>,
    /// Captured error for failed jobs
    pub error: Option<String>,
    /// Times the job message has been published (reconciliation bookkeeping)
    pub publish_attempts: u32,
}

impl Job {
    /// Create a fresh QUEUED job.
    pub fn new(
        principal: &Principal,
        model_name: impl Into<String>,
        params: serde_json::Value,
        priority: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: JobId::new(),
            principal: principal.id.clone(),
            model_name: model_name.into(),
            params,
            priority,
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            error: None,
            publish_attempts: 0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Message
// ═══════════════════════════════════════════════════════════════════════════════

/// Wire message dispatching a job to the analysis workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: JobId,
    pub principal: String,
    pub model_name: String,
    pub params: serde_json::Value,
    pub priority: i32,
}

impl From<&Job> for JobMessage {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id,
            principal: job.principal.clone(),
            model_name: job.model_name.clone(),
            params: job.params.clone(),
            priority: job.priority,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
