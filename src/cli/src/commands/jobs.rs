//! Analysis job commands.
//!
//! Provides submit, list, status, and cancel operations for analysis jobs.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tabled::Tabled;
use uuid::Uuid;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum JobCommands {
    /// Submit a new analysis job
    Submit {
        /// Model name (see `causeway models list`)
        #[arg(short, long)]
        model: String,

        /// Model parameters as inline JSON, or @path to a JSON file
        #[arg(short, long, default_value = "{}")]
        params: String,

        /// Job priority, 1 (highest) to 10
        #[arg(long, default_value = "5")]
        priority: i32,

        /// Poll until the job reaches a terminal state
        #[arg(short, long)]
        wait: bool,
    },

    /// List jobs
    List {
        /// Filter by status (queued, running, succeeded, failed, cancelled)
        #[arg(short, long)]
        status: Option<String>,

        /// Maximum number of results
        #[arg(short, long, default_value = "50")]
        limit: u32,
    },

    /// Get job status (includes the result once the job succeeded)
    Status {
        /// Job ID
        job_id: Uuid,
    },

    /// Cancel a queued job
    Cancel {
        /// Job ID
        job_id: Uuid,
    },
}

// ── API types ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct RunAnalysisRequest {
    model_name: String,
    params: Value,
    priority: i32,
}

#[derive(Deserialize)]
struct RunAnalysisResponse {
    job_id: Uuid,
}

#[derive(Debug, Deserialize, Serialize)]
struct JobInfo {
    job_id: Uuid,
    model_name: String,
    status: String,
    priority: i32,
    created_at: String,
    updated_at: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    result: Option<Value>,
}

#[derive(Deserialize)]
struct JobListResponse {
    jobs: Vec<JobInfo>,
}

#[derive(Debug, Serialize, Tabled)]
struct JobRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Model")]
    model: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Priority")]
    priority: i32,
    #[tabled(rename = "Created")]
    created_at: String,
}

impl From<&JobInfo> for JobRow {
    fn from(job: &JobInfo) -> Self {
        Self {
            id: job.job_id.to_string(),
            model: job.model_name.clone(),
            status: output::status_colored(&job.status),
            priority: job.priority,
            created_at: job.created_at.clone(),
        }
    }
}

// ── Execution ───────────────────────────────────────────────────────────────

fn parse_params(raw: &str) -> Result<Value> {
    let content = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read params file {path}"))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&content).context("params must be valid JSON")
}

pub async fn execute(cmd: JobCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        JobCommands::Submit {
            model,
            params,
            priority,
            wait,
        } => {
            let request = RunAnalysisRequest {
                model_name: model,
                params: parse_params(&params)?,
                priority,
            };
            let response: RunAnalysisResponse =
                client.post("/v1/analysis/run", &request).await?;
            output::print_success(&format!("Job submitted: {}", response.job_id));

            if wait {
                poll_until_terminal(client, response.job_id, format).await?;
            }
        }

        JobCommands::List { status, limit } => {
            let mut path = format!("/v1/analysis/jobs?limit={limit}");
            if let Some(status) = status {
                path.push_str(&format!("&status={status}"));
            }
            let response: JobListResponse = client.get(&path).await?;

            match format {
                OutputFormat::Table => {
                    let rows: Vec<JobRow> = response.jobs.iter().map(JobRow::from).collect();
                    output::print_list(&rows, format);
                }
                OutputFormat::Json => output::print_item(&response.jobs, format),
            }
        }

        JobCommands::Status { job_id } => {
            let job: JobInfo = client
                .get(&format!("/v1/analysis/{job_id}/status"))
                .await?;
            output::print_item(&job, format);
        }

        JobCommands::Cancel { job_id } => {
            let _: Value = client
                .post_empty(&format!("/v1/analysis/{job_id}/cancel"))
                .await?;
            output::print_success(&format!("Job cancelled: {job_id}"));
        }
    }

    Ok(())
}

async fn poll_until_terminal(
    client: &ApiClient,
    job_id: Uuid,
    format: OutputFormat,
) -> Result<()> {
    let mut last_status = String::new();
    loop {
        let job: JobInfo = client
            .get(&format!("/v1/analysis/{job_id}/status"))
            .await?;

        if job.status != last_status {
            output::print_info(&format!("Status: {}", output::status_colored(&job.status)));
            last_status = job.status.clone();
        }

        match job.status.as_str() {
            "succeeded" | "failed" | "cancelled" => {
                output::print_item(&job, format);
                return Ok(());
            }
            _ => tokio::time::sleep(std::time::Duration::from_secs(2)).await,
        }
    }
}
