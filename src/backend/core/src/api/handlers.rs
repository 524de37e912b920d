//! API request handlers with proper error propagation.
//!
//! All handlers return `Result<impl IntoResponse, CausewayError>` so that
//! errors are automatically converted to the right HTTP status codes via the
//! `IntoResponse` implementation on `CausewayError`. Job submission either
//! succeeds with a `job_id` or fails synchronously with a 4xx reason; job
//! outcomes are only ever visible via status polling.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::AppState;
use crate::auth::{authenticate, Principal};
use crate::error::{CausewayError, Result};
use crate::ingest::EventSubmission;
use crate::jobs::{JobId, JobStatus};

fn caller(state: &AppState, headers: &HeaderMap) -> Result<Principal> {
    Ok(authenticate(state.verifier.as_ref(), headers)?)
}

// ═══════════════════════════════════════════════════════════════════════════════
// System
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Ingestion
// ═══════════════════════════════════════════════════════════════════════════════

/// `POST /v1/events` accepts a single `{idempotency_key?, payload}` object or
/// an array of them.
pub async fn submit_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse> {
    let principal = caller(&state, &headers)?;

    if body.is_array() {
        let submissions: Vec<EventSubmission> = serde_json::from_value(body)
            .map_err(|e| CausewayError::validation(format!("invalid event batch: {e}")))?;
        let accepted = state.gateway.submit_batch(&principal, submissions).await?;
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "accepted": accepted.len(),
                "event_ids": accepted.iter().map(|a| a.event_id.clone()).collect::<Vec<_>>(),
            })),
        ));
    }

    let submission: EventSubmission = serde_json::from_value(body)
        .map_err(|e| CausewayError::validation(format!("invalid event: {e}")))?;
    let accepted = state
        .gateway
        .submit_event(&principal, submission.idempotency_key, submission.payload)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "accepted": accepted.accepted,
            "event_id": accepted.event_id,
        })),
    ))
}

pub async fn create_upload_url(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let principal = caller(&state, &headers)?;
    let ticket = state.uploads.create_upload_url(&principal);
    Ok(Json(json!({
        "url": ticket.url,
        "object": ticket.object,
    })))
}

#[derive(Deserialize)]
pub struct UploadQuery {
    expires: i64,
    sig: String,
}

/// `PUT /v1/uploads/*object` - the signed URL target. The signature carries
/// the authorization; no bearer token is required here.
pub async fn put_upload(
    State(state): State<AppState>,
    Path(object): Path<String>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    state
        .uploads
        .receive_object(&object, query.expires, &query.sig, body.to_vec())
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({"object": object, "stored": true})),
    ))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Analysis
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
pub struct RunAnalysisRequest {
    pub model_name: String,
    #[serde(default = "empty_object")]
    pub params: serde_json::Value,
    #[serde(default = "default_priority")]
    pub priority: i32,
}

fn empty_object() -> serde_json::Value {
    json!({})
}

fn default_priority() -> i32 {
    5
}

pub async fn run_analysis(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RunAnalysisRequest>,
) -> Result<impl IntoResponse> {
    let principal = caller(&state, &headers)?;

    let job_id = state
        .control
        .submit_job(
            &principal,
            &request.model_name,
            request.params,
            request.priority,
        )
        .await?;

    Ok((StatusCode::ACCEPTED, Json(json!({"job_id": job_id}))))
}

pub async fn job_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    caller(&state, &headers)?;
    let details = state.control.get_job(JobId(job_id)).await?;
    Ok(Json(details))
}

#[derive(Deserialize)]
pub struct ListJobsQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse> {
    caller(&state, &headers)?;

    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<JobStatus>()
                .map_err(CausewayError::validation)?,
        ),
    };

    let jobs = state.control.list_jobs(status, query.limit).await?;
    let count = jobs.len();
    Ok(Json(json!({
        "jobs": jobs,
        "count": count,
    })))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    caller(&state, &headers)?;
    let job = state.control.cancel_job(JobId(job_id)).await?;
    Ok(Json(json!({
        "job_id": job.job_id,
        "status": job.status,
    })))
}

pub async fn list_models(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    caller(&state, &headers)?;
    let models = state.control.list_models();
    let count = models.len();
    Ok(Json(json!({
        "models": models,
        "count": count,
    })))
}
