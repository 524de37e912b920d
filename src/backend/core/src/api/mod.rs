//! HTTP API layer.
//!
//! # Endpoints
//!
//! ## Ingestion
//! - `POST /v1/events` - Submit one event or a batch
//! - `POST /v1/uploads/url` - Request a signed upload URL
//! - `PUT /v1/uploads/*object` - Direct object upload against a signed URL
//!
//! ## Analysis
//! - `POST /v1/analysis/run` - Submit an analysis job
//! - `GET /v1/analysis/jobs` - List jobs, most-recent-first
//! - `GET /v1/analysis/:job_id/status` - Job record (with result once succeeded)
//! - `POST /v1/analysis/:job_id/cancel` - Cancel a queued job
//! - `GET /v1/models` - Registered model catalog
//!
//! ## System (unversioned)
//! - `GET /health`
//! - `GET /metrics`

mod handlers;

use axum::{
    routing::{get, post, put},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::auth::TokenVerifier;
use crate::control::ControlPlane;
use crate::ingest::IngestionGateway;
use crate::uploads::UploadManager;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<IngestionGateway>,
    pub control: Arc<ControlPlane>,
    pub uploads: Arc<UploadManager>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub metrics: Option<PrometheusHandle>,
}

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Unversioned endpoints
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        // Ingestion
        .route("/v1/events", post(handlers::submit_events))
        .route("/v1/uploads/url", post(handlers::create_upload_url))
        .route("/v1/uploads/*object", put(handlers::put_upload))
        // Analysis
        .route("/v1/analysis/run", post(handlers::run_analysis))
        .route("/v1/analysis/jobs", get(handlers::list_jobs))
        .route("/v1/analysis/:job_id/status", get(handlers::job_status))
        .route("/v1/analysis/:job_id/cancel", post(handlers::cancel_job))
        .route("/v1/models", get(handlers::list_models))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}
