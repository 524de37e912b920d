//! Causeway Server - Main entry point
//!
//! Wires the broker, stores, registry, gateway, writer, control plane, and
//! worker together and serves the HTTP API.

use std::net::SocketAddr;
use std::sync::Arc;

use causeway_core::{
    api::{self, AppState},
    auth::JwtVerifier,
    broker::{Broker, InMemoryBroker, RedisBroker},
    config::{BackendMode, Config},
    control::ControlPlane,
    ingest::{EventWriter, IngestionGateway},
    registry::ModelRegistry,
    storage::{DedupStore, EventStore, JobStore, MemoryStorage, PgStorage, ResultStore},
    telemetry,
    uploads::UploadManager,
    worker::AnalysisWorker,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: Could not load config: {}. Using defaults.", e);
        Config::default()
    });

    telemetry::init_logging(
        &config.observability.log_level,
        config.observability.log_format,
    )?;
    let metrics_handle = telemetry::install_metrics()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Causeway Server"
    );

    // Broker
    let broker: Arc<dyn Broker> = match config.broker.mode {
        BackendMode::Memory => {
            tracing::info!("Using in-memory broker");
            Arc::new(InMemoryBroker::new())
        }
        BackendMode::External => {
            tracing::info!(url = %config.broker.redis_url, "Using Redis broker");
            Arc::new(RedisBroker::connect(&config.broker.redis_url, "causeway")?)
        }
    };

    // Stores
    let (events, dedup, jobs, results): (
        Arc<dyn EventStore>,
        Arc<dyn DedupStore>,
        Arc<dyn JobStore>,
        Arc<dyn ResultStore>,
    ) = match config.storage.mode {
        BackendMode::Memory => {
            tracing::info!("Using in-memory storage");
            let storage = Arc::new(MemoryStorage::new());
            (
                storage.clone(),
                storage.clone(),
                storage.clone(),
                storage,
            )
        }
        BackendMode::External => {
            let storage = Arc::new(
                PgStorage::connect(
                    &config.storage.database_url,
                    config.storage.max_connections,
                    config.storage.call_timeout,
                )
                .await?,
            );
            tracing::info!("Connected to Postgres and applied schema");
            (
                storage.clone(),
                storage.clone(),
                storage.clone(),
                storage,
            )
        }
    };

    // Model registry, built once and passed by handle
    let registry = ModelRegistry::with_builtin_models();
    tracing::info!(models = registry.list().len(), "Model registry ready");

    // Event writer
    let writer = EventWriter::new(
        broker.clone(),
        events.clone(),
        dedup.clone(),
        config.broker.raw_events_topic.clone(),
        config.broker.poll_timeout,
        config.ingest.dedup_retention,
    );
    let writer_handle = writer.start().await?;

    // Analysis worker
    let worker = AnalysisWorker::new(
        registry.clone(),
        broker.clone(),
        jobs.clone(),
        results.clone(),
        events.clone(),
        config.broker.analysis_jobs_topic.clone(),
        config.broker.poll_timeout,
        config.worker.clone(),
    );
    let worker_handle = worker.start().await?;

    // Control plane plus its reconciliation sweep
    let control = Arc::new(ControlPlane::new(
        registry,
        jobs,
        results,
        broker.clone(),
        config.broker.analysis_jobs_topic.clone(),
        config.control.clone(),
    ));
    let reconciler_handle = control.clone().start_reconciliation();

    // Ingestion gateway and uploads
    let gateway = Arc::new(IngestionGateway::new(
        broker.clone(),
        config.broker.raw_events_topic.clone(),
        config.ingest.key_bucket,
    ));
    let uploads = Arc::new(UploadManager::new(
        config.uploads.signing_key.clone(),
        config.uploads.url_ttl,
        config.uploads.base_url.clone(),
        broker,
        config.broker.storage_events_topic.clone(),
    ));

    // Build router
    let app_state = AppState {
        gateway,
        control,
        uploads,
        verifier: Arc::new(JwtVerifier::new(&config.auth.jwt_secret)),
        metrics: Some(metrics_handle),
    };
    let app = api::build_router(app_state);

    // Start server
    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup
    reconciler_handle.shutdown();
    worker_handle.shutdown();
    writer_handle.shutdown();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
