//! End-to-end pipeline tests against the HTTP surface.
//!
//! Each test wires the full stack over in-memory backends: gateway, broker,
//! event writer, control plane, worker, and the axum router.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use causeway_core::api::{build_router, AppState};
use causeway_core::auth::{Principal, StaticTokenVerifier};
use causeway_core::broker::InMemoryBroker;
use causeway_core::config::{ControlConfig, WorkerConfig};
use causeway_core::control::ControlPlane;
use causeway_core::ingest::{EventWriter, IngestionGateway};
use causeway_core::registry::ModelRegistry;
use causeway_core::storage::{EventStore, MemoryStorage};
use causeway_core::uploads::UploadManager;
use causeway_core::worker::AnalysisWorker;

const TOKEN: &str = "tok-client-1";

struct Stack {
    router: Router,
    broker: InMemoryBroker,
    storage: Arc<MemoryStorage>,
}

async fn stack(start_worker: bool) -> Stack {
    let broker = InMemoryBroker::new();
    let storage = Arc::new(MemoryStorage::new());
    let registry = ModelRegistry::with_builtin_models();

    let writer = EventWriter::new(
        Arc::new(broker.clone()),
        storage.clone(),
        storage.clone(),
        "raw-events",
        Duration::from_millis(10),
        Duration::from_secs(3600),
    );
    writer.start().await.unwrap();

    if start_worker {
        let worker = AnalysisWorker::new(
            registry.clone(),
            Arc::new(broker.clone()),
            storage.clone(),
            storage.clone(),
            storage.clone(),
            "run-analysis-jobs",
            Duration::from_millis(10),
            WorkerConfig {
                concurrency: 2,
                execution_timeout: Duration::from_secs(5),
                name: "pipeline-test-worker".to_string(),
            },
        );
        worker.start().await.unwrap();
    }

    let control = Arc::new(ControlPlane::new(
        registry,
        storage.clone(),
        storage.clone(),
        Arc::new(broker.clone()),
        "run-analysis-jobs",
        ControlConfig {
            reconcile_interval: Duration::from_secs(60),
            reconcile_after: Duration::from_secs(60),
            max_publish_attempts: 5,
        },
    ));

    let gateway = Arc::new(IngestionGateway::new(
        Arc::new(broker.clone()),
        "raw-events",
        Duration::from_secs(300),
    ));
    let uploads = Arc::new(UploadManager::new(
        "pipeline-test-signing-key",
        Duration::from_secs(900),
        "http://localhost:8082",
        Arc::new(broker.clone()),
        "storage-events",
    ));
    let verifier = Arc::new(
        StaticTokenVerifier::new().with_token(TOKEN, Principal::new("client-1")),
    );

    let router = build_router(AppState {
        gateway,
        control,
        uploads,
        verifier,
        metrics: None,
    });

    Stack {
        router,
        broker,
        storage,
    }
}

async fn call(
    router: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn wait_until<F>(mut check: F)
where
    F: FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = bool>>>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

fn campaign_event(key: &str, channel: &str, occurred_at: &str, converted: bool) -> Value {
    json!({
        "idempotency_key": key,
        "payload": {
            "campaign_id": "c1",
            "marketing_channel": channel,
            "event_type": if converted { "conversion" } else { "page_view" },
            "occurred_at": occurred_at,
        }
    })
}

#[tokio::test]
async fn test_parallel_identical_events_store_one_row() {
    let stack = stack(false).await;

    // Identical payload, key "evt-42", three times in parallel.
    let body = json!({
        "idempotency_key": "evt-42",
        "payload": {"event_type": "purchase", "revenue_usd": 10.0}
    });
    let mut handles = Vec::new();
    for _ in 0..3 {
        let router = stack.router.clone();
        let body = body.clone();
        handles.push(tokio::spawn(async move {
            call(&router, "POST", "/v1/events", Some(TOKEN), Some(body)).await
        }));
    }
    for handle in handles {
        let (status, response) = handle.await.unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(response["event_id"], "evt-42");
    }

    // Exactly one row lands, no matter how the three deliveries interleave.
    let storage = stack.storage.clone();
    let broker = stack.broker.clone();
    wait_until(move || {
        let storage = storage.clone();
        let broker = broker.clone();
        Box::pin(async move {
            EventStore::count(storage.as_ref()).await.unwrap() == 1
                && broker.pending("raw-events") == 0
        })
    })
    .await;

    let event = stack.storage.get("evt-42").await.unwrap().unwrap();
    assert_eq!(event.payload["event_type"], "purchase");
}

#[tokio::test]
async fn test_did_job_end_to_end() {
    let stack = stack(true).await;

    // Seed the 2x2 grid for campaign c1 around the split date.
    let mut batch = Vec::new();
    for i in 0..4 {
        let converted = i % 2 == 0;
        batch.push(campaign_event(
            &format!("pre-t-{i}"),
            "paid_search",
            "2024-01-10T00:00:00Z",
            converted,
        ));
        batch.push(campaign_event(
            &format!("post-t-{i}"),
            "paid_search",
            "2024-01-20T00:00:00Z",
            true,
        ));
        batch.push(campaign_event(
            &format!("pre-c-{i}"),
            "email",
            "2024-01-10T00:00:00Z",
            converted,
        ));
        batch.push(campaign_event(
            &format!("post-c-{i}"),
            "email",
            "2024-01-20T00:00:00Z",
            converted,
        ));
    }
    let (status, response) = call(
        &stack.router,
        "POST",
        "/v1/events",
        Some(TOKEN),
        Some(Value::Array(batch)),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(response["accepted"], 16);

    let storage = stack.storage.clone();
    wait_until(move || {
        let storage = storage.clone();
        Box::pin(async move { EventStore::count(storage.as_ref()).await.unwrap() == 16 })
    })
    .await;

    // Submit the analysis job.
    let (status, response) = call(
        &stack.router,
        "POST",
        "/v1/analysis/run",
        Some(TOKEN),
        Some(json!({
            "model_name": "did",
            "params": {"campaign_id": "c1", "split_date": "2024-01-15"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = response["job_id"].as_str().unwrap().to_string();

    // Poll the status endpoint; transitions must be monotone.
    let order = ["queued", "running", "succeeded"];
    let mut last_rank = 0;
    let uri = format!("/v1/analysis/{job_id}/status");
    for _ in 0..200 {
        let (status, response) = call(&stack.router, "GET", &uri, Some(TOKEN), None).await;
        assert_eq!(status, StatusCode::OK);

        let current = response["status"].as_str().unwrap().to_string();
        let rank = order
            .iter()
            .position(|s| *s == current)
            .unwrap_or_else(|| panic!("unexpected status {current}: {response}"));
        assert!(rank >= last_rank, "status regressed to {current}");
        last_rank = rank;

        if current == "succeeded" {
            let estimate = &response["result"]["effect_estimates"]["did"];
            assert!(estimate.is_number(), "missing effect estimate: {response}");
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job did not succeed within 2s");
}

#[tokio::test]
async fn test_unknown_model_is_rejected_without_a_job_row() {
    let stack = stack(false).await;

    let (status, response) = call(
        &stack.router,
        "POST",
        "/v1/analysis/run",
        Some(TOKEN),
        Some(json!({"model_name": "definitely-not-registered", "params": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["error"]["code"], "UNKNOWN_MODEL");

    let (status, response) =
        call(&stack.router, "GET", "/v1/analysis/jobs", Some(TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["count"], 0);
}

#[tokio::test]
async fn test_missing_or_bad_token_is_unauthorized() {
    let stack = stack(false).await;

    let (status, _) = call(
        &stack.router,
        "POST",
        "/v1/analysis/run",
        None,
        Some(json!({"model_name": "did", "params": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(
        &stack.router,
        "POST",
        "/v1/events",
        Some("wrong-token"),
        Some(json!({"payload": {"a": 1}})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_plugin_failure_surfaces_through_status_polling() {
    let stack = stack(true).await;

    // No events exist for this campaign, so the did model fails.
    let (status, response) = call(
        &stack.router,
        "POST",
        "/v1/analysis/run",
        Some(TOKEN),
        Some(json!({
            "model_name": "did",
            "params": {"campaign_id": "ghost-campaign"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = response["job_id"].as_str().unwrap().to_string();

    let uri = format!("/v1/analysis/{job_id}/status");
    for _ in 0..200 {
        let (_, response) = call(&stack.router, "GET", &uri, Some(TOKEN), None).await;
        if response["status"] == "failed" {
            let error = response["error"].as_str().unwrap();
            assert!(!error.is_empty());
            assert!(response.get("result").is_none());
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job did not fail within 2s");
}

#[tokio::test]
async fn test_job_status_not_found() {
    let stack = stack(false).await;
    let uri = format!("/v1/analysis/{}/status", uuid::Uuid::new_v4());
    let (status, _) = call(&stack.router, "GET", &uri, Some(TOKEN), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_queued_job() {
    // No worker: the job stays QUEUED and is cancellable.
    let stack = stack(false).await;

    let (_, response) = call(
        &stack.router,
        "POST",
        "/v1/analysis/run",
        Some(TOKEN),
        Some(json!({"model_name": "did", "params": {"campaign_id": "c1"}})),
    )
    .await;
    let job_id = response["job_id"].as_str().unwrap().to_string();

    let (status, response) = call(
        &stack.router,
        "POST",
        &format!("/v1/analysis/{job_id}/cancel"),
        Some(TOKEN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["status"], "cancelled");

    // Terminal: cancelling again conflicts.
    let (status, _) = call(
        &stack.router,
        "POST",
        &format!("/v1/analysis/{job_id}/cancel"),
        Some(TOKEN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_model_catalog() {
    let stack = stack(false).await;

    let (status, response) = call(&stack.router, "GET", "/v1/models", Some(TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);

    let names: Vec<&str> = response["models"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"did"));
    assert!(names.contains(&"channel_uplift"));
}

#[tokio::test]
async fn test_upload_flow_publishes_storage_notification() {
    let stack = stack(false).await;

    let (status, response) = call(
        &stack.router,
        "POST",
        "/v1/uploads/url",
        Some(TOKEN),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let url = response["url"].as_str().unwrap();
    let path = url.strip_prefix("http://localhost:8082").unwrap();

    // Direct PUT of file bytes against the signed URL, no bearer token.
    let request = Request::builder()
        .method("PUT")
        .uri(path)
        .body(Body::from("ts,event\n1,click\n"))
        .unwrap();
    let put_response = stack.router.clone().oneshot(request).await.unwrap();
    assert_eq!(put_response.status(), StatusCode::CREATED);

    // Object-creation events flow onto their own topic for downstream parsing.
    assert_eq!(stack.broker.pending("storage-events"), 1);
}
