//! Integration tests for the worker API.

use std::sync::{Arc, OnceLock};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::CorrelationId;
use event_log::{EventEnvelope, EventLog};
use metrics_exporter_prometheus::PrometheusHandle;
use store::NewDeadLetter;
use tower::ServiceExt;
use worker::config::Config;
use worker::routes::dead_letters::AppState;
use worker::{Backends, FulfillmentWorker};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn setup() -> (axum::Router, Backends) {
    let config = Config::default();
    let backends = Backends::in_memory(&config);
    let worker = FulfillmentWorker::new(&config, &backends).unwrap();
    let state = Arc::new(AppState {
        replayer: worker.replayer.clone(),
    });
    (worker::create_app(state, get_metrics_handle()), backends)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn dead_letter(backends: &Backends) -> (String, EventEnvelope) {
    let envelope = EventEnvelope::builder()
        .correlation_id(CorrelationId::new())
        .event_type("PurchaseCreated")
        .source("test")
        .payload_raw(serde_json::json!({"tier": 10}))
        .build()
        .unwrap();
    let recorded = backends
        .store
        .record_dead_letter(NewDeadLetter {
            stage: "allocation-coordinator".to_string(),
            original_event: envelope.clone(),
            error: "tutor matcher timed out after 5s".to_string(),
            attempt_count: 5,
        })
        .await
        .unwrap();
    (recorded.id.to_string(), envelope)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let (app, _) = setup();

    let response = app.oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, _) = setup();

    let response = app.oneshot(get("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().starts_with("text/plain"));
}

#[tokio::test]
async fn test_list_dead_letters() {
    let (app, backends) = setup();
    let (id, envelope) = dead_letter(&backends).await;

    let response = app.oneshot(get("/dead-letters")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let items = json.as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["id"], id);
    assert_eq!(items[0]["stage"], "allocation-coordinator");
    assert_eq!(items[0]["attemptCount"], 5);
    assert_eq!(items[0]["eventType"], "PurchaseCreated");
    assert_eq!(
        items[0]["originalEvent"]["eventId"],
        envelope.event_id.to_string()
    );
    assert!(items[0]["replayedAt"].is_null());
}

#[tokio::test]
async fn test_replay_dead_letter() {
    let (app, backends) = setup();
    let (id, envelope) = dead_letter(&backends).await;

    let response = app
        .clone()
        .oneshot(post(&format!("/dead-letters/{id}/replay")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(!json["replayedAt"].is_null());

    // The original event is back on the log.
    let records = backends
        .log
        .poll("observer", "test", 10, std::time::Duration::from_millis(50))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].envelope, envelope);

    // Replayed letters are hidden unless asked for.
    let pending = body_json(app.clone().oneshot(get("/dead-letters")).await.unwrap()).await;
    assert!(pending.as_array().unwrap().is_empty());

    let all = body_json(
        app.oneshot(get("/dead-letters?include_replayed=true"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(all.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_get_dead_letter() {
    let (app, backends) = setup();
    let (id, _) = dead_letter(&backends).await;

    let response = app
        .oneshot(get(&format!("/dead-letters/{id}")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["error"], "tutor matcher timed out after 5s");
}

#[tokio::test]
async fn test_replay_unknown_dead_letter_is_404() {
    let (app, _) = setup();

    let response = app
        .oneshot(post(
            "/dead-letters/7f1c1a5e-2f4b-4a8e-9a0d-2a9c1f7b6e10/replay",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_dead_letter_id_is_400() {
    let (app, _) = setup();

    let response = app
        .oneshot(post("/dead-letters/not-a-uuid/replay"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert!(json["error"].as_str().unwrap().contains("Invalid dead letter id"));
}
