//! End-to-end tests against the HTTP gateway surface, exercising the
//! literal scenarios from the submission state machine: auth rejection,
//! backpressure, and the submit -> status -> content round trip.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use tacedge::audit::AuditLog;
use tacedge::auth::TokenService;
use tacedge::config::TacEdgeConfig;
use tacedge::crypto::CryptoSealer;
use tacedge::gateway::{router, AppState, Backpressure};
use tacedge::gateway::rate_limit::RateLimiter;
use tacedge::model::Role;
use tacedge::monitor::{AlertConfig, ProductionMonitor};
use tacedge::queue::PrecedenceQueue;
use tacedge::registry::NodeRegistry;

async fn test_app() -> (axum::Router, tempfile::TempDir, Arc<TokenService>) {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path()).unwrap();
    let audit = AuditLog::open(&db).unwrap();
    let queue = PrecedenceQueue::open(db).unwrap();
    let crypto = Arc::new(CryptoSealer::new(b"integration-test-key", 1, audit.clone()).unwrap());
    let registry = Arc::new(NodeRegistry::new(chrono::Duration::seconds(60)));
    let monitor = Arc::new(ProductionMonitor::new(AlertConfig::default()));
    let tokens = Arc::new(TokenService::new(b"integration-test-signing-key".to_vec()));
    let config = Arc::new(TacEdgeConfig::default());

    let state = AppState {
        queue,
        audit,
        crypto,
        registry,
        monitor,
        tokens: tokens.clone(),
        config,
        rate_limiter: Arc::new(RateLimiter::new()),
        backpressure: Arc::new(Backpressure::new()),
        flash_notify: Arc::new(tokio::sync::Notify::new()),
    };

    (router(state), dir, tokens)
}

fn submit_body(precedence: &str, content: &str) -> Value {
    json!({
        "recipient": "node-b",
        "precedence": precedence,
        "classification": "CONFIDENTIAL",
        "content": STANDARD.encode(content),
        "ttl_seconds": 3600,
    })
}

#[tokio::test]
async fn health_and_ready_are_unauthenticated() {
    let (app, _dir, _tokens) = test_app().await;

    let resp = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn submit_then_get_status_and_content_round_trips() {
    let (app, _dir, tokens) = test_app().await;
    let token = tokens.issue("node-a", Role::Operator, None).unwrap();

    let submit_resp = app
        .clone()
        .oneshot(
            Request::post("/api/v1/messages")
                .header("authorization", format!("Bearer {token}"))
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::to_vec(&submit_body("ROUTINE", "hello tacedge")).unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(submit_resp.status(), StatusCode::CREATED);

    let body = axum::body::to_bytes(submit_resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let submitted: Value = serde_json::from_slice(&body).unwrap();
    let id = submitted["id"].as_str().unwrap();
    assert_eq!(submitted["status"], "QUEUED");

    let status_resp = app
        .clone()
        .oneshot(
            Request::get(format!("/api/v1/messages/{id}"))
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(status_resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(status_resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let status: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(status["message"]["status"], "QUEUED");
    assert!(!status["audit_trail"].as_array().unwrap().is_empty());

    let content_resp = app
        .oneshot(
            Request::get(format!("/api/v1/messages/{id}/content"))
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(content_resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(content_resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let content: Value = serde_json::from_slice(&body).unwrap();
    let plaintext = STANDARD.decode(content["content"].as_str().unwrap()).unwrap();
    assert_eq!(plaintext, b"hello tacedge");
}

#[tokio::test]
async fn expired_token_is_rejected_with_invalid_token() {
    let (app, _dir, _tokens) = test_app().await;
    // Token signing/verification of expiry and signature failure is
    // covered at the unit level in auth::tests; here we exercise the
    // gateway-level 401 path via a signature mismatch (wrong key).
    let other = TokenService::new(b"a-different-key".to_vec());
    let token = other.issue("node-a", Role::Operator, None).unwrap();

    let resp = app
        .oneshot(
            Request::post("/api/v1/messages")
                .header("authorization", format!("Bearer {token}"))
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::to_vec(&submit_body("ROUTINE", "hi")).unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["error"]["code"], "INVALID_TOKEN");
}

#[tokio::test]
async fn backpressure_returns_queue_full_once_watermark_exceeded() {
    let (app, _dir, tokens) = test_app().await;

    // default FLASH watermark is 100; push past it. Rate limiting is keyed
    // by token jti, so a fresh token per request keeps this test isolated
    // from the per-token FLASH rate cap (100/min) exercised elsewhere.
    for _ in 0..101 {
        let token = tokens.issue("node-a", Role::Operator, None).unwrap();
        let resp = app
            .clone()
            .oneshot(
                Request::post("/api/v1/messages")
                    .header("authorization", format!("Bearer {token}"))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::to_vec(&submit_body("FLASH", "x")).unwrap(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
    }

    let token = tokens.issue("node-a", Role::Operator, None).unwrap();
    let resp = app
        .oneshot(
            Request::post("/api/v1/messages")
                .header("authorization", format!("Bearer {token}"))
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::to_vec(&submit_body("FLASH", "one-too-many")).unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["error"]["code"], "QUEUE_FULL");
}

#[tokio::test]
async fn audit_query_requires_supervisor_or_admin() {
    let (app, _dir, tokens) = test_app().await;
    let operator_token = tokens.issue("node-a", Role::Operator, None).unwrap();
    let supervisor_token = tokens.issue("node-b", Role::Supervisor, None).unwrap();

    let resp = app
        .clone()
        .oneshot(
            Request::get("/api/v1/audit/events")
                .header("authorization", format!("Bearer {operator_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = app
        .oneshot(
            Request::get("/api/v1/audit/events")
                .header("authorization", format!("Bearer {supervisor_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}
