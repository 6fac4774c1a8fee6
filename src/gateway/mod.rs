//! Gateway Front (C5) — the authenticated HTTP/JSON request surface.
//!
//! Bundles the other four components behind `AppState` and wires them
//! into an `axum::Router` the way the ingestion gateway in the retrieval
//! pack does: `tower_http` tracing/timeout/CORS layers, a `DashMap`-backed
//! rate limiter, and honest non-200 responses on backpressure.

pub mod handlers;
pub mod rate_limit;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::audit::AuditLog;
use crate::auth::TokenService;
use crate::config::TacEdgeConfig;
use crate::crypto::CryptoSealer;
use crate::error::TacEdgeError;
use crate::model::Precedence;
use crate::monitor::ProductionMonitor;
use crate::queue::PrecedenceQueue;
use crate::registry::NodeRegistry;
use self::rate_limit::RateLimiter;

/// Sticky per-partition backpressure flag, per §5: once a partition trips
/// its watermark it stays `QUEUE_FULL` until depth falls below 90% of the
/// watermark, rather than flapping at the exact threshold.
pub struct Backpressure {
    tripped: [AtomicBool; 4],
}

impl Backpressure {
    pub fn new() -> Self {
        Self {
            tripped: [
                AtomicBool::new(false),
                AtomicBool::new(false),
                AtomicBool::new(false),
                AtomicBool::new(false),
            ],
        }
    }

    fn slot(p: Precedence) -> usize {
        match p {
            Precedence::Flash => 0,
            Precedence::Immediate => 1,
            Precedence::Priority => 2,
            Precedence::Routine => 3,
        }
    }

    /// Evaluates and returns whether `precedence` is currently full.
    pub fn check(&self, precedence: Precedence, depth: usize, watermark: usize) -> bool {
        if watermark == 0 {
            return false;
        }
        let slot = Self::slot(precedence);
        let flag = &self.tripped[slot];
        if flag.load(Ordering::Acquire) {
            let recovery = (watermark as f64 * 0.9) as usize;
            if depth < recovery {
                flag.store(false, Ordering::Release);
                false
            } else {
                true
            }
        } else if depth > watermark {
            flag.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }
}

impl Default for Backpressure {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<PrecedenceQueue>,
    pub audit: Arc<AuditLog>,
    pub crypto: Arc<CryptoSealer>,
    pub registry: Arc<NodeRegistry>,
    pub monitor: Arc<ProductionMonitor>,
    pub tokens: Arc<TokenService>,
    pub config: Arc<TacEdgeConfig>,
    pub rate_limiter: Arc<RateLimiter>,
    pub backpressure: Arc<Backpressure>,
    pub flash_notify: Arc<Notify>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .nest("/api/v1", api_v1())
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(std::time::Duration::from_secs(30)))
                .layer(CorsLayer::permissive()),
        )
}

fn api_v1() -> Router<AppState> {
    Router::new()
        .route("/auth/token", post(handlers::issue_token))
        .route("/messages", post(handlers::submit_message))
        .route("/messages/:id", get(handlers::get_status))
        .route("/messages/:id/content", get(handlers::get_content))
        .route("/messages/:id/ack", post(handlers::acknowledge))
        .route("/nodes", get(handlers::list_nodes))
        .route("/audit/events", get(handlers::query_audit))
        .route("/queue/status", get(handlers::queue_status))
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    details: Option<String>,
    request_id: uuid::Uuid,
}

impl IntoResponse for TacEdgeError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            TacEdgeError::Auth { .. } => StatusCode::UNAUTHORIZED,
            TacEdgeError::Permission(_) => StatusCode::FORBIDDEN,
            TacEdgeError::Validation(_) => StatusCode::BAD_REQUEST,
            TacEdgeError::Integrity => StatusCode::INTERNAL_SERVER_ERROR,
            TacEdgeError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            TacEdgeError::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
            TacEdgeError::NotFound(_) => StatusCode::NOT_FOUND,
            TacEdgeError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let request_id = match &self {
            TacEdgeError::Internal { request_id, .. } => *request_id,
            _ => uuid::Uuid::new_v4(),
        };

        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                message: self.to_string(),
                details: None,
                request_id,
            },
        };

        (status, Json(body)).into_response()
    }
}
