//! Request handlers for the `/api/v1` surface (§4.5, §6).

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;
use uuid::Uuid;

use crate::audit::{Actor, AuditEventBuilder, AuditFilter, ControlFamily, EventType, Outcome};
use crate::auth::Claims;
use crate::crypto::SealedPayload;
use crate::error::{Result, TacEdgeError};
use crate::model::{
    Classification, Message, MessageStatus, MessageView, Permission, Precedence, Role,
};

use super::rate_limit::EndpointClass;
use super::AppState;

const MAX_CONTENT_BYTES: usize = 64 * 1024;
const MIN_TTL_SECONDS: u32 = 1;
const MAX_TTL_SECONDS: u32 = 86_400;

fn source_address(connect_info: Option<&ConnectInfo<SocketAddr>>) -> String {
    connect_info
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn unknown_actor(source: &str) -> Actor {
    Actor {
        node_id: "unknown".to_string(),
        role: "unknown".to_string(),
        source_address: source.to_string(),
    }
}

async fn audit_auth_failure(state: &AppState, source: &str, reason: &str) {
    state.monitor.record_auth_failure();
    state
        .audit
        .append_best_effort(
            AuditEventBuilder::new(EventType::AuthFailure, unknown_actor(source))
                .operation("authenticate")
                .outcome(Outcome::Failure)
                .context("reason", serde_json::json!(reason))
                .build(),
        )
        .await;
}

async fn audit_validation_failure(state: &AppState, actor: Actor, field: &str) {
    state
        .audit
        .append_best_effort(
            AuditEventBuilder::new(EventType::ValidationFailure, actor)
                .operation("submit_message")
                .outcome(Outcome::Failure)
                .context("field", serde_json::json!(field))
                .build(),
        )
        .await;
}

/// Verifies the bearer token, bumps node liveness, and returns `Claims`.
/// Every authenticated handler starts here per §4.5 step 1. Every failure
/// branch appends an `AUTH_FAILURE` audit event (IA) carrying the reason,
/// per §8(f); success appends `AUTH_SUCCESS`.
async fn authenticate(state: &AppState, headers: &HeaderMap, source: &str) -> Result<Claims> {
    let header = match headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        Some(header) => header,
        None => {
            audit_auth_failure(state, source, "missing_header").await;
            return Err(TacEdgeError::Auth {
                reason: "missing authorization header".to_string(),
            });
        }
    };

    let token = match header.strip_prefix("Bearer ") {
        Some(token) => token,
        None => {
            audit_auth_failure(state, source, "not_bearer").await;
            return Err(TacEdgeError::Auth {
                reason: "authorization header is not a bearer token".to_string(),
            });
        }
    };

    let claims = match state.tokens.verify(token) {
        Ok(claims) => claims,
        Err(reason) => {
            audit_auth_failure(state, source, reason.as_str()).await;
            return Err(TacEdgeError::Auth {
                reason: reason.as_str().to_string(),
            });
        }
    };

    state.registry.touch(&claims.node_id, source);
    state
        .audit
        .append_best_effort(
            AuditEventBuilder::new(EventType::AuthSuccess, actor_for(&claims, source))
                .operation("authenticate")
                .outcome(Outcome::Success)
                .build(),
        )
        .await;
    Ok(claims)
}

/// Checks `permission` and appends the matching AC audit event —
/// `RBAC_CHECK` on success, `PERMISSION_DENIED` on failure.
async fn require_permission(
    state: &AppState,
    claims: &Claims,
    source: &str,
    permission: Permission,
) -> Result<()> {
    let actor = actor_for(claims, source);
    if claims.has_permission(permission) {
        state
            .audit
            .append_best_effort(
                AuditEventBuilder::new(EventType::RbacCheck, actor)
                    .operation(permission.as_str())
                    .outcome(Outcome::Success)
                    .build(),
            )
            .await;
        Ok(())
    } else {
        state
            .audit
            .append_best_effort(
                AuditEventBuilder::new(EventType::PermissionDenied, actor)
                    .operation(permission.as_str())
                    .outcome(Outcome::Failure)
                    .build(),
            )
            .await;
        Err(TacEdgeError::Permission(format!(
            "missing permission {}",
            permission.as_str()
        )))
    }
}

fn actor_for(claims: &Claims, source: &str) -> Actor {
    Actor {
        node_id: claims.node_id.clone(),
        role: claims.role.as_str().to_string(),
        source_address: source.to_string(),
    }
}

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn ready(State(state): State<AppState>) -> StatusCode {
    if matches!(
        state.monitor.get_system_health(),
        crate::monitor::HealthStatus::Critical
    ) {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

#[derive(Deserialize)]
pub struct IssueTokenRequest {
    pub node_id: String,
    pub role: String,
    pub permissions: Option<Vec<Permission>>,
}

#[derive(Serialize)]
pub struct IssueTokenResponse {
    pub token: String,
}

pub async fn issue_token(
    State(state): State<AppState>,
    Json(req): Json<IssueTokenRequest>,
) -> std::result::Result<Json<IssueTokenResponse>, TacEdgeError> {
    let role = Role::from_str(&req.role)?;
    let token = state.tokens.issue(&req.node_id, role, req.permissions)?;

    state
        .audit
        .append_best_effort(
            AuditEventBuilder::new(
                EventType::TokenIssued,
                Actor {
                    node_id: req.node_id,
                    role: role.as_str().to_string(),
                    source_address: "gateway".to_string(),
                },
            )
            .operation("issue_token")
            .outcome(Outcome::Success)
            .build(),
        )
        .await;

    Ok(Json(IssueTokenResponse { token }))
}

#[derive(Deserialize)]
pub struct SubmitRequest {
    pub sender: Option<String>,
    pub recipient: String,
    pub precedence: String,
    pub classification: String,
    /// Base64-encoded plaintext content.
    pub content: String,
    pub ttl_seconds: u32,
}

#[derive(Serialize)]
pub struct SubmitResponse {
    pub id: Uuid,
    pub status: MessageStatus,
    pub submitted_at: DateTime<Utc>,
}

#[tracing::instrument(skip_all, fields(precedence = %req.precedence, recipient = %req.recipient))]
pub async fn submit_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Json(req): Json<SubmitRequest>,
) -> std::result::Result<(StatusCode, Json<SubmitResponse>), TacEdgeError> {
    let source = source_address(connect_info.as_ref());
    let claims = authenticate(&state, &headers, &source).await?;
    require_permission(&state, &claims, &source, Permission::MessageSend).await?;

    let sender = req.sender.clone().unwrap_or_else(|| claims.node_id.clone());
    if claims.role != Role::Service && sender != claims.node_id {
        return Err(TacEdgeError::Permission(
            "token subject may not submit on behalf of a different sender".to_string(),
        ));
    }

    let actor = actor_for(&claims, &source);

    let precedence = match Precedence::from_str(&req.precedence) {
        Ok(p) => p,
        Err(e) => {
            audit_validation_failure(&state, actor.clone(), "precedence").await;
            return Err(e);
        }
    };
    let classification = match Classification::from_str(&req.classification) {
        Ok(c) => c,
        Err(e) => {
            audit_validation_failure(&state, actor.clone(), "classification").await;
            return Err(e);
        }
    };

    let rate_class = if precedence == Precedence::Flash {
        EndpointClass::SubmitFlash
    } else {
        EndpointClass::SubmitOther
    };
    let limit = if precedence == Precedence::Flash {
        state.config.rate_limits.flash_per_min
    } else {
        state.config.rate_limits.other_precedence_per_min
    };
    if !state.rate_limiter.check(rate_class, &claims.jti.to_string(), limit) {
        state.monitor.record_rate_limited();
        return Err(TacEdgeError::RateLimited);
    }

    let content = match STANDARD.decode(&req.content) {
        Ok(c) => c,
        Err(_) => {
            audit_validation_failure(&state, actor.clone(), "content").await;
            return Err(TacEdgeError::Validation("content is not valid base64".to_string()));
        }
    };
    if content.len() > MAX_CONTENT_BYTES {
        audit_validation_failure(&state, actor.clone(), "content").await;
        return Err(TacEdgeError::Validation(format!(
            "content exceeds {MAX_CONTENT_BYTES} bytes"
        )));
    }
    if !(MIN_TTL_SECONDS..=MAX_TTL_SECONDS).contains(&req.ttl_seconds) {
        audit_validation_failure(&state, actor.clone(), "ttl_seconds").await;
        return Err(TacEdgeError::Validation(format!(
            "ttl_seconds must be in [{MIN_TTL_SECONDS}, {MAX_TTL_SECONDS}]"
        )));
    }

    let depth = state.queue.depth(precedence);
    let watermark = state.config.queue_watermarks.get(precedence);
    if state.backpressure.check(precedence, depth, watermark) {
        return Err(TacEdgeError::QueueFull(precedence));
    }

    let sealed = state.crypto.seal(&content, classification, actor.clone()).await?;

    let now = Utc::now();
    let message = Message {
        id: Uuid::new_v4(),
        precedence,
        classification,
        sender: sender.clone(),
        recipient: req.recipient,
        sealed_payload: sealed.into_bytes(),
        submitted_at: now,
        ttl_seconds: req.ttl_seconds,
        status: MessageStatus::Queued,
        attempt_count: 0,
        next_attempt_at: now,
    };
    let id = message.id;
    state.queue.enqueue(message).await?;

    state
        .audit
        .append(
            AuditEventBuilder::new(EventType::MessageSubmitted, actor)
                .operation("submit_message")
                .resource(id.to_string())
                .message_context(precedence, classification)
                .outcome(Outcome::Success)
                .build(),
        )
        .await?;

    if precedence == Precedence::Flash {
        state.flash_notify.notify_one();
    }

    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            id,
            status: MessageStatus::Queued,
            submitted_at: now,
        }),
    ))
}

#[derive(Serialize)]
pub struct MessageStatusResponse {
    pub message: MessageView,
    pub audit_trail: Vec<crate::audit::AuditEvent>,
}

pub async fn get_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Path(id): Path<Uuid>,
) -> std::result::Result<Json<MessageStatusResponse>, TacEdgeError> {
    let source = source_address(connect_info.as_ref());
    let claims = authenticate(&state, &headers, &source).await?;
    require_permission(&state, &claims, &source, Permission::MessageRead).await?;

    let message = state.queue.get(id).ok_or(TacEdgeError::NotFound(id))?;
    let trail: Vec<_> = state
        .audit
        .query(&AuditFilter::default(), 10_000)
        .into_iter()
        .filter(|e| e.action.resource == id.to_string())
        .collect();

    Ok(Json(MessageStatusResponse {
        message: MessageView::from(&message),
        audit_trail: trail,
    }))
}

#[derive(Serialize)]
pub struct ContentResponse {
    pub id: Uuid,
    /// Base64-encoded plaintext.
    pub content: String,
}

pub async fn get_content(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Path(id): Path<Uuid>,
) -> std::result::Result<Json<ContentResponse>, TacEdgeError> {
    let source = source_address(connect_info.as_ref());
    let claims = authenticate(&state, &headers, &source).await?;
    require_permission(&state, &claims, &source, Permission::MessageRead).await?;

    let message = state.queue.get(id).ok_or(TacEdgeError::NotFound(id))?;
    if message.classification > claims.role.classification_ceiling() {
        return Err(TacEdgeError::Permission(
            "classification exceeds role ceiling".to_string(),
        ));
    }

    let actor = actor_for(&claims, &source);
    let sealed = SealedPayload::from_bytes(message.sealed_payload.clone());
    let plaintext = state.crypto.open(&sealed, actor).await?;

    Ok(Json(ContentResponse {
        id,
        content: STANDARD.encode(plaintext),
    }))
}

#[derive(Serialize)]
pub struct AckResponse {
    pub id: Uuid,
    pub acknowledged_at: DateTime<Utc>,
}

/// Records a recipient's out-of-band confirmation of receipt. Distinct
/// from the dispatcher's internal `ack`, which already moved the message
/// to DELIVERED — this is an additional, auditable confirmation step and
/// does not itself change `status`.
pub async fn acknowledge(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Path(id): Path<Uuid>,
) -> std::result::Result<Json<AckResponse>, TacEdgeError> {
    let source = source_address(connect_info.as_ref());
    let claims = authenticate(&state, &headers, &source).await?;
    require_permission(&state, &claims, &source, Permission::MessageSend).await?;

    let message = state.queue.get(id).ok_or(TacEdgeError::NotFound(id))?;
    let acknowledged_at = Utc::now();

    state
        .audit
        .append(
            AuditEventBuilder::new(EventType::MessageDelivered, actor_for(&claims, &source))
                .operation("acknowledge")
                .resource(id.to_string())
                .message_context(message.precedence, message.classification)
                .outcome(Outcome::Success)
                .context("manual_ack", serde_json::json!(true))
                .build(),
        )
        .await?;

    Ok(Json(AckResponse { id, acknowledged_at }))
}

pub async fn list_nodes(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> std::result::Result<Json<Vec<crate::registry::NodeView>>, TacEdgeError> {
    let source = source_address(connect_info.as_ref());
    let claims = authenticate(&state, &headers, &source).await?;
    require_permission(&state, &claims, &source, Permission::NodeStatus).await?;

    let views = state
        .registry
        .list()
        .into_iter()
        .map(|(record, status)| crate::registry::NodeView {
            node_id: record.node_id,
            address: record.address,
            last_seen: record.last_seen,
            capabilities: record.capabilities,
            status,
        })
        .collect();

    Ok(Json(views))
}

#[derive(Deserialize)]
pub struct AuditQuery {
    pub control_family: Option<String>,
    pub event_type: Option<String>,
    pub node_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

pub async fn query_audit(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Query(q): Query<AuditQuery>,
) -> std::result::Result<Json<Vec<crate::audit::AuditEvent>>, TacEdgeError> {
    let source = source_address(connect_info.as_ref());
    let claims = authenticate(&state, &headers, &source).await?;
    require_permission(&state, &claims, &source, Permission::AuditRead).await?;
    if !claims.role.can_read_audit() {
        return Err(TacEdgeError::Permission(
            "role may not query the audit log".to_string(),
        ));
    }

    if !state
        .rate_limiter
        .check(EndpointClass::Read, &claims.jti.to_string(), state.config.rate_limits.reads_per_min)
    {
        state.monitor.record_rate_limited();
        return Err(TacEdgeError::RateLimited);
    }

    let control_family = q
        .control_family
        .as_deref()
        .map(ControlFamily::from_str)
        .transpose()?;
    let event_type = q
        .event_type
        .as_deref()
        .map(parse_event_type)
        .transpose()?;

    let filter = AuditFilter {
        control_family,
        event_type,
        node_id: q.node_id,
        start_time: q.start_time,
        end_time: q.end_time,
    };

    let events = state.audit.query(&filter, q.limit.unwrap_or(100));
    Ok(Json(events))
}

fn parse_event_type(s: &str) -> Result<EventType> {
    let variant = match s {
        "RBAC_CHECK" => EventType::RbacCheck,
        "PERMISSION_DENIED" => EventType::PermissionDenied,
        "AUDIT_START" => EventType::AuditStart,
        "MESSAGE_SUBMITTED" => EventType::MessageSubmitted,
        "MESSAGE_DELIVERED" => EventType::MessageDelivered,
        "MESSAGE_FAILED" => EventType::MessageFailed,
        "MESSAGE_EXPIRED" => EventType::MessageExpired,
        "AUTH_SUCCESS" => EventType::AuthSuccess,
        "AUTH_FAILURE" => EventType::AuthFailure,
        "TOKEN_ISSUED" => EventType::TokenIssued,
        "ENCRYPT" => EventType::Encrypt,
        "DECRYPT" => EventType::Decrypt,
        "KEY_ROTATE" => EventType::KeyRotate,
        "INTEGRITY_CHECK" => EventType::IntegrityCheck,
        "VALIDATION_FAILURE" => EventType::ValidationFailure,
        other => {
            return Err(TacEdgeError::Validation(format!(
                "unknown event_type: {other}"
            )))
        }
    };
    Ok(variant)
}

#[derive(Serialize)]
pub struct QueueStatusResponse {
    pub flash: usize,
    pub immediate: usize,
    pub priority: usize,
    pub routine: usize,
    pub watermarks: QueueWatermarksView,
}

#[derive(Serialize)]
pub struct QueueWatermarksView {
    pub flash: usize,
    pub immediate: usize,
    pub priority: usize,
    pub routine: usize,
}

pub async fn queue_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> std::result::Result<Json<QueueStatusResponse>, TacEdgeError> {
    let source = source_address(connect_info.as_ref());
    let claims = authenticate(&state, &headers, &source).await?;
    require_permission(&state, &claims, &source, Permission::NodeStatus).await?;

    let depths = state.queue.depths();
    let watermarks = &state.config.queue_watermarks;

    Ok(Json(QueueStatusResponse {
        flash: *depths.get(&Precedence::Flash).unwrap_or(&0),
        immediate: *depths.get(&Precedence::Immediate).unwrap_or(&0),
        priority: *depths.get(&Precedence::Priority).unwrap_or(&0),
        routine: *depths.get(&Precedence::Routine).unwrap_or(&0),
        watermarks: QueueWatermarksView {
            flash: watermarks.flash,
            immediate: watermarks.immediate,
            priority: watermarks.priority,
            routine: watermarks.routine,
        },
    }))
}
