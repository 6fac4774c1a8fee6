//! Audit Log (C1) — append-only structured event store.
//!
//! Backed by a `sled::Tree` keyed by a lexicographically sortable
//! `(timestamp_nanos, event_id)` composite so that a forward range scan
//! yields oldest-first and a reverse scan yields the newest-first order
//! `query` promises. Appends are serialized behind a single `parking_lot`
//! mutex (readers never block on it — `sled` itself provides consistent
//! concurrent reads) per the shared-resource policy in the design.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{Classification, Precedence};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlFamily {
    Ac,
    Au,
    Ia,
    Sc,
    Si,
}

impl ControlFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlFamily::Ac => "AC",
            ControlFamily::Au => "AU",
            ControlFamily::Ia => "IA",
            ControlFamily::Sc => "SC",
            ControlFamily::Si => "SI",
        }
    }
}

impl std::str::FromStr for ControlFamily {
    type Err = crate::error::TacEdgeError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "AC" => Ok(ControlFamily::Ac),
            "AU" => Ok(ControlFamily::Au),
            "IA" => Ok(ControlFamily::Ia),
            "SC" => Ok(ControlFamily::Sc),
            "SI" => Ok(ControlFamily::Si),
            other => Err(crate::error::TacEdgeError::Validation(format!(
                "unknown control family: {other}"
            ))),
        }
    }
}

/// Event catalog, minimum set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    RbacCheck,
    PermissionDenied,
    AuditStart,
    MessageSubmitted,
    MessageDelivered,
    MessageFailed,
    MessageExpired,
    AuthSuccess,
    AuthFailure,
    TokenIssued,
    Encrypt,
    Decrypt,
    KeyRotate,
    IntegrityCheck,
    ValidationFailure,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RbacCheck => "RBAC_CHECK",
            EventType::PermissionDenied => "PERMISSION_DENIED",
            EventType::AuditStart => "AUDIT_START",
            EventType::MessageSubmitted => "MESSAGE_SUBMITTED",
            EventType::MessageDelivered => "MESSAGE_DELIVERED",
            EventType::MessageFailed => "MESSAGE_FAILED",
            EventType::MessageExpired => "MESSAGE_EXPIRED",
            EventType::AuthSuccess => "AUTH_SUCCESS",
            EventType::AuthFailure => "AUTH_FAILURE",
            EventType::TokenIssued => "TOKEN_ISSUED",
            EventType::Encrypt => "ENCRYPT",
            EventType::Decrypt => "DECRYPT",
            EventType::KeyRotate => "KEY_ROTATE",
            EventType::IntegrityCheck => "INTEGRITY_CHECK",
            EventType::ValidationFailure => "VALIDATION_FAILURE",
        }
    }

    pub fn family(&self) -> ControlFamily {
        match self {
            EventType::RbacCheck | EventType::PermissionDenied => ControlFamily::Ac,
            EventType::AuditStart
            | EventType::MessageSubmitted
            | EventType::MessageDelivered
            | EventType::MessageFailed
            | EventType::MessageExpired => ControlFamily::Au,
            EventType::AuthSuccess | EventType::AuthFailure | EventType::TokenIssued => {
                ControlFamily::Ia
            }
            EventType::Encrypt | EventType::Decrypt | EventType::KeyRotate => ControlFamily::Sc,
            EventType::IntegrityCheck | EventType::ValidationFailure => ControlFamily::Si,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    pub node_id: String,
    pub role: String,
    pub source_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub operation: String,
    pub resource: String,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub control_family: ControlFamily,
    pub event_type: EventType,
    pub actor: Actor,
    pub action: Action,
    pub context: HashMap<String, serde_json::Value>,
}

pub struct AuditEventBuilder {
    event_type: EventType,
    actor: Actor,
    operation: String,
    resource: String,
    outcome: Outcome,
    context: HashMap<String, serde_json::Value>,
}

impl AuditEventBuilder {
    pub fn new(event_type: EventType, actor: Actor) -> Self {
        Self {
            event_type,
            actor,
            operation: String::new(),
            resource: String::new(),
            outcome: Outcome::Success,
            context: HashMap::new(),
        }
    }

    pub fn operation(mut self, op: impl Into<String>) -> Self {
        self.operation = op.into();
        self
    }

    pub fn resource(mut self, res: impl Into<String>) -> Self {
        self.resource = res.into();
        self
    }

    pub fn outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn message_context(mut self, precedence: Precedence, classification: Classification) -> Self {
        self.context
            .insert("precedence".to_string(), serde_json::json!(precedence.as_str()));
        self.context.insert(
            "classification".to_string(),
            serde_json::json!(classification.as_str()),
        );
        self
    }

    pub fn context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn build(self) -> AuditEvent {
        AuditEvent {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            control_family: self.event_type.family(),
            event_type: self.event_type,
            actor: self.actor,
            action: Action {
                operation: self.operation,
                resource: self.resource,
                outcome: self.outcome,
            },
            context: self.context,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub control_family: Option<ControlFamily>,
    pub event_type: Option<EventType>,
    pub node_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl AuditFilter {
    fn matches(&self, e: &AuditEvent) -> bool {
        if let Some(cf) = self.control_family {
            if e.control_family != cf {
                return false;
            }
        }
        if let Some(et) = self.event_type {
            if e.event_type != et {
                return false;
            }
        }
        if let Some(ref node_id) = self.node_id {
            if &e.actor.node_id != node_id {
                return false;
            }
        }
        if let Some(start) = self.start_time {
            if e.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if e.timestamp > end {
                return false;
            }
        }
        true
    }
}

/// Append-only audit log backed by a `sled::Tree`.
///
/// `append` returning `Ok(())` means durable: the write has been flushed
/// to the `sled::Tree`'s backing store. Callers on the submission path
/// (§4.5 step 7) must await this before responding 201.
pub struct AuditLog {
    tree: sled::Tree,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn open(db: &sled::Db) -> Result<Arc<Self>> {
        let tree = db.open_tree("audit_events")?;
        Ok(Arc::new(Self {
            tree,
            write_lock: Mutex::new(()),
        }))
    }

    /// Durable append. Non-submission-path callers may spawn this onto a
    /// background task for best-effort/buffered semantics (§4.1 Failures);
    /// the submission path awaits it directly.
    pub async fn append(&self, event: AuditEvent) -> Result<()> {
        let _guard = self.write_lock.lock();
        let key = Self::sort_key(event.timestamp, event.event_id);
        let value = serde_json::to_vec(&event)?;
        self.tree.insert(key, value)?;
        self.tree.flush_async().await?;
        Ok(())
    }

    /// Best-effort append: logs and drops the error instead of propagating
    /// it, for non-submission-path events per §4.1.
    pub async fn append_best_effort(&self, event: AuditEvent) {
        if let Err(e) = self.append(event).await {
            crate::logging::log_warn(
                crate::logging::LogCategory::System,
                &format!("best-effort audit append failed: {e}"),
            );
        }
    }

    /// Newest-first query, up to `limit` results. Unknown filters (e.g. a
    /// `node_id` that never appears) simply yield zero matches.
    pub fn query(&self, filter: &AuditFilter, limit: usize) -> Vec<AuditEvent> {
        let mut out = Vec::with_capacity(limit.min(256));
        for item in self.tree.iter().rev() {
            if out.len() >= limit {
                break;
            }
            let Ok((_, value)) = item else { continue };
            let Ok(event) = serde_json::from_slice::<AuditEvent>(&value) else {
                continue;
            };
            if filter.matches(&event) {
                out.push(event);
            }
        }
        out
    }

    fn sort_key(timestamp: DateTime<Utc>, event_id: Uuid) -> Vec<u8> {
        let nanos = timestamp.timestamp_nanos_opt().unwrap_or(0);
        let mut key = Vec::with_capacity(8 + 16);
        // Shift into unsigned range so byte-lexicographic order matches
        // numeric order.
        key.extend_from_slice(&(nanos as u64 ^ (1u64 << 63)).to_be_bytes());
        key.extend_from_slice(event_id.as_bytes());
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor() -> Actor {
        Actor {
            node_id: "node-a".to_string(),
            role: "operator".to_string(),
            source_address: "10.0.0.1".to_string(),
        }
    }

    async fn open_test_log() -> (Arc<AuditLog>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        (AuditLog::open(&db).unwrap(), dir)
    }

    #[tokio::test]
    async fn append_then_query_returns_newest_first() {
        let (log, _dir) = open_test_log().await;

        for i in 0..3 {
            let event = AuditEventBuilder::new(EventType::MessageSubmitted, actor())
                .operation("submit")
                .resource(format!("msg-{i}"))
                .build();
            log.append(event).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let results = log.query(&AuditFilter::default(), 10);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].action.resource, "msg-2");
        assert_eq!(results[2].action.resource, "msg-0");
    }

    #[tokio::test]
    async fn query_with_unknown_filter_returns_empty() {
        let (log, _dir) = open_test_log().await;
        log.append(AuditEventBuilder::new(EventType::MessageSubmitted, actor()).build())
            .await
            .unwrap();

        let filter = AuditFilter {
            node_id: Some("nonexistent-node".to_string()),
            ..Default::default()
        };
        assert!(log.query(&filter, 10).is_empty());
    }

    #[tokio::test]
    async fn filters_by_control_family_and_event_type() {
        let (log, _dir) = open_test_log().await;
        log.append(AuditEventBuilder::new(EventType::AuthFailure, actor()).build())
            .await
            .unwrap();
        log.append(AuditEventBuilder::new(EventType::MessageSubmitted, actor()).build())
            .await
            .unwrap();

        let filter = AuditFilter {
            control_family: Some(ControlFamily::Ia),
            ..Default::default()
        };
        let results = log.query(&filter, 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].event_type, EventType::AuthFailure);
    }
}
