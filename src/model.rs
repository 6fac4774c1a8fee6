//! Core data model: messages, precedence, classification, node registrations.
//!
//! Types here are intentionally dumb — invariants (status transitions,
//! partition membership) are enforced by the components that own the
//! state (`queue`, `dispatch`, `gateway`), not by the struct itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Military precedence. Ordering is derived: FLASH is the smallest
/// discriminant and therefore `Ord`-smallest, so a `BinaryHeap<Reverse<_>>`
/// or a sorted `[Precedence; 4]` walk naturally yields strict-priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Precedence {
    Flash = 1,
    Immediate = 2,
    Priority = 3,
    Routine = 4,
}

impl Precedence {
    /// All four partitions in strict dispatch order.
    pub const ALL: [Precedence; 4] = [
        Precedence::Flash,
        Precedence::Immediate,
        Precedence::Priority,
        Precedence::Routine,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Precedence::Flash => "FLASH",
            Precedence::Immediate => "IMMEDIATE",
            Precedence::Priority => "PRIORITY",
            Precedence::Routine => "ROUTINE",
        }
    }
}

impl fmt::Display for Precedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Precedence {
    type Err = crate::error::TacEdgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FLASH" => Ok(Precedence::Flash),
            "IMMEDIATE" => Ok(Precedence::Immediate),
            "PRIORITY" => Ok(Precedence::Priority),
            "ROUTINE" => Ok(Precedence::Routine),
            other => Err(crate::error::TacEdgeError::Validation(format!(
                "unknown precedence: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Classification {
    Unclassified = 0,
    Confidential = 1,
    Secret = 2,
    TopSecret = 3,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Unclassified => "UNCLASSIFIED",
            Classification::Confidential => "CONFIDENTIAL",
            Classification::Secret => "SECRET",
            Classification::TopSecret => "TOP_SECRET",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Classification {
    type Err = crate::error::TacEdgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNCLASSIFIED" => Ok(Classification::Unclassified),
            "CONFIDENTIAL" => Ok(Classification::Confidential),
            "SECRET" => Ok(Classification::Secret),
            "TOP_SECRET" => Ok(Classification::TopSecret),
            other => Err(crate::error::TacEdgeError::Validation(format!(
                "unknown classification: {other}"
            ))),
        }
    }
}

/// Submission state machine. Transitions are monotone:
/// QUEUED -> IN_FLIGHT -> {DELIVERED, FAILED} or QUEUED (transient retry),
/// and QUEUED/IN_FLIGHT -> EXPIRED on TTL elapse from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Queued,
    InFlight,
    Delivered,
    Failed,
    Expired,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Delivered | MessageStatus::Failed | MessageStatus::Expired
        )
    }

    pub fn occupies_partition(&self) -> bool {
        matches!(self, MessageStatus::Queued | MessageStatus::InFlight)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageStatus::Queued => "QUEUED",
            MessageStatus::InFlight => "IN_FLIGHT",
            MessageStatus::Delivered => "DELIVERED",
            MessageStatus::Failed => "FAILED",
            MessageStatus::Expired => "EXPIRED",
        };
        write!(f, "{s}")
    }
}

/// A submitted message as held in the precedence queue / audit trail.
/// `sealed_payload` is opaque ciphertext produced by `crypto::seal` and is
/// never logged or serialized into a `tracing` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub precedence: Precedence,
    pub classification: Classification,
    pub sender: String,
    pub recipient: String,
    pub sealed_payload: Vec<u8>,
    pub submitted_at: DateTime<Utc>,
    pub ttl_seconds: u32,
    pub status: MessageStatus,
    pub attempt_count: u32,
    pub next_attempt_at: DateTime<Utc>,
}

impl Message {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.submitted_at + chrono::Duration::seconds(self.ttl_seconds as i64)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() <= now
    }
}

/// A view of a message returned to callers that must never carry the
/// sealed payload bytes (see `get_status` vs `get_content` in §4.5).
#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    pub id: Uuid,
    pub precedence: Precedence,
    pub classification: Classification,
    pub sender: String,
    pub recipient: String,
    pub submitted_at: DateTime<Utc>,
    pub ttl_seconds: u32,
    pub status: MessageStatus,
    pub attempt_count: u32,
    pub next_attempt_at: DateTime<Utc>,
}

impl From<&Message> for MessageView {
    fn from(m: &Message) -> Self {
        MessageView {
            id: m.id,
            precedence: m.precedence,
            classification: m.classification,
            sender: m.sender.clone(),
            recipient: m.recipient.clone(),
            submitted_at: m.submitted_at,
            ttl_seconds: m.ttl_seconds,
            status: m.status,
            attempt_count: m.attempt_count,
            next_attempt_at: m.next_attempt_at,
        }
    }
}

/// Bounded-ASCII node identifier. Validated at the gateway boundary.
pub type NodeId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub address: String,
    pub last_seen: DateTime<Utc>,
    pub capabilities: Vec<Precedence>,
}

impl NodeRecord {
    /// `status` is a pure function of `last_seen` vs `heartbeat_threshold` —
    /// it is never stored, only computed on read.
    pub fn status(&self, now: DateTime<Utc>, heartbeat_threshold: chrono::Duration) -> NodeStatus {
        if now - self.last_seen <= heartbeat_threshold {
            NodeStatus::Connected
        } else {
            NodeStatus::Disconnected
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Operator,
    Supervisor,
    Admin,
    Service,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Operator => "operator",
            Role::Supervisor => "supervisor",
            Role::Admin => "admin",
            Role::Service => "service",
        }
    }

    /// Supervisor and admin are the only roles permitted to call
    /// `query_audit`.
    pub fn can_read_audit(&self) -> bool {
        matches!(self, Role::Supervisor | Role::Admin)
    }

    /// Highest classification this role may retrieve via `get_content`.
    pub fn classification_ceiling(&self) -> Classification {
        match self {
            Role::Operator => Classification::Confidential,
            Role::Supervisor => Classification::Secret,
            Role::Admin => Classification::TopSecret,
            Role::Service => Classification::Unclassified,
        }
    }
}

impl std::str::FromStr for Role {
    type Err = crate::error::TacEdgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "operator" => Ok(Role::Operator),
            "supervisor" => Ok(Role::Supervisor),
            "admin" => Ok(Role::Admin),
            "service" => Ok(Role::Service),
            other => Err(crate::error::TacEdgeError::Validation(format!(
                "unknown role: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Permission {
    MessageSend,
    MessageRead,
    NodeStatus,
    AuditRead,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::MessageSend => "message:send",
            Permission::MessageRead => "message:read",
            Permission::NodeStatus => "node:status",
            Permission::AuditRead => "audit:read",
        }
    }
}

/// Default permission grant per role, used by `auth::issue_token` when the
/// caller does not narrow the requested permission set.
pub fn default_permissions(role: Role) -> Vec<Permission> {
    match role {
        Role::Operator => vec![Permission::MessageSend, Permission::MessageRead],
        Role::Supervisor => vec![
            Permission::MessageSend,
            Permission::MessageRead,
            Permission::NodeStatus,
            Permission::AuditRead,
        ],
        Role::Admin => vec![
            Permission::MessageSend,
            Permission::MessageRead,
            Permission::NodeStatus,
            Permission::AuditRead,
        ],
        Role::Service => vec![Permission::MessageSend, Permission::NodeStatus],
    }
}
