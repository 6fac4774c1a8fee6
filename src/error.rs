//! Crate-wide error taxonomy.
//!
//! Mirrors the error kinds in the design's error handling table: each
//! variant maps to exactly one HTTP status and one audit control family
//! at the gateway boundary (see `gateway::handlers`).

use serde::Serialize;
use uuid::Uuid;

/// Unified error type returned by every fallible operation in this crate.
#[derive(Debug, thiserror::Error, Clone, Serialize)]
pub enum TacEdgeError {
    #[error("invalid or expired token: {reason}")]
    Auth { reason: String },

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("integrity check failed")]
    Integrity,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("queue full for precedence {0:?}")]
    QueueFull(crate::model::Precedence),

    #[error("message not found: {0}")]
    NotFound(Uuid),

    #[error("internal error (request_id={request_id})")]
    Internal {
        request_id: Uuid,
        #[serde(skip)]
        detail: String,
    },
}

impl TacEdgeError {
    pub fn internal(detail: impl Into<String>) -> Self {
        TacEdgeError::Internal {
            request_id: Uuid::new_v4(),
            detail: detail.into(),
        }
    }

    /// Stable machine-readable code used in the HTTP error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            TacEdgeError::Auth { .. } => "INVALID_TOKEN",
            TacEdgeError::Permission(_) => "FORBIDDEN",
            TacEdgeError::Validation(_) => "VALIDATION_ERROR",
            TacEdgeError::Integrity => "INTEGRITY_ERROR",
            TacEdgeError::RateLimited => "RATE_LIMITED",
            TacEdgeError::QueueFull(_) => "QUEUE_FULL",
            TacEdgeError::NotFound(_) => "NOT_FOUND",
            TacEdgeError::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, TacEdgeError>;

impl From<sled::Error> for TacEdgeError {
    fn from(e: sled::Error) -> Self {
        TacEdgeError::internal(format!("storage error: {e}"))
    }
}

impl From<serde_json::Error> for TacEdgeError {
    fn from(e: serde_json::Error) -> Self {
        TacEdgeError::internal(format!("serialization error: {e}"))
    }
}
