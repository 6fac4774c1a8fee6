//! Structured logging setup and category-tagged helpers.
//!
//! `tracing` carries operational logs (what an operator tails); it is
//! deliberately separate from the durable `audit` module, which is the
//! compliance record. Nothing that touches plaintext content, sealed
//! payload bytes, or key material is ever passed through here.

use crate::config::LogFormat;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    System,
    Auth,
    Crypto,
    Queue,
    Dispatch,
    Gateway,
}

impl LogCategory {
    fn as_str(&self) -> &'static str {
        match self {
            LogCategory::System => "system",
            LogCategory::Auth => "auth",
            LogCategory::Crypto => "crypto",
            LogCategory::Queue => "queue",
            LogCategory::Dispatch => "dispatch",
            LogCategory::Gateway => "gateway",
        }
    }
}

pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = fmt().with_env_filter(filter).with_target(true);

    match format {
        LogFormat::Json => {
            let _ = subscriber.json().try_init();
        }
        LogFormat::Pretty => {
            let _ = subscriber.try_init();
        }
    }
}

pub fn log_info(category: LogCategory, message: &str) {
    tracing::info!(category = category.as_str(), "{message}");
}

pub fn log_warn(category: LogCategory, message: &str) {
    tracing::warn!(category = category.as_str(), "{message}");
}

pub fn log_error(category: LogCategory, message: &str) {
    tracing::error!(category = category.as_str(), "{message}");
}
