//! Layered configuration: `default.toml` < `TACEDGE_*` env vars < an
//! optional explicit file path, via the `config` crate's builder API.

use serde::Deserialize;
use std::collections::HashMap;
use zeroize::Zeroizing;

use crate::error::{Result, TacEdgeError};
use crate::model::Precedence;

#[derive(Debug, Clone, Deserialize)]
pub struct QueueWatermarks {
    pub flash: usize,
    pub immediate: usize,
    pub priority: usize,
    pub routine: usize,
}

impl Default for QueueWatermarks {
    fn default() -> Self {
        Self {
            flash: 100,
            immediate: 1_000,
            priority: 10_000,
            routine: 100_000,
        }
    }
}

impl QueueWatermarks {
    pub fn get(&self, p: Precedence) -> usize {
        match p {
            Precedence::Flash => self.flash,
            Precedence::Immediate => self.immediate,
            Precedence::Priority => self.priority,
            Precedence::Routine => self.routine,
        }
    }
}

/// Requests-per-minute ceiling for one (role, endpoint-class) pair.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub flash_per_min: u32,
    pub other_precedence_per_min: u32,
    pub reads_per_min: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            flash_per_min: 100,
            other_precedence_per_min: 1_000,
            reads_per_min: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TacEdgeConfig {
    /// Filesystem path for the embedded sled database.
    pub data_dir: String,
    pub http_bind: String,

    pub dispatcher_tick_ms: u64,
    pub heartbeat_threshold_s: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub attempt_timeout_flash_ms: u64,
    pub attempt_timeout_other_ms: u64,
    pub queue_watermarks: QueueWatermarks,
    pub rate_limits: RateLimitConfig,

    /// Raw key material. Loaded from env/file as base64 and held zeroized.
    #[serde(skip)]
    pub token_signing_key: Zeroizing<Vec<u8>>,
    #[serde(skip)]
    pub content_encryption_key: Zeroizing<Vec<u8>>,
    pub key_version: u32,

    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Default for TacEdgeConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data/tacedge".to_string(),
            http_bind: "0.0.0.0:8080".to_string(),
            dispatcher_tick_ms: 2000,
            heartbeat_threshold_s: 60,
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 60_000,
            attempt_timeout_flash_ms: 5_000,
            attempt_timeout_other_ms: 30_000,
            queue_watermarks: QueueWatermarks::default(),
            rate_limits: RateLimitConfig::default(),
            token_signing_key: Zeroizing::new(Vec::new()),
            content_encryption_key: Zeroizing::new(Vec::new()),
            key_version: 1,
            log_format: LogFormat::Pretty,
        }
    }
}

impl TacEdgeConfig {
    /// Loads configuration layers in order: optional `.env` via `dotenvy`,
    /// a `default.toml` layer, `TACEDGE_`-prefixed environment overrides,
    /// and an optional explicit override file.
    pub fn load(override_path: Option<&str>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("default").required(false))
            .add_source(config::Environment::with_prefix("TACEDGE").separator("__"));

        if let Some(path) = override_path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        let raw = builder
            .build()
            .map_err(|e| TacEdgeError::internal(format!("config load failed: {e}")))?;

        let mut cfg: TacEdgeConfig = raw
            .try_deserialize()
            .map_err(|e| TacEdgeError::internal(format!("config shape invalid: {e}")))?;

        cfg.token_signing_key = Zeroizing::new(load_key(
            "TACEDGE_TOKEN_SIGNING_KEY",
            "tacedge-development-only-signing-key",
        )?);
        cfg.content_encryption_key = Zeroizing::new(load_key(
            "TACEDGE_CONTENT_ENCRYPTION_KEY",
            "tacedge-development-only-aes-key-32b",
        )?);

        Ok(cfg)
    }

    pub fn attempt_timeout(&self, p: Precedence) -> std::time::Duration {
        let ms = match p {
            Precedence::Flash => self.attempt_timeout_flash_ms,
            _ => self.attempt_timeout_other_ms,
        };
        std::time::Duration::from_millis(ms)
    }
}

/// Reads a base64-encoded key from the environment, falling back to a
/// fixed development default so the binary is runnable out of the box.
/// Production deployments MUST set the env var; this is not validated
/// here because key provisioning is an operational, not a library, concern.
fn load_key(env_var: &str, dev_default: &str) -> Result<Vec<u8>> {
    use base64::{engine::general_purpose::STANDARD, Engine};

    let raw = std::env::var(env_var).unwrap_or_else(|_| STANDARD.encode(dev_default));
    STANDARD
        .decode(raw.trim())
        .map_err(|e| TacEdgeError::internal(format!("{env_var} is not valid base64: {e}")))
}

/// Per-(role, endpoint-class) rate limit lookup used by `gateway::rate_limit`.
pub fn rate_limit_table(cfg: &RateLimitConfig) -> HashMap<&'static str, u32> {
    let mut m = HashMap::new();
    m.insert("submit_flash", cfg.flash_per_min);
    m.insert("submit_other", cfg.other_precedence_per_min);
    m.insert("read", cfg.reads_per_min);
    m
}
