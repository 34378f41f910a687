//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! The database URL is wrapped in secrecy::SecretString to prevent log leaks.

use std::time::Duration;

use crate::error::{Error, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,

    /// Name of the pending pgmq queue.
    pub pending_queue: String,
    /// Name of the dead-letter pgmq queue.
    pub dead_queue: String,

    pub max_retries: u32,
    pub poll_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub heartbeat_interval: Duration,
    pub idempotency_ttl: Duration,
    pub max_log_lines: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            pending_queue: std::env::var("RUNQ_PENDING_QUEUE")
                .unwrap_or_else(|_| "runs".to_string()),
            dead_queue: std::env::var("RUNQ_DEAD_QUEUE")
                .unwrap_or_else(|_| "runs_dead".to_string()),
            max_retries: u32_var("RUNQ_MAX_RETRIES", 3)?,
            poll_timeout: secs_var("RUNQ_POLL_TIMEOUT_SECS", 5)?,
            backoff_base: secs_var("RUNQ_BACKOFF_BASE_SECS", 1)?,
            backoff_cap: secs_var("RUNQ_BACKOFF_CAP_SECS", 30)?,
            heartbeat_interval: secs_var("RUNQ_HEARTBEAT_SECS", 30)?,
            idempotency_ttl: secs_var("RUNQ_IDEMPOTENCY_TTL_SECS", 86_400)?,
            max_log_lines: u32_var("RUNQ_MAX_LOG_LINES", 1_000)? as usize,
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn u32_var(name: &str, default: u32) -> Result<u32> {
    match std::env::var(name) {
        Ok(v) => v
            .parse()
            .map_err(|_| Error::Config(format!("{name} must be an integer, got {v:?}"))),
        Err(_) => Ok(default),
    }
}

fn secs_var(name: &str, default: u64) -> Result<Duration> {
    match std::env::var(name) {
        Ok(v) => v
            .parse()
            .map(Duration::from_secs)
            .map_err(|_| Error::Config(format!("{name} must be an integer, got {v:?}"))),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}
