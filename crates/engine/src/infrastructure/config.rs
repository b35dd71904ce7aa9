//! Application configuration

use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};

/// Application configuration loaded from environment
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP bind address
    pub server_host: String,
    /// HTTP port (the game client is configured for 5000)
    pub server_port: u16,

    /// SQLite file holding sessions, players and rolls
    pub database_path: String,

    /// CORS allowed origins (comma-separated, or "*" for any). Empty disables CORS.
    pub cors_allowed_origins: Vec<String>,

    /// Queue configuration
    pub queue: QueueConfig,
}

/// Queue system configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue storage backend: "memory" or "sqlite"
    pub backend: String,
    /// SQLite database path (if using sqlite backend)
    pub sqlite_path: String,
    /// Deliveries per envelope before it is dead-lettered
    pub max_attempts: u32,
    /// Delay before the first redelivery (milliseconds)
    pub retry_base_delay_ms: u64,
    /// Cap on the exponential redelivery delay (milliseconds)
    pub retry_max_delay_ms: u64,
    /// Jitter factor (0.0-1.0) applied to redelivery delays
    pub retry_jitter: f64,
    /// Idle worker poll interval (seconds)
    pub recovery_poll_interval_seconds: u64,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let string = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let retry_jitter: f64 = parse_var(&lookup, "QUEUE_RETRY_JITTER", 0.2)?;
        if !(0.0..=1.0).contains(&retry_jitter) {
            anyhow::bail!("QUEUE_RETRY_JITTER must be between 0.0 and 1.0");
        }

        let max_attempts: u32 = parse_var(&lookup, "QUEUE_MAX_ATTEMPTS", 5)?;
        if max_attempts == 0 {
            anyhow::bail!("QUEUE_MAX_ATTEMPTS must be at least 1");
        }

        Ok(Self {
            server_host: string("SERVER_HOST", "0.0.0.0"),
            server_port: parse_var(&lookup, "SERVER_PORT", 5000)
                .context("SERVER_PORT must be a valid port number")?,

            database_path: string("DATABASE_PATH", "./data/dicelog.db"),

            cors_allowed_origins: lookup("CORS_ALLOWED_ORIGINS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),

            queue: QueueConfig {
                backend: string("QUEUE_BACKEND", "sqlite"),
                sqlite_path: string("QUEUE_SQLITE_PATH", "./data/queues.db"),
                max_attempts,
                retry_base_delay_ms: parse_var(&lookup, "QUEUE_RETRY_BASE_DELAY_MS", 500)?,
                retry_max_delay_ms: parse_var(&lookup, "QUEUE_RETRY_MAX_DELAY_MS", 30_000)?,
                retry_jitter,
                recovery_poll_interval_seconds: parse_var(
                    &lookup,
                    "QUEUE_RECOVERY_POLL_INTERVAL_SECONDS",
                    5,
                )?,
            },
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", name, raw)),
        None => Ok(default),
    }
}
