//! Engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Engine Configuration Constants
// ============================================================================

/// Default database URL (on-disk SQLite next to the worker process).
pub const DEFAULT_DATABASE_URL: &str = "sqlite://intake.db";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default queue name workers pull from.
pub const DEFAULT_QUEUE_NAME: &str = "chunks";

/// Default chunk size for `stream` / `sequential` strategies.
///
/// Small chunks keep memory flat and preserve ordering granularity.
pub const DEFAULT_SMALL_CHUNK_SIZE: i64 = 500;

/// Default chunk size for `parallel` / `batch` strategies.
///
/// Larger chunks amortize claim overhead across workers without letting
/// a single chunk's row buffer grow past the memory ceiling.
pub const DEFAULT_LARGE_CHUNK_SIZE: i64 = 5_000;

/// Default lease duration for a claimed queue entry.
pub const DEFAULT_LEASE_DURATION_SECS: u64 = 60;

/// Default worker poll interval when no work is available.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;

/// Default per-chunk attempt budget before an entry goes dead.
pub const DEFAULT_MAX_CHUNK_ATTEMPTS: i64 = 3;

/// Default backoff base delay.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;

/// Default backoff ceiling.
pub const DEFAULT_BACKOFF_CAP_MS: u64 = 60_000;

/// Default retention for terminal job records before the expiry sweep
/// removes them.
pub const DEFAULT_JOB_RETENTION_DAYS: u64 = 30;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub queue_name: String,
    pub small_chunk_size: i64,
    pub large_chunk_size: i64,
    pub lease_duration: Duration,
    pub poll_interval: Duration,
    pub max_chunk_attempts: i64,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub job_retention: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            database_max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            small_chunk_size: DEFAULT_SMALL_CHUNK_SIZE,
            large_chunk_size: DEFAULT_LARGE_CHUNK_SIZE,
            lease_duration: Duration::from_secs(DEFAULT_LEASE_DURATION_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_chunk_attempts: DEFAULT_MAX_CHUNK_ATTEMPTS,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_cap: Duration::from_millis(DEFAULT_BACKOFF_CAP_MS),
            job_retention: Duration::from_secs(DEFAULT_JOB_RETENTION_DAYS * 86_400),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = EngineConfig {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            database_max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
            queue_name: std::env::var("INTAKE_QUEUE_NAME")
                .unwrap_or_else(|_| DEFAULT_QUEUE_NAME.to_string()),
            small_chunk_size: std::env::var("INTAKE_SMALL_CHUNK_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_SMALL_CHUNK_SIZE),
            large_chunk_size: std::env::var("INTAKE_LARGE_CHUNK_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_LARGE_CHUNK_SIZE),
            lease_duration: Duration::from_secs(
                std::env::var("INTAKE_LEASE_DURATION_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_LEASE_DURATION_SECS),
            ),
            poll_interval: Duration::from_millis(
                std::env::var("INTAKE_POLL_INTERVAL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            max_chunk_attempts: std::env::var("INTAKE_MAX_CHUNK_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_CHUNK_ATTEMPTS),
            backoff_base: Duration::from_millis(
                std::env::var("INTAKE_BACKOFF_BASE_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_BACKOFF_BASE_MS),
            ),
            backoff_cap: Duration::from_millis(
                std::env::var("INTAKE_BACKOFF_CAP_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_BACKOFF_CAP_MS),
            ),
            job_retention: Duration::from_secs(
                std::env::var("INTAKE_JOB_RETENTION_DAYS")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(DEFAULT_JOB_RETENTION_DAYS)
                    * 86_400,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.small_chunk_size <= 0 || self.large_chunk_size <= 0 {
            anyhow::bail!("chunk sizes must be positive");
        }
        if self.small_chunk_size > self.large_chunk_size {
            anyhow::bail!(
                "small chunk size ({}) must not exceed large chunk size ({})",
                self.small_chunk_size,
                self.large_chunk_size
            );
        }
        if self.lease_duration.is_zero() {
            anyhow::bail!("lease duration must be positive");
        }
        if self.max_chunk_attempts < 1 {
            anyhow::bail!("max chunk attempts must be at least 1");
        }
        if self.backoff_base > self.backoff_cap {
            anyhow::bail!("backoff base must not exceed backoff cap");
        }
        if self.job_retention.is_zero() {
            anyhow::bail!("job retention must be positive");
        }
        Ok(())
    }

    /// Chunk size for the given upload strategy.
    pub fn chunk_size_for(&self, strategy: crate::models::UploadStrategy) -> i64 {
        use crate::models::UploadStrategy;
        match strategy {
            UploadStrategy::Stream | UploadStrategy::Sequential => self.small_chunk_size,
            UploadStrategy::Parallel | UploadStrategy::Batch => self.large_chunk_size,
        }
    }
}
