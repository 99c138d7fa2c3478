//! Database pool setup and schema initialization.
//!
//! The engine persists the six durable collections in SQLite: jobs,
//! chunks, queue entries, deduplication records, processing errors, and
//! audit entries. WAL mode lets concurrent workers claim and commit
//! without blocking readers; `busy_timeout` resolves writer contention
//! (the claim CAS is a single statement, so contention only delays it,
//! never splits it).

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::EngineConfig;

/// Schema for the six durable collections. Idempotent; applied on every
/// startup.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS upload_jobs (
    id               TEXT PRIMARY KEY,
    file_name        TEXT NOT NULL,
    file_size_bytes  INTEGER NOT NULL DEFAULT 0,
    file_hash        TEXT NOT NULL,
    strategy         TEXT NOT NULL,
    priority         INTEGER NOT NULL DEFAULT 0,
    status           TEXT NOT NULL DEFAULT 'pending',
    total_rows       INTEGER NOT NULL DEFAULT 0,
    processed_rows   INTEGER NOT NULL DEFAULT 0,
    success_count    INTEGER NOT NULL DEFAULT 0,
    error_count      INTEGER NOT NULL DEFAULT 0,
    warning_count    INTEGER NOT NULL DEFAULT 0,
    skipped_count    INTEGER NOT NULL DEFAULT 0,
    retry_count      INTEGER NOT NULL DEFAULT 0,
    max_retries      INTEGER NOT NULL DEFAULT 0,
    last_error       TEXT,
    created_at       TEXT NOT NULL,
    started_at       TEXT,
    completed_at     TEXT,
    expires_at       TEXT
);

-- Idempotent resubmission protection: at most one live (non-cancelled,
-- non-failed) job per file hash.
CREATE UNIQUE INDEX IF NOT EXISTS idx_upload_jobs_live_file_hash
    ON upload_jobs (file_hash)
    WHERE status NOT IN ('cancelled', 'failed');

CREATE TABLE IF NOT EXISTS upload_chunks (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id           TEXT NOT NULL REFERENCES upload_jobs (id),
    chunk_index      INTEGER NOT NULL,
    total_chunks     INTEGER NOT NULL,
    row_start        INTEGER NOT NULL,
    row_end          INTEGER NOT NULL,
    status           TEXT NOT NULL DEFAULT 'pending',
    processed_rows   INTEGER NOT NULL DEFAULT 0,
    success_count    INTEGER NOT NULL DEFAULT 0,
    error_count      INTEGER NOT NULL DEFAULT 0,
    warning_count    INTEGER NOT NULL DEFAULT 0,
    skipped_count    INTEGER NOT NULL DEFAULT 0,
    created_at       TEXT NOT NULL,
    processed_at     TEXT,
    UNIQUE (job_id, chunk_index)
);

CREATE TABLE IF NOT EXISTS queue_entries (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id           TEXT NOT NULL REFERENCES upload_jobs (id),
    chunk_index      INTEGER NOT NULL,
    queue_name       TEXT NOT NULL,
    priority         INTEGER NOT NULL DEFAULT 0,
    status           TEXT NOT NULL DEFAULT 'waiting',
    lease_owner      TEXT,
    leased_at        TEXT,
    lease_expires_at TEXT,
    attempts         INTEGER NOT NULL DEFAULT 0,
    max_attempts     INTEGER NOT NULL,
    last_error       TEXT,
    next_retry_at    TEXT,
    created_at       TEXT NOT NULL,
    UNIQUE (job_id, chunk_index)
);

-- Claim scans filter by queue and status, then order by priority and age.
CREATE INDEX IF NOT EXISTS idx_queue_entries_claim
    ON queue_entries (queue_name, status, priority, next_retry_at);

CREATE TABLE IF NOT EXISTS dedup_records (
    hash               TEXT NOT NULL,
    scope              TEXT NOT NULL,
    business_key       TEXT,
    originating_job_id TEXT NOT NULL,
    first_seen_at      TEXT NOT NULL,
    last_seen_at       TEXT NOT NULL,
    duplicate_count    INTEGER NOT NULL DEFAULT 0,
    action_taken       TEXT NOT NULL DEFAULT 'skipped',
    PRIMARY KEY (scope, hash)
);

-- Secondary dedup signal on the domain-supplied natural key.
CREATE UNIQUE INDEX IF NOT EXISTS idx_dedup_records_business_key
    ON dedup_records (scope, business_key)
    WHERE business_key IS NOT NULL;

CREATE TABLE IF NOT EXISTS processing_errors (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id           TEXT NOT NULL REFERENCES upload_jobs (id),
    chunk_index      INTEGER NOT NULL,
    row_number       INTEGER NOT NULL,
    severity         TEXT NOT NULL,
    code             TEXT NOT NULL,
    message          TEXT NOT NULL,
    raw_row          TEXT,
    resolved         INTEGER NOT NULL DEFAULT 0,
    resolved_by      TEXT,
    resolution_notes TEXT,
    created_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_processing_errors_job_severity
    ON processing_errors (job_id, severity);

CREATE TABLE IF NOT EXISTS audit_entries (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type    TEXT NOT NULL,
    entity_type   TEXT NOT NULL,
    entity_id     TEXT NOT NULL,
    actor         TEXT NOT NULL,
    before_state  TEXT,
    after_state   TEXT,
    partition_key TEXT NOT NULL,
    timestamp     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_entries_partition
    ON audit_entries (partition_key);
CREATE INDEX IF NOT EXISTS idx_audit_entries_entity
    ON audit_entries (entity_type, entity_id);
"#;

/// Connect to the engine database and apply the schema.
pub async fn connect(config: &EngineConfig) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(&config.database_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect_with(options)
        .await?;

    init_schema(&pool).await?;
    Ok(pool)
}

/// Apply the schema to an existing pool (idempotent).
pub async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    tracing::debug!("database schema applied");
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Open a pooled connection to a fresh temporary database file.
    ///
    /// Concurrency tests need multiple connections against the same
    /// database, which rules out `:memory:` (each connection would get
    /// its own). The tempdir is returned so it outlives the pool.
    pub async fn test_pool() -> (SqlitePool, tempfile::TempDir) {
        #[allow(clippy::expect_used)]
        let dir = tempfile::tempdir().expect("create tempdir");
        let url = format!(
            "sqlite://{}",
            dir.path().join("intake-test.db").display()
        );
        let config = EngineConfig {
            database_url: url,
            ..EngineConfig::default()
        };
        #[allow(clippy::expect_used)]
        let pool = connect(&config).await.expect("connect test database");
        (pool, dir)
    }

    /// Insert a minimal parent job row with a fixed id so fixtures can
    /// reference it (processing_errors.job_id enforces the foreign key).
    pub async fn seed_job(pool: &SqlitePool, job_id: &str) {
        #[allow(clippy::expect_used)]
        sqlx::query(
            r#"
            INSERT INTO upload_jobs
                (id, file_name, file_size_bytes, file_hash, strategy, priority,
                 status, max_retries, created_at)
            VALUES (?1, ?2, 0, ?3, 'parallel', 0, 'pending', 0, ?4)
            "#,
        )
        .bind(job_id)
        .bind(format!("{job_id}.csv"))
        .bind(format!("hash-{job_id}"))
        .bind(chrono::Utc::now())
        .execute(pool)
        .await
        .expect("seed parent job row");
    }
}
