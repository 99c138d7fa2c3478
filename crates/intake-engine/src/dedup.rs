//! Deduplication index.
//!
//! Durable mapping from content fingerprint (and optional business key)
//! to the job that first ingested it. The primary-key constraint on
//! `(scope, hash)` is the sole arbiter of "first writer wins": the
//! outcome of a concurrent insert race is decided by the index itself,
//! not by application-level locking. Records are never deleted —
//! deduplication history must survive job deletion.

use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;

use crate::audit::{self, AuditEvent};
use crate::models::{DedupRecord, DedupScope};

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Audit error: {0}")]
    Audit(#[from] audit::AuditError),
}

/// Typed outcome of an idempotent insert: the conflict-or-not decision
/// is part of the contract, not an implicit storage-engine behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// This call created the record; the caller's job is now the
    /// originating job for the hash.
    Inserted,
    /// The hash (or business key) was already indexed.
    AlreadyPresent { originating_job_id: String },
}

/// Handle over the dedup_records collection.
#[derive(Debug, Clone)]
pub struct DedupIndex {
    pool: SqlitePool,
}

impl DedupIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Look up a fingerprint without touching counters.
    pub async fn lookup(
        &self,
        scope: DedupScope,
        hash: &str,
    ) -> Result<Option<DedupRecord>, DedupError> {
        let record = sqlx::query_as::<_, DedupRecord>(
            r#"
            SELECT hash, scope, business_key, originating_job_id, first_seen_at,
                   last_seen_at, duplicate_count, action_taken
            FROM dedup_records
            WHERE scope = ?1 AND hash = ?2
            "#,
        )
        .bind(scope)
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Look up by the domain-supplied natural key (secondary signal).
    pub async fn lookup_business_key(
        &self,
        scope: DedupScope,
        business_key: &str,
    ) -> Result<Option<DedupRecord>, DedupError> {
        let record = sqlx::query_as::<_, DedupRecord>(
            r#"
            SELECT hash, scope, business_key, originating_job_id, first_seen_at,
                   last_seen_at, duplicate_count, action_taken
            FROM dedup_records
            WHERE scope = ?1 AND business_key = ?2
            "#,
        )
        .bind(scope)
        .bind(business_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Insert a fingerprint if absent.
    ///
    /// On conflict (hash or business key already indexed) the existing
    /// record's repeat counters are bumped and the originating job is
    /// returned unchanged — a collision always resolves to the first
    /// writer.
    #[tracing::instrument(skip(self), fields(scope = %scope))]
    pub async fn insert_if_absent(
        &self,
        scope: DedupScope,
        hash: &str,
        business_key: Option<&str>,
        job_id: &str,
    ) -> Result<InsertOutcome, DedupError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO dedup_records
                (hash, scope, business_key, originating_job_id, first_seen_at,
                 last_seen_at, duplicate_count, action_taken)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5, 0, 'skipped')
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(hash)
        .bind(scope)
        .bind(business_key)
        .bind(job_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            audit::record(
                &self.pool,
                AuditEvent::created("dedup_record", hash, scope.as_str()),
            )
            .await?;
            return Ok(InsertOutcome::Inserted);
        }

        // Lost the race or a genuine repeat: bump counters on whichever
        // record holds the hash or the business key.
        let originating_job_id = self
            .mark_repeat(scope, hash, business_key, now)
            .await?;
        Ok(InsertOutcome::AlreadyPresent { originating_job_id })
    }

    /// Bump repeat counters for content that is already indexed (by
    /// hash or by business key) and return the originating job.
    pub async fn record_repeat(
        &self,
        scope: DedupScope,
        hash: &str,
        business_key: Option<&str>,
    ) -> Result<String, DedupError> {
        self.mark_repeat(scope, hash, business_key, Utc::now()).await
    }

    /// Bump repeat counters for a hash that is already indexed and
    /// return the originating job.
    async fn mark_repeat(
        &self,
        scope: DedupScope,
        hash: &str,
        business_key: Option<&str>,
        now: chrono::DateTime<Utc>,
    ) -> Result<String, DedupError> {
        let originating: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE dedup_records
            SET duplicate_count = duplicate_count + 1, last_seen_at = ?1
            WHERE scope = ?2
              AND (hash = ?3 OR (business_key IS NOT NULL AND business_key = ?4))
            RETURNING originating_job_id
            "#,
        )
        .bind(now)
        .bind(scope)
        .bind(hash)
        .bind(business_key)
        .fetch_optional(&self.pool)
        .await?;

        // The record existed a moment ago; if it vanished the index was
        // tampered with out of band, which is worth surfacing loudly.
        originating.ok_or_else(|| {
            DedupError::Database(sqlx::Error::RowNotFound)
        })
    }
}
