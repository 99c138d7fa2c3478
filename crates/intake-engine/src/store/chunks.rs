//! Chunk store: persisted chunk descriptors tied to a job.
//!
//! Created once by the planner; afterwards mutated only by the worker
//! holding the chunk's queue lease. `(job_id, chunk_index)` is unique,
//! which is what makes replanning idempotent.

use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;

use crate::audit::{self, AuditEvent};
use crate::models::{ChunkStatus, UploadChunk};
use crate::store::jobs::ChunkCounts;

const CHUNK_COLUMNS: &str = r#"
    id, job_id, chunk_index, total_chunks, row_start, row_end, status,
    processed_rows, success_count, error_count, warning_count, skipped_count,
    created_at, processed_at
"#;

#[derive(Debug, Error)]
pub enum ChunkStoreError {
    #[error("Chunk not found: job {job_id}, index {chunk_index}")]
    NotFound { job_id: String, chunk_index: i64 },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Audit error: {0}")]
    Audit(#[from] audit::AuditError),
}

/// Descriptor for a chunk about to be planned.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    pub chunk_index: i64,
    pub row_start: i64,
    pub row_end: i64,
}

/// Handle over the upload_chunks collection.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    pool: SqlitePool,
}

impl ChunkStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a full chunk plan for a job in one transaction.
    pub async fn create_many(
        &self,
        job_id: &str,
        plans: &[ChunkPlan],
    ) -> Result<(), ChunkStoreError> {
        let total_chunks = plans.len() as i64;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for plan in plans {
            sqlx::query(
                r#"
                INSERT INTO upload_chunks
                    (job_id, chunk_index, total_chunks, row_start, row_end,
                     status, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)
                "#,
            )
            .bind(job_id)
            .bind(plan.chunk_index)
            .bind(total_chunks)
            .bind(plan.row_start)
            .bind(plan.row_end)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        audit::record(
            &self.pool,
            AuditEvent::created("chunk_plan", job_id, &total_chunks.to_string()),
        )
        .await?;
        Ok(())
    }

    /// All chunks of a job in index order.
    pub async fn for_job(&self, job_id: &str) -> Result<Vec<UploadChunk>, ChunkStoreError> {
        let query = format!(
            "SELECT {CHUNK_COLUMNS} FROM upload_chunks WHERE job_id = ?1 ORDER BY chunk_index ASC"
        );
        let chunks = sqlx::query_as::<_, UploadChunk>(&query)
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(chunks)
    }

    pub async fn get(
        &self,
        job_id: &str,
        chunk_index: i64,
    ) -> Result<UploadChunk, ChunkStoreError> {
        let query = format!(
            "SELECT {CHUNK_COLUMNS} FROM upload_chunks WHERE job_id = ?1 AND chunk_index = ?2"
        );
        sqlx::query_as::<_, UploadChunk>(&query)
            .bind(job_id)
            .bind(chunk_index)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ChunkStoreError::NotFound {
                job_id: job_id.to_string(),
                chunk_index,
            })
    }

    /// Mark a chunk as being processed under a lease. Idempotent across
    /// retry attempts of the same chunk; terminal chunks are left alone.
    pub async fn mark_processing(
        &self,
        job_id: &str,
        chunk_index: i64,
    ) -> Result<(), ChunkStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE upload_chunks
            SET status = 'processing'
            WHERE job_id = ?1 AND chunk_index = ?2 AND status = 'pending'
            "#,
        )
        .bind(job_id)
        .bind(chunk_index)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            audit::record(
                &self.pool,
                AuditEvent::transition(
                    "chunk",
                    &format!("{job_id}/{chunk_index}"),
                    "pending",
                    "processing",
                ),
            )
            .await?;
        }
        Ok(())
    }

    /// Record a chunk's terminal disposition and its row counts.
    #[tracing::instrument(skip(self, counts))]
    pub async fn record_outcome(
        &self,
        job_id: &str,
        chunk_index: i64,
        status: ChunkStatus,
        counts: ChunkCounts,
    ) -> Result<(), ChunkStoreError> {
        debug_assert!(status.is_terminal());
        let result = sqlx::query(
            r#"
            UPDATE upload_chunks
            SET status = ?3,
                processed_rows = ?4,
                success_count = ?5,
                error_count = ?6,
                warning_count = ?7,
                skipped_count = ?8,
                processed_at = ?9
            WHERE job_id = ?1 AND chunk_index = ?2
            "#,
        )
        .bind(job_id)
        .bind(chunk_index)
        .bind(status)
        .bind(counts.processed)
        .bind(counts.success)
        .bind(counts.error)
        .bind(counts.warning)
        .bind(counts.skipped)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ChunkStoreError::NotFound {
                job_id: job_id.to_string(),
                chunk_index,
            });
        }

        audit::record(
            &self.pool,
            AuditEvent::transition(
                "chunk",
                &format!("{job_id}/{chunk_index}"),
                "processing",
                status.as_str(),
            ),
        )
        .await?;
        Ok(())
    }

    /// Reset every failed chunk of a job back to `pending` for a
    /// whole-job resubmission, returning the reset chunks with the
    /// counts they previously contributed (so the caller can reverse
    /// them on the job).
    pub async fn reset_failed(&self, job_id: &str) -> Result<Vec<UploadChunk>, ChunkStoreError> {
        let query = format!(
            "SELECT {CHUNK_COLUMNS} FROM upload_chunks WHERE job_id = ?1 AND status = 'failed' ORDER BY chunk_index ASC"
        );
        let failed = sqlx::query_as::<_, UploadChunk>(&query)
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;

        if failed.is_empty() {
            return Ok(failed);
        }

        sqlx::query(
            r#"
            UPDATE upload_chunks
            SET status = 'pending',
                processed_rows = 0,
                success_count = 0,
                error_count = 0,
                warning_count = 0,
                skipped_count = 0,
                processed_at = NULL
            WHERE job_id = ?1 AND status = 'failed'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        for chunk in &failed {
            audit::record(
                &self.pool,
                AuditEvent::transition(
                    "chunk",
                    &format!("{job_id}/{}", chunk.chunk_index),
                    "failed",
                    "pending",
                ),
            )
            .await?;
        }
        Ok(failed)
    }
}
