//! Job store: the durable record of every upload job.
//!
//! Jobs move through the status state machine only via `transition`, a
//! guarded compare-and-swap, so concurrent chunk completions racing to
//! finalize a job cannot lose updates. Counters are applied as atomic
//! increments, never read-modify-write, so correctness holds across
//! process restarts and multiple worker instances.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use crate::audit::{self, AuditEvent};
use crate::models::{JobSnapshot, JobStatus, UploadJob, UploadStrategy};

const JOB_COLUMNS: &str = r#"
    id, file_name, file_size_bytes, file_hash, strategy, priority, status,
    total_rows, processed_rows, success_count, error_count, warning_count,
    skipped_count, retry_count, max_retries, last_error, created_at,
    started_at, completed_at, expires_at
"#;

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Duplicate file: hash {file_hash} already belongs to a live job")]
    DuplicateFile { file_hash: String },

    #[error("Transition {from} -> {to} is not permitted")]
    IllegalTransition { from: JobStatus, to: JobStatus },

    #[error("Job {job_id}: expected status {expected}, found {actual}")]
    InvalidTransition {
        job_id: String,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Audit error: {0}")]
    Audit(#[from] audit::AuditError),
}

/// Metadata for a job about to be created.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub file_name: String,
    pub file_size_bytes: i64,
    pub file_hash: String,
    pub strategy: UploadStrategy,
    pub priority: i64,
    pub max_retries: i64,
    /// Retention deadline for the job record; `None` keeps it until an
    /// operator removes it explicitly.
    pub expires_at: Option<DateTime<Utc>>,
}

/// One chunk's contribution to the job counters. Applied exactly once,
/// when the chunk reaches a terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkCounts {
    pub processed: i64,
    pub success: i64,
    pub error: i64,
    pub warning: i64,
    pub skipped: i64,
}

impl ChunkCounts {
    /// Counter conservation: every accounted row is exactly one of
    /// success, error, warning, or skipped.
    pub fn is_conserved(&self) -> bool {
        self.success + self.error + self.warning + self.skipped == self.processed
    }

    pub fn negated(&self) -> Self {
        Self {
            processed: -self.processed,
            success: -self.success,
            error: -self.error,
            warning: -self.warning,
            skipped: -self.skipped,
        }
    }
}

/// Handle over the upload_jobs collection.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a job in `pending`.
    ///
    /// Fails with `DuplicateFile` when the file hash already belongs to
    /// a non-cancelled, non-failed job; the partial unique index on
    /// live file hashes makes this race-proof, the pre-check only
    /// exists to give the common case a cheap path.
    #[tracing::instrument(skip(self, new_job), fields(file = %new_job.file_name))]
    pub async fn create_job(&self, new_job: NewJob) -> Result<UploadJob, JobStoreError> {
        let live: Option<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM upload_jobs
            WHERE file_hash = ?1 AND status NOT IN ('cancelled', 'failed')
            LIMIT 1
            "#,
        )
        .bind(&new_job.file_hash)
        .fetch_optional(&self.pool)
        .await?;
        if live.is_some() {
            return Err(JobStoreError::DuplicateFile {
                file_hash: new_job.file_hash,
            });
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO upload_jobs
                (id, file_name, file_size_bytes, file_hash, strategy, priority,
                 status, max_retries, created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8, ?9)
            "#,
        )
        .bind(&id)
        .bind(&new_job.file_name)
        .bind(new_job.file_size_bytes)
        .bind(&new_job.file_hash)
        .bind(new_job.strategy)
        .bind(new_job.priority)
        .bind(new_job.max_retries)
        .bind(now)
        .bind(new_job.expires_at)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            if let sqlx::Error::Database(ref db_err) = e {
                if db_err.is_unique_violation() {
                    return Err(JobStoreError::DuplicateFile {
                        file_hash: new_job.file_hash,
                    });
                }
            }
            return Err(JobStoreError::Database(e));
        }

        audit::record(&self.pool, AuditEvent::created("job", &id, "pending")).await?;
        tracing::info!(job_id = %id, "job created");
        self.get(&id).await
    }

    pub async fn get(&self, job_id: &str) -> Result<UploadJob, JobStoreError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM upload_jobs WHERE id = ?1");
        sqlx::query_as::<_, UploadJob>(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))
    }

    /// Point-in-time view for the ingestion boundary.
    pub async fn snapshot(&self, job_id: &str) -> Result<JobSnapshot, JobStoreError> {
        Ok(self.get(job_id).await?.into())
    }

    /// Guarded compare-and-swap on job status.
    ///
    /// Fails with `InvalidTransition` when the persisted status no
    /// longer matches `from`: of two racing callers exactly one
    /// succeeds. Stamps `started_at` on entry to `processing` and
    /// `completed_at` on entry to a terminal state, and emits one audit
    /// entry per successful transition.
    #[tracing::instrument(skip(self))]
    pub async fn transition(
        &self,
        job_id: &str,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<(), JobStoreError> {
        if !from.can_transition_to(to) {
            return Err(JobStoreError::IllegalTransition { from, to });
        }

        let now = Utc::now();
        let started_stamp = (to == JobStatus::Processing).then_some(now);
        let completed_stamp = to.is_terminal().then_some(now);

        let result = sqlx::query(
            r#"
            UPDATE upload_jobs
            SET status = ?3,
                started_at = COALESCE(started_at, ?4),
                completed_at = COALESCE(completed_at, ?5)
            WHERE id = ?1 AND status = ?2
            "#,
        )
        .bind(job_id)
        .bind(from)
        .bind(to)
        .bind(started_stamp)
        .bind(completed_stamp)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let actual = self.get(job_id).await?.status;
            return Err(JobStoreError::InvalidTransition {
                job_id: job_id.to_string(),
                expected: from,
                actual,
            });
        }

        audit::record(
            &self.pool,
            AuditEvent::transition("job", job_id, from.as_str(), to.as_str()),
        )
        .await?;
        tracing::debug!(job_id, %from, %to, "job transitioned");
        Ok(())
    }

    /// Apply one chunk's counts as atomic increments.
    pub async fn apply_chunk_counts(
        &self,
        job_id: &str,
        counts: ChunkCounts,
    ) -> Result<(), JobStoreError> {
        debug_assert!(counts.is_conserved());
        let result = sqlx::query(
            r#"
            UPDATE upload_jobs
            SET processed_rows = processed_rows + ?2,
                success_count  = success_count + ?3,
                error_count    = error_count + ?4,
                warning_count  = warning_count + ?5,
                skipped_count  = skipped_count + ?6
            WHERE id = ?1
            "#,
        )
        .bind(job_id)
        .bind(counts.processed)
        .bind(counts.success)
        .bind(counts.error)
        .bind(counts.warning)
        .bind(counts.skipped)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    /// Record the total row count discovered during validation.
    pub async fn set_total_rows(&self, job_id: &str, total_rows: i64) -> Result<(), JobStoreError> {
        let result = sqlx::query("UPDATE upload_jobs SET total_rows = ?2 WHERE id = ?1")
            .bind(job_id)
            .bind(total_rows)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    /// Record a job-wide failure reason for operator visibility.
    pub async fn record_job_error(&self, job_id: &str, message: &str) -> Result<(), JobStoreError> {
        sqlx::query("UPDATE upload_jobs SET last_error = ?2 WHERE id = ?1")
            .bind(job_id)
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Consume one unit of the whole-job retry budget.
    pub async fn increment_retry_count(&self, job_id: &str) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            "UPDATE upload_jobs SET retry_count = retry_count + 1 WHERE id = ?1",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    /// Resolve the job's terminal status once every chunk is terminal.
    ///
    /// Returns the status it settled on, or `None` when chunks are
    /// still outstanding or another worker (or a cancellation) got
    /// there first. Safe to call from every worker after every chunk —
    /// the transition CAS makes the finalization race harmless.
    #[tracing::instrument(skip(self))]
    pub async fn finalize_if_done(
        &self,
        job_id: &str,
    ) -> Result<Option<JobStatus>, JobStoreError> {
        let (total, completed, failed): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
            FROM upload_chunks
            WHERE job_id = ?1
            "#,
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;

        if total == 0 || completed + failed < total {
            return Ok(None);
        }

        let target = if failed == 0 {
            JobStatus::Completed
        } else if completed == 0 {
            JobStatus::Failed
        } else {
            JobStatus::PartiallyCompleted
        };

        match self.transition(job_id, JobStatus::Processing, target).await {
            Ok(()) => {
                tracing::info!(job_id, status = %target, "job finalized");
                Ok(Some(target))
            },
            // Someone else finalized or cancelled first.
            Err(JobStoreError::InvalidTransition { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete terminal jobs whose retention deadline has passed, along
    /// with their chunks, queue entries, and error records. Dedup
    /// records are untouched; content history survives the job.
    /// Returns the number of jobs removed.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_expired(&self) -> Result<u64, JobStoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let expired: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM upload_jobs
            WHERE expires_at IS NOT NULL AND expires_at <= ?1
              AND status IN ('completed', 'failed', 'partially_completed', 'cancelled')
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        for job_id in &expired {
            sqlx::query("DELETE FROM queue_entries WHERE job_id = ?1")
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM processing_errors WHERE job_id = ?1")
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM upload_chunks WHERE job_id = ?1")
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM upload_jobs WHERE id = ?1")
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        if !expired.is_empty() {
            tracing::info!(swept = expired.len(), "expired job records removed");
        }
        Ok(expired.len() as u64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::db::test_support::test_pool;

    fn new_job(hash: &str) -> NewJob {
        NewJob {
            file_name: "invoices.csv".to_string(),
            file_size_bytes: 1024,
            file_hash: hash.to_string(),
            strategy: UploadStrategy::Parallel,
            priority: 0,
            max_retries: 2,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (pool, _dir) = test_pool().await;
        let store = JobStore::new(pool);

        let job = store.create_job(new_job("h1")).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.file_hash, "h1");
        assert_eq!(job.max_retries, 2);
        assert!(job.started_at.is_none());

        let fetched = store.get(&job.id).await.unwrap();
        assert_eq!(fetched.id, job.id);
    }

    #[tokio::test]
    async fn test_duplicate_file_rejected_while_live() {
        let (pool, _dir) = test_pool().await;
        let store = JobStore::new(pool);

        store.create_job(new_job("h1")).await.unwrap();
        assert!(matches!(
            store.create_job(new_job("h1")).await,
            Err(JobStoreError::DuplicateFile { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_file_allowed_after_cancellation() {
        let (pool, _dir) = test_pool().await;
        let store = JobStore::new(pool);

        let job = store.create_job(new_job("h1")).await.unwrap();
        store
            .transition(&job.id, JobStatus::Pending, JobStatus::Cancelled)
            .await
            .unwrap();

        // A cancelled job no longer blocks resubmission of the file.
        store.create_job(new_job("h1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_transition_stamps_timestamps() {
        let (pool, _dir) = test_pool().await;
        let store = JobStore::new(pool);

        let job = store.create_job(new_job("h1")).await.unwrap();
        store
            .transition(&job.id, JobStatus::Pending, JobStatus::Validating)
            .await
            .unwrap();
        store
            .transition(&job.id, JobStatus::Validating, JobStatus::Queued)
            .await
            .unwrap();
        store
            .transition(&job.id, JobStatus::Queued, JobStatus::Processing)
            .await
            .unwrap();

        let running = store.get(&job.id).await.unwrap();
        let started = running.started_at.unwrap();
        assert!(started >= running.created_at);
        assert!(running.completed_at.is_none());

        store
            .transition(&job.id, JobStatus::Processing, JobStatus::Completed)
            .await
            .unwrap();
        let done = store.get(&job.id).await.unwrap();
        assert!(done.completed_at.unwrap() >= started);
    }

    #[tokio::test]
    async fn test_transition_rejects_illegal_pair() {
        let (pool, _dir) = test_pool().await;
        let store = JobStore::new(pool);

        let job = store.create_job(new_job("h1")).await.unwrap();
        assert!(matches!(
            store
                .transition(&job.id, JobStatus::Pending, JobStatus::Completed)
                .await,
            Err(JobStoreError::IllegalTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_transition_cas_detects_stale_from() {
        let (pool, _dir) = test_pool().await;
        let store = JobStore::new(pool);

        let job = store.create_job(new_job("h1")).await.unwrap();
        store
            .transition(&job.id, JobStatus::Pending, JobStatus::Validating)
            .await
            .unwrap();

        let err = store
            .transition(&job.id, JobStatus::Pending, JobStatus::Validating)
            .await
            .unwrap_err();
        match err {
            JobStoreError::InvalidTransition { expected, actual, .. } => {
                assert_eq!(expected, JobStatus::Pending);
                assert_eq!(actual, JobStatus::Validating);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_transitions_single_winner() {
        let (pool, _dir) = test_pool().await;
        let store = JobStore::new(pool);

        let job = store.create_job(new_job("h1")).await.unwrap();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let job_id = job.id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .transition(&job_id, JobStatus::Pending, JobStatus::Validating)
                    .await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_counters_accumulate_atomically() {
        let (pool, _dir) = test_pool().await;
        let store = JobStore::new(pool);

        let job = store.create_job(new_job("h1")).await.unwrap();
        let counts = ChunkCounts {
            processed: 100,
            success: 90,
            error: 4,
            warning: 5,
            skipped: 1,
        };
        assert!(counts.is_conserved());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            let job_id = job.id.clone();
            handles.push(tokio::spawn(async move {
                store.apply_chunk_counts(&job_id, counts).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let job = store.get(&job.id).await.unwrap();
        assert_eq!(job.processed_rows, 400);
        assert_eq!(job.success_count, 360);
        assert_eq!(job.error_count, 16);
        assert_eq!(job.warning_count, 20);
        assert_eq!(job.skipped_count, 4);
        assert_eq!(
            job.success_count + job.error_count + job.warning_count + job.skipped_count,
            job.processed_rows
        );
    }

    #[tokio::test]
    async fn test_sweep_expired_removes_only_terminal_expired_jobs() {
        let (pool, _dir) = test_pool().await;
        let store = JobStore::new(pool.clone());

        let mut job = new_job("h1");
        job.expires_at = Some(Utc::now() - chrono::Duration::hours(1));
        let expired = store.create_job(job).await.unwrap();
        store
            .transition(&expired.id, JobStatus::Pending, JobStatus::Cancelled)
            .await
            .unwrap();

        let mut job = new_job("h2");
        job.expires_at = Some(Utc::now() + chrono::Duration::hours(1));
        let fresh = store.create_job(job).await.unwrap();
        store
            .transition(&fresh.id, JobStatus::Pending, JobStatus::Cancelled)
            .await
            .unwrap();

        // Past its deadline but not terminal: must survive the sweep.
        let mut job = new_job("h3");
        job.expires_at = Some(Utc::now() - chrono::Duration::hours(1));
        let live = store.create_job(job).await.unwrap();

        assert_eq!(store.sweep_expired().await.unwrap(), 1);
        assert!(matches!(
            store.get(&expired.id).await,
            Err(JobStoreError::NotFound(_))
        ));
        store.get(&fresh.id).await.unwrap();
        store.get(&live.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_audit_entry_per_transition() {
        let (pool, _dir) = test_pool().await;
        let store = JobStore::new(pool.clone());

        let job = store.create_job(new_job("h1")).await.unwrap();
        store
            .transition(&job.id, JobStatus::Pending, JobStatus::Validating)
            .await
            .unwrap();
        store
            .transition(&job.id, JobStatus::Validating, JobStatus::Failed)
            .await
            .unwrap();

        let entries = crate::audit::entries_for(&pool, "job", &job.id).await.unwrap();
        // One creation entry plus exactly one entry per transition.
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].event_type, "created");
        assert_eq!(entries[2].before_state.as_deref(), Some("validating"));
        assert_eq!(entries[2].after_state.as_deref(), Some("failed"));
    }
}
