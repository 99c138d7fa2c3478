//! Engine facade: the single entry point callers interact with.
//!
//! Wires the stores, queue, planner, and dedup index over one pool and
//! exposes the job lifecycle operations: submit, status, cancel,
//! resubmit, plus read access to the error ledger and audit trail.
//! Workers are constructed from the same wiring via [`Engine::worker`].

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;

use sqlx::SqlitePool;

use crate::audit::{self, AuditError};
use crate::config::EngineConfig;
use crate::db;
use crate::dedup::{DedupError, DedupIndex};
use crate::ledger::{ErrorLedger, LedgerError};
use crate::models::{
    AuditEntry, DedupRecord, DedupScope, JobSnapshot, JobStatus, ProcessingErrorRecord,
    UploadStrategy,
};
use crate::planner::{self, PlanError};
use crate::processor::{ChunkProcessor, RowProcessor, RowSource, SourceError};
use crate::queue::{QueueError, WorkQueue};
use crate::retry::RetryPolicy;
use crate::store::chunks::{ChunkStore, ChunkStoreError};
use crate::store::jobs::{JobStore, JobStoreError, NewJob};
use crate::worker::Worker;

/// Request to ingest one uploaded file.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub file_name: String,
    pub file_size_bytes: i64,
    pub strategy: UploadStrategy,
    pub priority: i64,
    /// Whole-job resubmission budget (not per-chunk attempts).
    pub max_retries: i64,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Duplicate file: hash {file_hash} already belongs to a live job")]
    DuplicateFile { file_hash: String },

    #[error("File has no rows to ingest: {0}")]
    EmptyFile(String),

    #[error("File unreadable: {0}")]
    Unreadable(#[from] SourceError),

    #[error(transparent)]
    Jobs(JobStoreError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Dedup(#[from] DedupError),
}

impl From<JobStoreError> for SubmitError {
    fn from(e: JobStoreError) -> Self {
        match e {
            JobStoreError::DuplicateFile { file_hash } => Self::DuplicateFile { file_hash },
            other => Self::Jobs(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Job {job_id} is already terminal ({status})")]
    AlreadyTerminal { job_id: String, status: JobStatus },

    #[error("Job {job_id} in status {status} cannot be resubmitted")]
    NotResubmittable { job_id: String, status: JobStatus },

    #[error("Job {job_id} has no planned chunks to resubmit")]
    NothingToResubmit { job_id: String },

    #[error("Job {job_id} exhausted its retry budget ({retry_count}/{max_retries})")]
    RetryBudgetExhausted {
        job_id: String,
        retry_count: i64,
        max_retries: i64,
    },

    #[error(transparent)]
    Jobs(#[from] JobStoreError),

    #[error(transparent)]
    Chunks(#[from] ChunkStoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Dedup(#[from] DedupError),

    #[error(transparent)]
    Audit(#[from] AuditError),
}

/// The wired-up engine.
#[derive(Clone)]
pub struct Engine {
    config: EngineConfig,
    pool: SqlitePool,
    jobs: JobStore,
    chunks: ChunkStore,
    queue: WorkQueue,
    dedup: DedupIndex,
    ledger: ErrorLedger,
    source: Arc<dyn RowSource>,
}

impl Engine {
    /// Wire an engine over an existing pool.
    pub fn new(config: EngineConfig, pool: SqlitePool, source: Arc<dyn RowSource>) -> Self {
        let policy = RetryPolicy::new(
            config.backoff_base,
            config.backoff_cap,
            config.max_chunk_attempts,
        );
        let queue = WorkQueue::new(
            pool.clone(),
            config.queue_name.clone(),
            config.lease_duration,
            policy,
        );
        Self {
            jobs: JobStore::new(pool.clone()),
            chunks: ChunkStore::new(pool.clone()),
            dedup: DedupIndex::new(pool.clone()),
            ledger: ErrorLedger::new(pool.clone()),
            queue,
            config,
            pool,
            source,
        }
    }

    /// Connect to the configured database, apply the schema, and wire
    /// an engine over the resulting pool.
    pub async fn connect(
        config: EngineConfig,
        source: Arc<dyn RowSource>,
    ) -> Result<Self, sqlx::Error> {
        let pool = db::connect(&config).await?;
        Ok(Self::new(config, pool, source))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The underlying work queue (operational tooling: depth checks,
    /// terminal sweeps).
    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Build a worker sharing this engine's wiring. The caller owns the
    /// returned worker's lifecycle (`Worker::run` with a shutdown
    /// channel, or driving entries directly).
    pub fn worker(&self, id: impl Into<String>, row_processor: Arc<dyn RowProcessor>) -> Worker {
        Worker::new(
            id,
            self.queue.clone(),
            self.jobs.clone(),
            self.chunks.clone(),
            ChunkProcessor::new(self.dedup.clone(), self.ledger.clone()),
            Arc::clone(&self.source),
            row_processor,
            self.config.poll_interval,
        )
    }

    /// Submit an uploaded file for ingestion.
    ///
    /// Hashes the file, creates the job, validates (row count, file
    /// dedup record), plans chunks, and leaves the job in `queued` with
    /// its work enqueued. Returns the new job id.
    ///
    /// A file whose hash matches a live job is rejected with
    /// [`SubmitError::DuplicateFile`] before any state is created. An
    /// empty or unreadable file creates the job, then fails it during
    /// validation, so the failure is visible in the job record.
    #[tracing::instrument(skip(self, request), fields(file = %request.file_name, strategy = %request.strategy))]
    pub async fn submit(&self, request: SubmitRequest) -> Result<String, SubmitError> {
        let file_hash = self.source.file_hash(&request.file_name).await?;

        let retention = chrono::Duration::from_std(self.config.job_retention)
            .unwrap_or_else(|_| chrono::Duration::days(30));
        let job = self
            .jobs
            .create_job(NewJob {
                file_name: request.file_name.clone(),
                file_size_bytes: request.file_size_bytes,
                file_hash: file_hash.as_str().to_string(),
                strategy: request.strategy,
                priority: request.priority,
                max_retries: request.max_retries,
                expires_at: Some(Utc::now() + retention),
            })
            .await?;

        // File-scope fingerprint. The live-hash index on jobs already
        // rejected live duplicates; this records long-term history that
        // survives the job itself.
        self.dedup
            .insert_if_absent(DedupScope::File, file_hash.as_str(), None, &job.id)
            .await?;

        self.jobs
            .transition(&job.id, JobStatus::Pending, JobStatus::Validating)
            .await?;

        let total_rows = match self.source.count_rows(&request.file_name).await {
            Ok(n) => n,
            Err(e) => {
                self.fail_validation(&job.id, &e.to_string()).await?;
                return Err(SubmitError::Unreadable(e));
            },
        };
        if total_rows == 0 {
            self.fail_validation(&job.id, "file has no rows").await?;
            return Err(SubmitError::EmptyFile(request.file_name));
        }
        self.jobs.set_total_rows(&job.id, total_rows).await?;

        planner::plan(&self.config, &self.chunks, &self.queue, &job, total_rows).await?;
        self.jobs
            .transition(&job.id, JobStatus::Validating, JobStatus::Queued)
            .await?;

        tracing::info!(job_id = %job.id, total_rows, "job submitted");
        Ok(job.id)
    }

    /// Point-in-time view of a job.
    pub async fn status(&self, job_id: &str) -> Result<JobSnapshot, EngineError> {
        Ok(self.jobs.snapshot(job_id).await?)
    }

    /// Cooperatively cancel a job.
    ///
    /// Marks the job cancelled; the queue stops offering its entries,
    /// in-flight chunks finish under their current lease. Terminal jobs
    /// cannot be cancelled.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, job_id: &str) -> Result<JobSnapshot, EngineError> {
        // CAS loop: the job may transition underneath us (e.g. a worker
        // finalizing), so re-read and retry on a stale status.
        for _ in 0..4 {
            let job = self.jobs.get(job_id).await?;
            if job.status.is_terminal() {
                return Err(EngineError::AlreadyTerminal {
                    job_id: job_id.to_string(),
                    status: job.status,
                });
            }
            match self
                .jobs
                .transition(job_id, job.status, JobStatus::Cancelled)
                .await
            {
                Ok(()) => return Ok(self.jobs.snapshot(job_id).await?),
                Err(JobStoreError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let status = self.jobs.get(job_id).await?.status;
        Err(EngineError::AlreadyTerminal {
            job_id: job_id.to_string(),
            status,
        })
    }

    /// Resubmit a failed or partially completed job.
    ///
    /// Consumes one unit of the job's retry budget, resets its failed
    /// chunks to `pending`, reverses the counts those chunks had
    /// contributed, enqueues fresh entries, and moves the job back to
    /// `queued`. Rows that previously succeeded are protected by the
    /// dedup index and come back as `skipped`.
    #[tracing::instrument(skip(self))]
    pub async fn resubmit(&self, job_id: &str) -> Result<JobSnapshot, EngineError> {
        let job = self.jobs.get(job_id).await?;
        if !matches!(job.status, JobStatus::Failed | JobStatus::PartiallyCompleted) {
            return Err(EngineError::NotResubmittable {
                job_id: job_id.to_string(),
                status: job.status,
            });
        }
        if job.retry_count >= job.max_retries {
            return Err(EngineError::RetryBudgetExhausted {
                job_id: job_id.to_string(),
                retry_count: job.retry_count,
                max_retries: job.max_retries,
            });
        }

        // A job that failed validation never got a plan; with no chunks
        // to reset a resubmission would park it in `queued` with no
        // work enqueued. The corrected file must come back via submit.
        if self.chunks.for_job(job_id).await?.is_empty() {
            return Err(EngineError::NothingToResubmit {
                job_id: job_id.to_string(),
            });
        }

        // Claim the transition first; of two racing resubmits exactly
        // one proceeds past this point.
        self.jobs.transition(job_id, job.status, JobStatus::Queued).await?;
        self.jobs.increment_retry_count(job_id).await?;

        let reset = self.chunks.reset_failed(job_id).await?;
        for chunk in &reset {
            let prior = crate::store::jobs::ChunkCounts {
                processed: chunk.processed_rows,
                success: chunk.success_count,
                error: chunk.error_count,
                warning: chunk.warning_count,
                skipped: chunk.skipped_count,
            };
            self.jobs.apply_chunk_counts(job_id, prior.negated()).await?;
            self.queue.remove_for_chunk(job_id, chunk.chunk_index).await?;
            self.queue.enqueue(job_id, chunk.chunk_index, job.priority).await?;
        }

        tracing::info!(
            job_id,
            chunks = reset.len(),
            retry = job.retry_count + 1,
            "job resubmitted"
        );
        Ok(self.jobs.snapshot(job_id).await?)
    }

    /// Row-level failures recorded for a job.
    pub async fn errors(&self, job_id: &str) -> Result<Vec<ProcessingErrorRecord>, EngineError> {
        Ok(self.ledger.for_job(job_id).await?)
    }

    /// The error ledger, for review tooling (`resolve` lives there).
    pub fn ledger(&self) -> &ErrorLedger {
        &self.ledger
    }

    /// Look up a dedup record by content fingerprint.
    pub async fn dedup_record(
        &self,
        scope: DedupScope,
        hash: &str,
    ) -> Result<Option<DedupRecord>, EngineError> {
        Ok(self.dedup.lookup(scope, hash).await?)
    }

    /// Full audit trail of one job.
    pub async fn audit_trail(&self, job_id: &str) -> Result<Vec<AuditEntry>, EngineError> {
        Ok(audit::entries_for(&self.pool, "job", job_id).await?)
    }

    /// Sweep terminal queue entries. Returns the number removed.
    pub async fn remove_done(&self) -> Result<u64, EngineError> {
        Ok(self.queue.sweep_terminal().await?)
    }

    /// Delete terminal job records whose retention deadline has passed.
    pub async fn purge_expired_jobs(&self) -> Result<u64, EngineError> {
        Ok(self.jobs.sweep_expired().await?)
    }

    /// Drop audit partitions strictly older than `YYYY-MM`.
    pub async fn purge_audit_before(&self, partition: &str) -> Result<u64, EngineError> {
        Ok(audit::purge_partitions_before(&self.pool, partition).await?)
    }

    async fn fail_validation(&self, job_id: &str, reason: &str) -> Result<(), JobStoreError> {
        self.jobs.record_job_error(job_id, reason).await?;
        self.jobs
            .transition(job_id, JobStatus::Validating, JobStatus::Failed)
            .await?;
        tracing::warn!(job_id, reason, "validation failed");
        Ok(())
    }
}
