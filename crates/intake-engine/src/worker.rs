//! Worker: claims queue entries and drives chunks to a terminal state.
//!
//! Workers are independent and stateless; any number may run against
//! the same database. All coordination happens through the queue's
//! leases and the job store's guarded transitions, so a worker that
//! dies mid-chunk simply stops renewing its lease and another worker
//! picks the entry up after expiry.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

use crate::models::{ChunkStatus, JobStatus, QueueEntry, QueueStatus, UploadChunk, UploadJob};
use crate::processor::{ChunkProcessor, ProcessError, RowProcessor, RowSource, SourceError};
use crate::queue::{QueueError, WorkQueue};
use crate::store::chunks::{ChunkStore, ChunkStoreError};
use crate::store::jobs::{JobStore, JobStoreError};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Jobs(#[from] JobStoreError),

    #[error(transparent)]
    Chunks(#[from] ChunkStoreError),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// One chunk-processing worker.
#[derive(Clone)]
pub struct Worker {
    id: String,
    queue: WorkQueue,
    jobs: JobStore,
    chunks: ChunkStore,
    processor: ChunkProcessor,
    source: Arc<dyn RowSource>,
    row_processor: Arc<dyn RowProcessor>,
    poll_interval: Duration,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        queue: WorkQueue,
        jobs: JobStore,
        chunks: ChunkStore,
        processor: ChunkProcessor,
        source: Arc<dyn RowSource>,
        row_processor: Arc<dyn RowProcessor>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            jobs,
            chunks,
            processor,
            source,
            row_processor,
            poll_interval,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Poll loop: claim, process, repeat until the shutdown signal.
    ///
    /// A processing error never kills the loop; it is logged and the
    /// entry is left to the queue's retry machinery.
    #[tracing::instrument(skip_all, fields(worker_id = %self.id))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let claimed = match self.queue.claim(&self.id).await {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::error!(error = %e, "claim failed");
                    None
                },
            };

            match claimed {
                Some(entry) => {
                    if let Err(e) = self.process_entry(&entry).await {
                        tracing::error!(
                            entry_id = entry.id,
                            job_id = %entry.job_id,
                            chunk_index = entry.chunk_index,
                            error = %e,
                            "entry processing failed"
                        );
                    }
                },
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {},
                        _ = shutdown.changed() => {},
                    }
                },
            }
        }
        tracing::info!("worker stopped");
    }

    /// Drive one claimed entry to a queue-terminal state.
    #[tracing::instrument(skip(self, entry), fields(worker_id = %self.id, entry_id = entry.id, job_id = %entry.job_id, chunk_index = entry.chunk_index))]
    pub async fn process_entry(&self, entry: &QueueEntry) -> Result<(), WorkerError> {
        let job = self.jobs.get(&entry.job_id).await?;

        // The job may have been cancelled between enqueue and claim;
        // the entry is then garbage to be swept.
        if job.status == JobStatus::Cancelled {
            self.queue.complete(&self.id, entry.id).await?;
            self.queue.remove(entry.id).await?;
            return Ok(());
        }

        // First chunk of the job to run moves it to processing; every
        // other worker loses this CAS and that is fine.
        if job.status == JobStatus::Queued {
            match self
                .jobs
                .transition(&job.id, JobStatus::Queued, JobStatus::Processing)
                .await
            {
                Ok(()) | Err(JobStoreError::InvalidTransition { .. }) => {},
                Err(e) => return Err(e.into()),
            }
        }

        let chunk = self.chunks.get(&entry.job_id, entry.chunk_index).await?;
        if chunk.status.is_terminal() {
            // Stale entry for an already-settled chunk (e.g. a lease
            // expired after the outcome was committed).
            match self.queue.complete(&self.id, entry.id).await {
                Ok(()) | Err(QueueError::LeaseLost { .. }) => {},
                Err(e) => return Err(e.into()),
            }
            self.queue.remove(entry.id).await?;
            return Ok(());
        }
        self.chunks
            .mark_processing(&entry.job_id, entry.chunk_index)
            .await?;

        let rows = match self
            .source
            .rows(&job.file_name, chunk.row_start, chunk.row_end)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                return self
                    .fail_attempt(entry, &job, &chunk, &e.to_string(), retryable(&e))
                    .await;
            },
        };

        // Renew the lease on a timer while the rows are in flight, so a
        // chunk whose work outlasts one lease period is not reclaimed
        // and re-run by another worker. A failed renewal means the
        // entry already has a new owner; everything in flight is
        // dropped on the spot.
        let outcome = {
            let process = self
                .processor
                .process(&chunk, &rows, self.row_processor.as_ref());
            tokio::pin!(process);
            let period = (self.queue.lease_duration() / 2).max(Duration::from_millis(10));
            let mut renew = tokio::time::interval(period);
            renew.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; consume it.
            renew.tick().await;
            loop {
                tokio::select! {
                    outcome = &mut process => break outcome,
                    _ = renew.tick() => {
                        if let Err(e) = self.queue.renew_lease(&self.id, entry.id).await {
                            return self.discard_on_lost_lease(entry, e);
                        }
                    },
                }
            }
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                // Infrastructure failure mid-chunk: rows already
                // committed to the dedup index stay committed and will
                // be skipped on the retry attempt.
                return self
                    .fail_attempt(entry, &job, &chunk, &e.to_string(), true)
                    .await;
            },
        };

        // Commit point. Confirm the lease is still ours before writing
        // the outcome; if it was reclaimed, discard everything.
        if let Err(e) = self.queue.renew_lease(&self.id, entry.id).await {
            return self.discard_on_lost_lease(entry, e);
        }

        match outcome.status {
            ChunkStatus::Completed => {
                self.queue.complete(&self.id, entry.id).await?;
                self.settle_chunk(&job, &chunk, ChunkStatus::Completed, outcome.counts)
                    .await?;
            },
            // Critical abort: not retryable, the chunk dies with its
            // unvisited rows accounted as errors.
            _ => {
                self.queue
                    .fail(&self.id, entry.id, "critical row error", false)
                    .await?;
                self.settle_chunk(
                    &job,
                    &chunk,
                    ChunkStatus::Failed,
                    outcome.terminal_counts(chunk.row_count()),
                )
                .await?;
            },
        }

        self.queue.remove(entry.id).await?;
        Ok(())
    }

    /// Record a failed attempt. When the queue declares the entry dead
    /// the chunk is settled as failed with every row charged as an
    /// error; otherwise the retry machinery owns the next attempt.
    async fn fail_attempt(
        &self,
        entry: &QueueEntry,
        job: &UploadJob,
        chunk: &UploadChunk,
        error: &str,
        retryable: bool,
    ) -> Result<(), WorkerError> {
        let status = match self.queue.fail(&self.id, entry.id, error, retryable).await {
            Ok(status) => status,
            Err(e) => return self.discard_on_lost_lease(entry, e),
        };

        if status == QueueStatus::Dead {
            let counts = crate::store::jobs::ChunkCounts {
                processed: chunk.row_count(),
                error: chunk.row_count(),
                ..Default::default()
            };
            self.settle_chunk(job, chunk, ChunkStatus::Failed, counts).await?;
            self.queue.remove(entry.id).await?;
        }
        Ok(())
    }

    /// Commit a chunk's terminal disposition: outcome row, job
    /// counters, successor scheduling for ordered strategies, and the
    /// finalization check.
    async fn settle_chunk(
        &self,
        job: &UploadJob,
        chunk: &UploadChunk,
        status: ChunkStatus,
        counts: crate::store::jobs::ChunkCounts,
    ) -> Result<(), WorkerError> {
        self.chunks
            .record_outcome(&job.id, chunk.chunk_index, status, counts)
            .await?;
        self.jobs.apply_chunk_counts(&job.id, counts).await?;

        // Ordered strategies release chunk N+1 only once chunk N is
        // terminal (failed counts too, or a dead chunk would wedge the
        // rest of the job). Resubmitted jobs may already have enqueued
        // or settled the successor, hence the guards.
        let next_index = chunk.chunk_index + 1;
        if job.strategy.is_ordered() && next_index < chunk.total_chunks {
            let successor = self.chunks.get(&job.id, next_index).await?;
            if successor.status == ChunkStatus::Pending
                && self.queue.entry_for_chunk(&job.id, next_index).await?.is_none()
            {
                self.queue.enqueue(&job.id, next_index, job.priority).await?;
            }
        }

        if let Some(final_status) = self.jobs.finalize_if_done(&job.id).await? {
            tracing::info!(job_id = %job.id, status = %final_status, "job reached terminal status");
        }
        Ok(())
    }

    /// A lost lease means another worker owns the entry now; our
    /// results are discarded (already-committed dedup rows make the
    /// overlap harmless).
    fn discard_on_lost_lease(&self, entry: &QueueEntry, e: QueueError) -> Result<(), WorkerError> {
        match e {
            QueueError::LeaseLost { .. } | QueueError::NotFound(_) => {
                tracing::warn!(
                    entry_id = entry.id,
                    job_id = %entry.job_id,
                    "lease lost, discarding chunk results"
                );
                Ok(())
            },
            other => Err(other.into()),
        }
    }
}

/// Whether a source error is worth another attempt. A missing file
/// will not reappear; IO and parse hiccups might.
fn retryable(e: &SourceError) -> bool {
    !matches!(e, SourceError::NotFound(_))
}
