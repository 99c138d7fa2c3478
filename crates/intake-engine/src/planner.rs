//! Chunk planner: splits a validated file into fixed-size chunks and
//! enqueues them.
//!
//! Planning is deterministic and idempotent: chunk rows already
//! persisted for the job short-circuit to the existing plan, so calling
//! `plan` twice produces the same chunk set, never a duplicate one.

use thiserror::Error;

use crate::config::EngineConfig;
use crate::models::{UploadChunk, UploadJob};
use crate::queue::{QueueError, WorkQueue};
use crate::store::chunks::{ChunkPlan, ChunkStore, ChunkStoreError};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("File has no rows to ingest")]
    EmptyFile,

    #[error(transparent)]
    Chunks(#[from] ChunkStoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Split `total_rows` into `[start, end)` ranges of at most
/// `chunk_size` rows.
fn split(total_rows: i64, chunk_size: i64) -> Vec<ChunkPlan> {
    let mut plans = Vec::new();
    let mut start = 0;
    let mut index = 0;
    while start < total_rows {
        let end = (start + chunk_size).min(total_rows);
        plans.push(ChunkPlan {
            chunk_index: index,
            row_start: start,
            row_end: end,
        });
        start = end;
        index += 1;
    }
    plans
}

/// Plan a job's chunks and enqueue their work.
///
/// Chunk size follows the job's strategy (small for stream/sequential,
/// large for parallel/batch). Ordered strategies enqueue only chunk 0;
/// the worker enqueues each successor when its predecessor reaches a
/// terminal state, which is what enforces cross-chunk ordering.
#[tracing::instrument(skip(config, chunks, queue, job), fields(job_id = %job.id))]
pub async fn plan(
    config: &EngineConfig,
    chunks: &ChunkStore,
    queue: &WorkQueue,
    job: &UploadJob,
    total_rows: i64,
) -> Result<Vec<UploadChunk>, PlanError> {
    if total_rows == 0 {
        return Err(PlanError::EmptyFile);
    }

    let existing = chunks.for_job(&job.id).await?;
    if !existing.is_empty() {
        tracing::debug!(job_id = %job.id, count = existing.len(), "job already planned");
        return Ok(existing);
    }

    let chunk_size = config.chunk_size_for(job.strategy);
    let plans = split(total_rows, chunk_size);
    chunks.create_many(&job.id, &plans).await?;

    if job.strategy.is_ordered() {
        queue.enqueue(&job.id, 0, job.priority).await?;
    } else {
        for plan in &plans {
            queue.enqueue(&job.id, plan.chunk_index, job.priority).await?;
        }
    }

    let planned = chunks.for_job(&job.id).await?;
    tracing::info!(
        job_id = %job.id,
        total_rows,
        chunk_size,
        chunk_count = planned.len(),
        strategy = %job.strategy,
        "job planned"
    );
    Ok(planned)
}
