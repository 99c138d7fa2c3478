//! Domain models for the upload pipeline.
//!
//! These mirror the six durable collections: jobs, chunks, queue
//! entries, deduplication records, processing errors, and audit
//! entries. Rows are owned by their stores and mutated only through the
//! stores' defined transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Enumerations
// ============================================================================

/// How a job's rows are chunked and scheduled.
///
/// `Stream` and `Sequential` process small chunks in index order (chunk
/// N+1 is only enqueued once chunk N is terminal). `Parallel` and
/// `Batch` use larger chunks with no cross-chunk ordering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UploadStrategy {
    Stream,
    Batch,
    Parallel,
    Sequential,
}

impl UploadStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Batch => "batch",
            Self::Parallel => "parallel",
            Self::Sequential => "sequential",
        }
    }

    /// Whether chunks of this strategy must run strictly in index order.
    pub fn is_ordered(&self) -> bool {
        matches!(self, Self::Stream | Self::Sequential)
    }
}

impl std::fmt::Display for UploadStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for UploadStrategy {
    type Err = intake_common::IntakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stream" => Ok(Self::Stream),
            "batch" => Ok(Self::Batch),
            "parallel" => Ok(Self::Parallel),
            "sequential" => Ok(Self::Sequential),
            other => Err(intake_common::IntakeError::InvalidStrategy(other.to_string())),
        }
    }
}

/// Job status state machine.
///
/// `pending → validating → queued → processing → {completed | failed |
/// partially_completed | cancelled}`. `validating` may fail directly;
/// `cancelled` is reachable from any non-terminal state. `failed` and
/// `partially_completed` additionally allow an explicit, operator-driven
/// resubmission back to `queued` (bounded by the job's retry budget);
/// nothing transitions out of them automatically.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Validating,
    Queued,
    Processing,
    Completed,
    Failed,
    PartiallyCompleted,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PartiallyCompleted => "partially_completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// A terminal status permits no further automatic transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::PartiallyCompleted | Self::Cancelled
        )
    }

    /// Whether `self → to` is a permitted transition.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        match (self, to) {
            (Pending, Validating) => true,
            (Validating, Queued) | (Validating, Failed) => true,
            (Queued, Processing) => true,
            (Processing, Completed)
            | (Processing, Failed)
            | (Processing, PartiallyCompleted) => true,
            // Cooperative cancellation from any non-terminal state.
            (from, Cancelled) => !from.is_terminal(),
            // Explicit whole-job resubmission.
            (Failed, Queued) | (PartiallyCompleted, Queued) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Chunk status. Chunks are created `pending`, move to `processing`
/// under a lease, and end `completed` or `failed`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Queue entry status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Waiting,
    Leased,
    Retry,
    Done,
    Dead,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Leased => "leased",
            Self::Retry => "retry",
            Self::Done => "done",
            Self::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Dead)
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Severity of a row-level failure.
///
/// `Warning` and `Error` accumulate without blocking; `Critical` aborts
/// the remainder of the containing chunk (other chunks are unaffected).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Scope of a deduplication record: whole file or single row.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DedupScope {
    File,
    Row,
}

impl DedupScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Row => "row",
        }
    }
}

impl std::fmt::Display for DedupScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Durable Records
// ============================================================================

/// One bulk ingestion attempt.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UploadJob {
    pub id: String,
    pub file_name: String,
    pub file_size_bytes: i64,
    pub file_hash: String,
    pub strategy: UploadStrategy,
    pub priority: i64,
    pub status: JobStatus,
    pub total_rows: i64,
    pub processed_rows: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub warning_count: i64,
    pub skipped_count: i64,
    pub retry_count: i64,
    pub max_retries: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A contiguous slice of a job's rows, the unit of retry and
/// concurrency. `[row_start, row_end)` is half-open.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UploadChunk {
    pub id: i64,
    pub job_id: String,
    pub chunk_index: i64,
    pub total_chunks: i64,
    pub row_start: i64,
    pub row_end: i64,
    pub status: ChunkStatus,
    pub processed_rows: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub warning_count: i64,
    pub skipped_count: i64,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl UploadChunk {
    pub fn row_count(&self) -> i64 {
        self.row_end - self.row_start
    }
}

/// A leasable unit of work wrapping one chunk.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueueEntry {
    pub id: i64,
    pub job_id: String,
    pub chunk_index: i64,
    pub queue_name: String,
    pub priority: i64,
    pub status: QueueStatus,
    pub lease_owner: Option<String>,
    pub leased_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempts: i64,
    pub max_attempts: i64,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Identity of previously seen content. Never deleted; deduplication
/// history must survive job deletion.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DedupRecord {
    pub hash: String,
    pub scope: DedupScope,
    pub business_key: Option<String>,
    pub originating_job_id: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub duplicate_count: i64,
    pub action_taken: String,
}

/// A single row-level failure or warning.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcessingErrorRecord {
    pub id: i64,
    pub job_id: String,
    pub chunk_index: i64,
    pub row_number: i64,
    pub severity: Severity,
    pub code: String,
    pub message: String,
    pub raw_row: Option<String>,
    pub resolved: bool,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Immutable fact about a state change, partitioned by month for
/// retention management.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: i64,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub actor: String,
    pub before_state: Option<String>,
    pub after_state: Option<String>,
    pub partition_key: String,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Read Models
// ============================================================================

/// Point-in-time view of a job for the ingestion boundary and
/// downstream consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: String,
    pub file_name: String,
    pub file_hash: String,
    pub strategy: UploadStrategy,
    pub status: JobStatus,
    pub total_rows: i64,
    pub processed_rows: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub warning_count: i64,
    pub skipped_count: i64,
    pub retry_count: i64,
    pub max_retries: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<UploadJob> for JobSnapshot {
    fn from(job: UploadJob) -> Self {
        Self {
            id: job.id,
            file_name: job.file_name,
            file_hash: job.file_hash,
            strategy: job.strategy,
            status: job.status,
            total_rows: job.total_rows,
            processed_rows: job.processed_rows,
            success_count: job.success_count,
            error_count: job.error_count,
            warning_count: job.warning_count,
            skipped_count: job.skipped_count,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            last_error: job.last_error,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

/// One raw row handed to the row processor. `number` is the absolute
/// row index within the file (0-based, header excluded).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRow {
    pub number: i64,
    pub fields: Vec<String>,
}

impl RawRow {
    pub fn new(number: i64, fields: Vec<String>) -> Self {
        Self { number, fields }
    }

    /// Raw snapshot persisted with error records.
    pub fn snapshot(&self) -> String {
        self.fields.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_happy_path() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Validating));
        assert!(Validating.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(PartiallyCompleted));
        assert!(Processing.can_transition_to(Failed));
    }

    #[test]
    fn test_job_status_validating_may_fail_directly() {
        assert!(JobStatus::Validating.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn test_job_status_cancel_from_non_terminal_only() {
        use JobStatus::*;
        for from in [Pending, Validating, Queued, Processing] {
            assert!(from.can_transition_to(Cancelled), "{from} should cancel");
        }
        for from in [Completed, Failed, PartiallyCompleted, Cancelled] {
            assert!(!from.can_transition_to(Cancelled), "{from} should not cancel");
        }
    }

    #[test]
    fn test_job_status_no_skipping_states() {
        use JobStatus::*;
        assert!(!Pending.can_transition_to(Queued));
        assert!(!Pending.can_transition_to(Processing));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Queued));
    }

    #[test]
    fn test_job_status_resubmission_paths() {
        use JobStatus::*;
        assert!(Failed.can_transition_to(Queued));
        assert!(PartiallyCompleted.can_transition_to(Queued));
        assert!(!Cancelled.can_transition_to(Queued));
    }

    #[test]
    fn test_strategy_ordering_flag() {
        assert!(UploadStrategy::Stream.is_ordered());
        assert!(UploadStrategy::Sequential.is_ordered());
        assert!(!UploadStrategy::Parallel.is_ordered());
        assert!(!UploadStrategy::Batch.is_ordered());
    }

    #[test]
    fn test_status_round_trips_as_snake_case() {
        assert_eq!(JobStatus::PartiallyCompleted.as_str(), "partially_completed");
        assert_eq!(
            "sequential".parse::<UploadStrategy>().ok(),
            Some(UploadStrategy::Sequential)
        );
    }

    #[test]
    fn test_chunk_row_count() {
        let chunk = UploadChunk {
            id: 1,
            job_id: "j".into(),
            chunk_index: 0,
            total_chunks: 1,
            row_start: 100,
            row_end: 150,
            status: ChunkStatus::Pending,
            processed_rows: 0,
            success_count: 0,
            error_count: 0,
            warning_count: 0,
            skipped_count: 0,
            created_at: Utc::now(),
            processed_at: None,
        };
        assert_eq!(chunk.row_count(), 50);
    }
}
