//! Chunk processor: runs the pluggable row-processor over one chunk.
//!
//! The engine never interprets row contents. Business parsing and
//! persistence live behind the [`RowProcessor`] trait; reading rows out
//! of the uploaded file lives behind [`RowSource`]. This module only
//! hashes, deduplicates, classifies outcomes, and keeps count.

use async_trait::async_trait;
use intake_common::hash::{self, FileHash};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

use crate::dedup::{DedupError, DedupIndex, InsertOutcome};
use crate::ledger::{ErrorLedger, LedgerError, NewErrorRecord};
use crate::models::{ChunkStatus, DedupScope, RawRow, Severity, UploadChunk};
use crate::store::jobs::ChunkCounts;

// ============================================================================
// External seams
// ============================================================================

/// A row-level failure reported by the row processor.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct RowError {
    pub severity: Severity,
    pub code: String,
    pub message: String,
}

impl RowError {
    pub fn new(severity: Severity, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            code: code.into(),
            message: message.into(),
        }
    }
}

/// The externally supplied function that interprets and persists the
/// business meaning of one row.
#[async_trait]
pub trait RowProcessor: Send + Sync {
    async fn process(&self, row: &RawRow) -> Result<(), RowError>;

    /// Optional domain natural key for the row (e.g. document number +
    /// account), used as a secondary deduplication signal. The key is
    /// canonicalized (trimmed, lowercased) before any index lookup, so
    /// implementations may return the raw field content.
    fn business_key(&self, _row: &RawRow) -> Option<String> {
        None
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed file: {0}")]
    Csv(#[from] csv::Error),
}

/// Access to the rows of an uploaded file. `[start, end)` is a
/// half-open absolute row range (header excluded).
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn file_hash(&self, file_name: &str) -> Result<FileHash, SourceError>;
    async fn count_rows(&self, file_name: &str) -> Result<i64, SourceError>;
    async fn rows(&self, file_name: &str, start: i64, end: i64)
        -> Result<Vec<RawRow>, SourceError>;
}

// ============================================================================
// Row sources
// ============================================================================

/// Reads uploaded CSV files from a root directory.
#[derive(Debug, Clone)]
pub struct CsvRowSource {
    root: PathBuf,
    has_headers: bool,
}

impl CsvRowSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            has_headers: true,
        }
    }

    pub fn without_headers(mut self) -> Self {
        self.has_headers = false;
        self
    }

    fn path_for(&self, file_name: &str) -> Result<PathBuf, SourceError> {
        let path = self.root.join(file_name);
        if !path.is_file() {
            return Err(SourceError::NotFound(file_name.to_string()));
        }
        Ok(path)
    }

    fn reader(&self, file_name: &str) -> Result<csv::Reader<std::fs::File>, SourceError> {
        let path = self.path_for(file_name)?;
        Ok(csv::ReaderBuilder::new()
            .has_headers(self.has_headers)
            .flexible(true)
            .from_path(path)?)
    }
}

#[async_trait]
impl RowSource for CsvRowSource {
    async fn file_hash(&self, file_name: &str) -> Result<FileHash, SourceError> {
        let path = self.path_for(file_name)?;
        let mut file = std::fs::File::open(path)?;
        hash::hash_file(&mut file).map_err(|e| match e {
            intake_common::IntakeError::Io(io) => SourceError::Io(io),
            other => SourceError::Io(std::io::Error::other(other.to_string())),
        })
    }

    async fn count_rows(&self, file_name: &str) -> Result<i64, SourceError> {
        let mut reader = self.reader(file_name)?;
        let mut count = 0i64;
        for record in reader.records() {
            record?;
            count += 1;
        }
        Ok(count)
    }

    async fn rows(
        &self,
        file_name: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<RawRow>, SourceError> {
        let mut reader = self.reader(file_name)?;
        let mut rows = Vec::with_capacity((end - start).max(0) as usize);
        for (number, record) in reader.records().enumerate() {
            let number = number as i64;
            if number >= end {
                break;
            }
            let record = record?;
            if number < start {
                continue;
            }
            rows.push(RawRow::new(
                number,
                record.iter().map(|f| f.to_string()).collect(),
            ));
        }
        Ok(rows)
    }
}

/// In-memory source for tests and embedded callers.
#[derive(Debug, Clone, Default)]
pub struct MemoryRowSource {
    files: HashMap<String, Vec<Vec<String>>>,
}

impl MemoryRowSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, file_name: impl Into<String>, rows: Vec<Vec<String>>) -> Self {
        self.files.insert(file_name.into(), rows);
        self
    }

    fn get(&self, file_name: &str) -> Result<&Vec<Vec<String>>, SourceError> {
        self.files
            .get(file_name)
            .ok_or_else(|| SourceError::NotFound(file_name.to_string()))
    }
}

#[async_trait]
impl RowSource for MemoryRowSource {
    async fn file_hash(&self, file_name: &str) -> Result<FileHash, SourceError> {
        let rows = self.get(file_name)?;
        let mut content = Vec::new();
        for row in rows {
            content.extend_from_slice(row.join("\x1f").as_bytes());
            content.push(b'\n');
        }
        Ok(hash::hash_bytes(&content))
    }

    async fn count_rows(&self, file_name: &str) -> Result<i64, SourceError> {
        Ok(self.get(file_name)?.len() as i64)
    }

    async fn rows(
        &self,
        file_name: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<RawRow>, SourceError> {
        let rows = self.get(file_name)?;
        let start = start.clamp(0, rows.len() as i64) as usize;
        let end = end.clamp(0, rows.len() as i64) as usize;
        Ok(rows[start..end]
            .iter()
            .enumerate()
            .map(|(offset, fields)| RawRow::new((start + offset) as i64, fields.clone()))
            .collect())
    }
}

// ============================================================================
// Chunk processing
// ============================================================================

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Dedup(#[from] DedupError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Result of processing one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOutcome {
    /// Counts over the rows actually visited.
    pub counts: ChunkCounts,
    pub status: ChunkStatus,
}

impl ChunkOutcome {
    /// Counts to commit against the job for a terminal chunk.
    ///
    /// Rows left unvisited by a critical abort (or never visited at all
    /// on a dead chunk) are accounted as errors, so
    /// `success + error + warning + skipped == processed` holds for the
    /// job no matter how the chunk ended.
    pub fn terminal_counts(&self, chunk_rows: i64) -> ChunkCounts {
        let mut counts = self.counts;
        let unvisited = chunk_rows - counts.processed;
        counts.processed += unvisited;
        counts.error += unvisited;
        counts
    }
}

/// Executes the row-processor over the rows of one chunk.
#[derive(Debug, Clone)]
pub struct ChunkProcessor {
    dedup: DedupIndex,
    ledger: ErrorLedger,
}

impl ChunkProcessor {
    pub fn new(dedup: DedupIndex, ledger: ErrorLedger) -> Self {
        Self { dedup, ledger }
    }

    /// Process every row in the chunk's range.
    ///
    /// Per row: hash, consult the dedup index (hit = skipped, the
    /// row-processor is not invoked), otherwise invoke the
    /// row-processor and record the outcome. A `critical` row error
    /// aborts the remainder of the chunk; `warning` and `error`
    /// accumulate without blocking. Infrastructure failures bubble up
    /// as `ProcessError` and are the caller's cue to retry the chunk.
    #[tracing::instrument(skip_all, fields(job_id = %chunk.job_id, chunk_index = chunk.chunk_index))]
    pub async fn process(
        &self,
        chunk: &UploadChunk,
        rows: &[RawRow],
        row_processor: &dyn RowProcessor,
    ) -> Result<ChunkOutcome, ProcessError> {
        let mut counts = ChunkCounts::default();
        let mut critical = false;

        for row in rows {
            counts.processed += 1;
            let row_hash = hash::hash_row(&row.fields);
            // Canonicalize the domain key so case and whitespace noise
            // cannot defeat the secondary dedup signal.
            let business_key = row_processor
                .business_key(row)
                .and_then(|key| hash::business_key(&[key]));

            if let Some(existing) = self.dedup.lookup(DedupScope::Row, row_hash.as_str()).await? {
                self.dedup
                    .record_repeat(DedupScope::Row, row_hash.as_str(), business_key.as_deref())
                    .await?;
                tracing::trace!(
                    row = row.number,
                    originating_job = %existing.originating_job_id,
                    "duplicate row skipped"
                );
                counts.skipped += 1;
                continue;
            }
            if let Some(ref key) = business_key {
                if self
                    .dedup
                    .lookup_business_key(DedupScope::Row, key)
                    .await?
                    .is_some()
                {
                    self.dedup
                        .record_repeat(DedupScope::Row, row_hash.as_str(), Some(key))
                        .await?;
                    counts.skipped += 1;
                    continue;
                }
            }

            match row_processor.process(row).await {
                Ok(()) => {
                    let outcome = self
                        .dedup
                        .insert_if_absent(
                            DedupScope::Row,
                            row_hash.as_str(),
                            business_key.as_deref(),
                            &chunk.job_id,
                        )
                        .await?;
                    match outcome {
                        InsertOutcome::Inserted => counts.success += 1,
                        // Lost a cross-worker race after the lookup
                        // came back empty; the index decided, we yield.
                        InsertOutcome::AlreadyPresent { .. } => counts.skipped += 1,
                    }
                },
                Err(row_error) => {
                    self.ledger
                        .append(NewErrorRecord {
                            job_id: chunk.job_id.clone(),
                            chunk_index: chunk.chunk_index,
                            row_number: row.number,
                            severity: row_error.severity,
                            code: row_error.code.clone(),
                            message: row_error.message.clone(),
                            raw_row: Some(row.snapshot()),
                        })
                        .await?;
                    match row_error.severity {
                        Severity::Warning => counts.warning += 1,
                        Severity::Error => counts.error += 1,
                        Severity::Critical => {
                            counts.error += 1;
                            critical = true;
                            tracing::warn!(
                                row = row.number,
                                code = %row_error.code,
                                "critical row error, aborting chunk"
                            );
                            break;
                        },
                    }
                },
            }
        }

        let status = if critical || counts.processed == 0 {
            ChunkStatus::Failed
        } else {
            ChunkStatus::Completed
        };
        Ok(ChunkOutcome { counts, status })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::db::test_support::{seed_job, test_pool};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Row processor that fails rows whose first field carries a
    /// directive, and counts invocations.
    #[derive(Default)]
    struct ScriptedProcessor {
        invocations: AtomicUsize,
    }

    #[async_trait]
    impl RowProcessor for ScriptedProcessor {
        async fn process(&self, row: &RawRow) -> Result<(), RowError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            match row.fields.first().map(String::as_str) {
                Some("warn") => Err(RowError::new(Severity::Warning, "W_ODD", "odd value")),
                Some("error") => Err(RowError::new(Severity::Error, "E_BAD", "bad value")),
                Some("critical") => {
                    Err(RowError::new(Severity::Critical, "E_FATAL", "fatal value"))
                },
                _ => Ok(()),
            }
        }
    }

    fn chunk(job_id: &str, start: i64, end: i64) -> UploadChunk {
        UploadChunk {
            id: 1,
            job_id: job_id.to_string(),
            chunk_index: 0,
            total_chunks: 1,
            row_start: start,
            row_end: end,
            status: ChunkStatus::Processing,
            processed_rows: 0,
            success_count: 0,
            error_count: 0,
            warning_count: 0,
            skipped_count: 0,
            created_at: Utc::now(),
            processed_at: None,
        }
    }

    fn rows(specs: &[&str]) -> Vec<RawRow> {
        specs
            .iter()
            .enumerate()
            .map(|(i, s)| RawRow::new(i as i64, vec![s.to_string(), i.to_string()]))
            .collect()
    }

    #[tokio::test]
    async fn test_clean_chunk_all_success() {
        let (pool, _dir) = test_pool().await;
        let processor = ChunkProcessor::new(DedupIndex::new(pool.clone()), ErrorLedger::new(pool));
        let row_processor = ScriptedProcessor::default();

        let outcome = processor
            .process(&chunk("job-a", 0, 4), &rows(&["ok", "ok", "ok", "ok"]), &row_processor)
            .await
            .unwrap();

        assert_eq!(outcome.status, ChunkStatus::Completed);
        assert_eq!(outcome.counts.processed, 4);
        assert_eq!(outcome.counts.success, 4);
        assert!(outcome.counts.is_conserved());
        assert_eq!(row_processor.invocations.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_warnings_and_errors_accumulate() {
        let (pool, _dir) = test_pool().await;
        seed_job(&pool, "job-a").await;
        let ledger = ErrorLedger::new(pool.clone());
        let processor = ChunkProcessor::new(DedupIndex::new(pool), ledger.clone());
        let row_processor = ScriptedProcessor::default();

        let outcome = processor
            .process(
                &chunk("job-a", 0, 5),
                &rows(&["ok", "warn", "error", "warn", "ok"]),
                &row_processor,
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, ChunkStatus::Completed);
        assert_eq!(outcome.counts.processed, 5);
        assert_eq!(outcome.counts.success, 2);
        assert_eq!(outcome.counts.warning, 2);
        assert_eq!(outcome.counts.error, 1);
        assert!(outcome.counts.is_conserved());

        let records = ledger.for_job("job-a").await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().any(|r| r.severity == Severity::Warning));
        assert!(records[0].raw_row.is_some());
    }

    #[tokio::test]
    async fn test_critical_aborts_remainder_of_chunk() {
        let (pool, _dir) = test_pool().await;
        seed_job(&pool, "job-a").await;
        let processor =
            ChunkProcessor::new(DedupIndex::new(pool.clone()), ErrorLedger::new(pool));
        let row_processor = ScriptedProcessor::default();

        let outcome = processor
            .process(
                &chunk("job-a", 0, 5),
                &rows(&["ok", "critical", "ok", "ok", "ok"]),
                &row_processor,
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, ChunkStatus::Failed);
        assert_eq!(outcome.counts.processed, 2);
        assert_eq!(outcome.counts.success, 1);
        assert_eq!(outcome.counts.error, 1);
        // Rows 2..5 never reached the row processor.
        assert_eq!(row_processor.invocations.load(Ordering::SeqCst), 2);

        // Terminal accounting charges the unvisited rows as errors.
        let terminal = outcome.terminal_counts(5);
        assert_eq!(terminal.processed, 5);
        assert_eq!(terminal.error, 4);
        assert!(terminal.is_conserved());
    }

    #[tokio::test]
    async fn test_duplicate_rows_skipped_without_invocation() {
        let (pool, _dir) = test_pool().await;
        let processor =
            ChunkProcessor::new(DedupIndex::new(pool.clone()), ErrorLedger::new(pool));

        let first = ScriptedProcessor::default();
        processor
            .process(&chunk("job-a", 0, 2), &rows(&["ok", "ok"]), &first)
            .await
            .unwrap();

        // Same content re-ingested by another job: every row is a
        // dedup hit and the row processor is never invoked.
        let second = ScriptedProcessor::default();
        let outcome = processor
            .process(&chunk("job-b", 0, 2), &rows(&["ok", "ok"]), &second)
            .await
            .unwrap();

        assert_eq!(outcome.counts.skipped, 2);
        assert_eq!(outcome.counts.success, 0);
        assert_eq!(second.invocations.load(Ordering::SeqCst), 0);
    }

    /// Reports the second field as the row's natural key, raw.
    #[derive(Default)]
    struct KeyedProcessor {
        invocations: AtomicUsize,
    }

    #[async_trait]
    impl RowProcessor for KeyedProcessor {
        async fn process(&self, _row: &RawRow) -> Result<(), RowError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn business_key(&self, row: &RawRow) -> Option<String> {
            row.fields.get(1).cloned()
        }
    }

    #[tokio::test]
    async fn test_business_key_matches_across_case_and_whitespace() {
        let (pool, _dir) = test_pool().await;
        let processor =
            ChunkProcessor::new(DedupIndex::new(pool.clone()), ErrorLedger::new(pool));
        let row_processor = KeyedProcessor::default();

        // Different content (distinct row hashes) but the same natural
        // key modulo case and padding: the second row is a dedup hit.
        let rows = vec![
            RawRow::new(0, vec!["a".to_string(), " INV-7 ".to_string()]),
            RawRow::new(1, vec!["b".to_string(), "inv-7".to_string()]),
        ];
        let outcome = processor
            .process(&chunk("job-a", 0, 2), &rows, &row_processor)
            .await
            .unwrap();

        assert_eq!(outcome.counts.success, 1);
        assert_eq!(outcome.counts.skipped, 1);
        assert_eq!(row_processor.invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_rows_are_not_deduplicated() {
        let (pool, _dir) = test_pool().await;
        seed_job(&pool, "job-a").await;
        let processor =
            ChunkProcessor::new(DedupIndex::new(pool.clone()), ErrorLedger::new(pool));

        let first = ScriptedProcessor::default();
        processor
            .process(&chunk("job-a", 0, 1), &rows(&["error"]), &first)
            .await
            .unwrap();

        // The row failed, so no dedup record exists and a retry
        // invokes the processor again.
        let second = ScriptedProcessor::default();
        let outcome = processor
            .process(&chunk("job-a", 0, 1), &rows(&["error"]), &second)
            .await
            .unwrap();
        assert_eq!(second.invocations.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.counts.error, 1);
    }

    #[tokio::test]
    async fn test_memory_source_range_and_hash() {
        let source = MemoryRowSource::new().with_file(
            "orders.csv",
            vec![
                vec!["a".into(), "1".into()],
                vec!["b".into(), "2".into()],
                vec!["c".into(), "3".into()],
            ],
        );

        assert_eq!(source.count_rows("orders.csv").await.unwrap(), 3);
        let rows = source.rows("orders.csv", 1, 3).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].number, 1);
        assert_eq!(rows[0].fields[0], "b");

        let h1 = source.file_hash("orders.csv").await.unwrap();
        let h2 = source.file_hash("orders.csv").await.unwrap();
        assert_eq!(h1, h2);
        assert!(matches!(
            source.count_rows("missing.csv").await,
            Err(SourceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_csv_source_reads_ranges() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("invoices.csv"),
            "doc,store,amount\nINV-1,acme,10.00\nINV-2,zenith,20.00\nINV-3,acme,30.00\n",
        )
        .unwrap();

        let source = CsvRowSource::new(dir.path());
        assert_eq!(source.count_rows("invoices.csv").await.unwrap(), 3);

        let rows = source.rows("invoices.csv", 1, 3).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].number, 1);
        assert_eq!(rows[0].fields, vec!["INV-2", "zenith", "20.00"]);

        source.file_hash("invoices.csv").await.unwrap();
        assert!(matches!(
            source.rows("absent.csv", 0, 1).await,
            Err(SourceError::NotFound(_))
        ));
    }
}
