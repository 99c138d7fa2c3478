//! Error ledger: append-style store of per-row failures.
//!
//! Records are created during chunk processing and queryable per job
//! and per severity. The only mutation is `resolve`, used by external
//! review tooling — the engine itself never resolves anything.

use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;

use crate::audit::{self, AuditEvent};
use crate::models::{ProcessingErrorRecord, Severity};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Error record not found: {0}")]
    NotFound(i64),
    #[error("Error record {0} is already resolved")]
    AlreadyResolved(i64),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Audit error: {0}")]
    Audit(#[from] audit::AuditError),
}

/// A row failure about to be appended.
#[derive(Debug, Clone)]
pub struct NewErrorRecord {
    pub job_id: String,
    pub chunk_index: i64,
    pub row_number: i64,
    pub severity: Severity,
    pub code: String,
    pub message: String,
    pub raw_row: Option<String>,
}

/// Handle over the processing_errors collection.
#[derive(Debug, Clone)]
pub struct ErrorLedger {
    pool: SqlitePool,
}

impl ErrorLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one row failure.
    pub async fn append(&self, record: NewErrorRecord) -> Result<i64, LedgerError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO processing_errors
                (job_id, chunk_index, row_number, severity, code, message,
                 raw_row, resolved, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)
            RETURNING id
            "#,
        )
        .bind(&record.job_id)
        .bind(record.chunk_index)
        .bind(record.row_number)
        .bind(record.severity)
        .bind(&record.code)
        .bind(&record.message)
        .bind(&record.raw_row)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// All failures for one job, in row order.
    pub async fn for_job(
        &self,
        job_id: &str,
    ) -> Result<Vec<ProcessingErrorRecord>, LedgerError> {
        let records = sqlx::query_as::<_, ProcessingErrorRecord>(
            r#"
            SELECT id, job_id, chunk_index, row_number, severity, code, message,
                   raw_row, resolved, resolved_by, resolution_notes, created_at
            FROM processing_errors
            WHERE job_id = ?1
            ORDER BY row_number ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Failures for one job filtered by severity.
    pub async fn for_job_with_severity(
        &self,
        job_id: &str,
        severity: Severity,
    ) -> Result<Vec<ProcessingErrorRecord>, LedgerError> {
        let records = sqlx::query_as::<_, ProcessingErrorRecord>(
            r#"
            SELECT id, job_id, chunk_index, row_number, severity, code, message,
                   raw_row, resolved, resolved_by, resolution_notes, created_at
            FROM processing_errors
            WHERE job_id = ?1 AND severity = ?2
            ORDER BY row_number ASC
            "#,
        )
        .bind(job_id)
        .bind(severity)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Count of unresolved failures for one job.
    pub async fn unresolved_count(&self, job_id: &str) -> Result<i64, LedgerError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM processing_errors WHERE job_id = ?1 AND resolved = 0",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Mark a failure as reviewed. The sole mutation on the ledger;
    /// driven by external tooling, not by the engine.
    #[tracing::instrument(skip(self, notes))]
    pub async fn resolve(
        &self,
        error_id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE processing_errors
            SET resolved = 1, resolved_by = ?2, resolution_notes = ?3
            WHERE id = ?1 AND resolved = 0
            "#,
        )
        .bind(error_id)
        .bind(resolved_by)
        .bind(notes)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM processing_errors WHERE id = ?1")
                    .bind(error_id)
                    .fetch_one(&self.pool)
                    .await?;
            return Err(if exists == 0 {
                LedgerError::NotFound(error_id)
            } else {
                LedgerError::AlreadyResolved(error_id)
            });
        }

        audit::record(
            &self.pool,
            AuditEvent::transition("error_record", &error_id.to_string(), "open", "resolved")
                .with_actor(resolved_by),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::db::test_support::{seed_job, test_pool};

    fn record(job_id: &str, row: i64, severity: Severity) -> NewErrorRecord {
        NewErrorRecord {
            job_id: job_id.to_string(),
            chunk_index: 0,
            row_number: row,
            severity,
            code: "E_PARSE".to_string(),
            message: "unparseable amount".to_string(),
            raw_row: Some("INV-1,,12x.50".to_string()),
        }
    }

    #[tokio::test]
    async fn test_append_and_query_by_job() {
        let (pool, _dir) = test_pool().await;
        seed_job(&pool, "job-a").await;
        seed_job(&pool, "job-b").await;
        let ledger = ErrorLedger::new(pool);

        ledger.append(record("job-a", 3, Severity::Error)).await.unwrap();
        ledger.append(record("job-a", 1, Severity::Warning)).await.unwrap();
        ledger.append(record("job-b", 2, Severity::Error)).await.unwrap();

        let records = ledger.for_job("job-a").await.unwrap();
        assert_eq!(records.len(), 2);
        // Row order, not insertion order.
        assert_eq!(records[0].row_number, 1);
        assert_eq!(records[1].row_number, 3);
    }

    #[tokio::test]
    async fn test_query_by_severity() {
        let (pool, _dir) = test_pool().await;
        seed_job(&pool, "job-a").await;
        let ledger = ErrorLedger::new(pool);

        ledger.append(record("job-a", 1, Severity::Warning)).await.unwrap();
        ledger.append(record("job-a", 2, Severity::Critical)).await.unwrap();

        let critical = ledger
            .for_job_with_severity("job-a", Severity::Critical)
            .await
            .unwrap();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].row_number, 2);
    }

    #[tokio::test]
    async fn test_resolve_is_single_shot() {
        let (pool, _dir) = test_pool().await;
        seed_job(&pool, "job-a").await;
        let ledger = ErrorLedger::new(pool);

        let id = ledger.append(record("job-a", 1, Severity::Error)).await.unwrap();
        assert_eq!(ledger.unresolved_count("job-a").await.unwrap(), 1);

        ledger.resolve(id, "reviewer", Some("fixed upstream")).await.unwrap();
        assert_eq!(ledger.unresolved_count("job-a").await.unwrap(), 0);

        assert!(matches!(
            ledger.resolve(id, "reviewer", None).await,
            Err(LedgerError::AlreadyResolved(_))
        ));
        assert!(matches!(
            ledger.resolve(9999, "reviewer", None).await,
            Err(LedgerError::NotFound(9999))
        ));
    }
}
