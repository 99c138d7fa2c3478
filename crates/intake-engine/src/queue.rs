//! Lease-based work queue.
//!
//! The concurrency-critical component. Workers claim the
//! highest-priority eligible entry with a single atomic conditional
//! update, so two workers can never both hold a live lease on the same
//! entry — leases expire on their own, which is the entire crash-able
//! recovery story: a dead worker's entry simply becomes claimable again
//! once `lease_expires_at` passes.
//!
//! Ordering within one queue name: priority descending, then creation
//! time ascending (FIFO within a priority band). No ordering guarantee
//! across queue names.

use chrono::Utc;
use sqlx::SqlitePool;
use std::time::Duration;
use thiserror::Error;

use crate::audit::{self, AuditEvent};
use crate::models::{QueueEntry, QueueStatus};
use crate::retry::RetryPolicy;

const ENTRY_COLUMNS: &str = r#"
    id, job_id, chunk_index, queue_name, priority, status, lease_owner,
    leased_at, lease_expires_at, attempts, max_attempts, last_error,
    next_retry_at, created_at
"#;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue entry not found: {0}")]
    NotFound(i64),

    #[error("Lease on entry {entry_id} no longer held by {worker_id}")]
    LeaseLost { entry_id: i64, worker_id: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Audit error: {0}")]
    Audit(#[from] audit::AuditError),
}

/// Handle over one named queue within the queue_entries collection.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    pool: SqlitePool,
    queue_name: String,
    lease_duration: Duration,
    policy: RetryPolicy,
}

impl WorkQueue {
    pub fn new(
        pool: SqlitePool,
        queue_name: impl Into<String>,
        lease_duration: Duration,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            pool,
            queue_name: queue_name.into(),
            lease_duration,
            policy,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// Insert a `waiting` entry wrapping one chunk.
    #[tracing::instrument(skip(self))]
    pub async fn enqueue(
        &self,
        job_id: &str,
        chunk_index: i64,
        priority: i64,
    ) -> Result<i64, QueueError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO queue_entries
                (job_id, chunk_index, queue_name, priority, status,
                 max_attempts, created_at)
            VALUES (?1, ?2, ?3, ?4, 'waiting', ?5, ?6)
            RETURNING id
            "#,
        )
        .bind(job_id)
        .bind(chunk_index)
        .bind(&self.queue_name)
        .bind(priority)
        .bind(self.policy.max_attempts)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        audit::record(
            &self.pool,
            AuditEvent::created("queue_entry", &id.to_string(), "waiting"),
        )
        .await?;
        Ok(id)
    }

    /// Atomically claim the best eligible entry for `worker_id`.
    ///
    /// Eligible entries are `waiting`, `retry` whose backoff delay has
    /// elapsed, and `leased` whose lease expired (crash recovery).
    /// Entries are only offered while their job is `queued` or
    /// `processing`: a cancelled job stops yielding new work without
    /// interrupting in-flight leases, and entries enqueued during
    /// planning stay invisible until the job is actually released. The
    /// selection and the lease write are one statement, so exactly one
    /// of any number of racing workers wins.
    #[tracing::instrument(skip(self))]
    pub async fn claim(&self, worker_id: &str) -> Result<Option<QueueEntry>, QueueError> {
        let now = Utc::now();
        let expires = now
            + chrono::Duration::from_std(self.lease_duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let query = format!(
            r#"
            UPDATE queue_entries
            SET status = 'leased',
                lease_owner = ?1,
                leased_at = ?2,
                lease_expires_at = ?3,
                attempts = attempts + 1
            WHERE id = (
                SELECT qe.id
                FROM queue_entries qe
                JOIN upload_jobs j ON j.id = qe.job_id
                WHERE qe.queue_name = ?4
                  AND j.status IN ('queued', 'processing')
                  AND (
                    qe.status = 'waiting'
                    OR (qe.status = 'retry' AND qe.next_retry_at <= ?2)
                    OR (qe.status = 'leased' AND qe.lease_expires_at <= ?2)
                  )
                ORDER BY qe.priority DESC, qe.created_at ASC, qe.id ASC
                LIMIT 1
            )
            RETURNING {ENTRY_COLUMNS}
            "#
        );
        let entry = sqlx::query_as::<_, QueueEntry>(&query)
            .bind(worker_id)
            .bind(now)
            .bind(expires)
            .bind(&self.queue_name)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(ref entry) = entry {
            // The prior status is not observable after the atomic
            // update (waiting, retry, or an expired lease), so the
            // claim event records only the state it produced.
            audit::record(
                &self.pool,
                AuditEvent {
                    event_type: "claimed",
                    entity_type: "queue_entry",
                    entity_id: &entry.id.to_string(),
                    actor: worker_id,
                    before_state: None,
                    after_state: Some("leased"),
                },
            )
            .await?;
            tracing::debug!(
                entry_id = entry.id,
                job_id = %entry.job_id,
                chunk_index = entry.chunk_index,
                attempt = entry.attempts,
                "entry claimed"
            );
        }
        Ok(entry)
    }

    /// Extend the lease for a long-running chunk.
    ///
    /// Fails with `LeaseLost` when another worker has reclaimed the
    /// entry since; the caller must abort its in-flight work rather
    /// than double-commit results.
    pub async fn renew_lease(&self, worker_id: &str, entry_id: i64) -> Result<(), QueueError> {
        let now = Utc::now();
        let expires = now
            + chrono::Duration::from_std(self.lease_duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let result = sqlx::query(
            r#"
            UPDATE queue_entries
            SET lease_expires_at = ?3
            WHERE id = ?1 AND lease_owner = ?2 AND status = 'leased'
            "#,
        )
        .bind(entry_id)
        .bind(worker_id)
        .bind(expires)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.lease_lost_or_missing(worker_id, entry_id).await?);
        }
        Ok(())
    }

    /// Transition a leased entry to `done`. Same ownership guard as
    /// `renew_lease`.
    #[tracing::instrument(skip(self))]
    pub async fn complete(&self, worker_id: &str, entry_id: i64) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_entries
            SET status = 'done',
                lease_owner = NULL,
                leased_at = NULL,
                lease_expires_at = NULL
            WHERE id = ?1 AND lease_owner = ?2 AND status = 'leased'
            "#,
        )
        .bind(entry_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.lease_lost_or_missing(worker_id, entry_id).await?);
        }

        audit::record(
            &self.pool,
            AuditEvent::transition("queue_entry", &entry_id.to_string(), "leased", "done")
                .with_actor(worker_id),
        )
        .await?;
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// A retryable failure within the attempt budget moves the entry to
    /// `retry` with `next_retry_at` set by the backoff policy; anything
    /// else goes to `dead`. Returns the status the entry landed in.
    #[tracing::instrument(skip(self, error))]
    pub async fn fail(
        &self,
        worker_id: &str,
        entry_id: i64,
        error: &str,
        retryable: bool,
    ) -> Result<QueueStatus, QueueError> {
        let attempts: Option<i64> = sqlx::query_scalar(
            "SELECT attempts FROM queue_entries WHERE id = ?1 AND lease_owner = ?2 AND status = 'leased'",
        )
        .bind(entry_id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;
        let attempts = match attempts {
            Some(n) => n,
            None => return Err(self.lease_lost_or_missing(worker_id, entry_id).await?),
        };

        let to = if retryable && self.policy.should_retry(attempts) {
            QueueStatus::Retry
        } else {
            QueueStatus::Dead
        };
        let next_retry_at = (to == QueueStatus::Retry).then(|| {
            Utc::now()
                + chrono::Duration::from_std(self.policy.next_retry_delay(attempts))
                    .unwrap_or_else(|_| chrono::Duration::seconds(60))
        });

        let result = sqlx::query(
            r#"
            UPDATE queue_entries
            SET status = ?3,
                last_error = ?4,
                next_retry_at = ?5,
                lease_owner = NULL,
                leased_at = NULL,
                lease_expires_at = NULL
            WHERE id = ?1 AND lease_owner = ?2 AND status = 'leased'
            "#,
        )
        .bind(entry_id)
        .bind(worker_id)
        .bind(to)
        .bind(error)
        .bind(next_retry_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.lease_lost_or_missing(worker_id, entry_id).await?);
        }

        audit::record(
            &self.pool,
            AuditEvent::transition("queue_entry", &entry_id.to_string(), "leased", to.as_str())
                .with_actor(worker_id),
        )
        .await?;
        tracing::warn!(entry_id, attempts, status = %to, error, "entry attempt failed");
        Ok(to)
    }

    /// Destroy an entry whose chunk reached a terminal state.
    pub async fn remove(&self, entry_id: i64) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM queue_entries WHERE id = ?1 AND status IN ('done', 'dead')")
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove any entries for the given chunk regardless of status.
    /// Used when resubmitting a job to make room for fresh entries.
    pub async fn remove_for_chunk(&self, job_id: &str, chunk_index: i64) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM queue_entries WHERE job_id = ?1 AND chunk_index = ?2")
            .bind(job_id)
            .bind(chunk_index)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The entry wrapping a given chunk, if one exists.
    pub async fn entry_for_chunk(
        &self,
        job_id: &str,
        chunk_index: i64,
    ) -> Result<Option<QueueEntry>, QueueError> {
        let query = format!(
            "SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE job_id = ?1 AND chunk_index = ?2"
        );
        let entry = sqlx::query_as::<_, QueueEntry>(&query)
            .bind(job_id)
            .bind(chunk_index)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    /// Delete every terminal (`done` / `dead`) entry in this queue.
    /// Periodic maintenance; returns the number swept.
    pub async fn sweep_terminal(&self) -> Result<u64, QueueError> {
        let result = sqlx::query(
            "DELETE FROM queue_entries WHERE queue_name = ?1 AND status IN ('done', 'dead')",
        )
        .bind(&self.queue_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get(&self, entry_id: i64) -> Result<QueueEntry, QueueError> {
        let query = format!("SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE id = ?1");
        sqlx::query_as::<_, QueueEntry>(&query)
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(QueueError::NotFound(entry_id))
    }

    /// Number of entries still waiting or scheduled for retry.
    pub async fn pending_len(&self) -> Result<i64, QueueError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_entries WHERE queue_name = ?1 AND status IN ('waiting', 'retry')",
        )
        .bind(&self.queue_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Distinguish a vanished entry from a reclaimed lease.
    async fn lease_lost_or_missing(
        &self,
        worker_id: &str,
        entry_id: i64,
    ) -> Result<QueueError, QueueError> {
        let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_entries WHERE id = ?1")
            .bind(entry_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(if exists == 0 {
            QueueError::NotFound(entry_id)
        } else {
            QueueError::LeaseLost {
                entry_id,
                worker_id: worker_id.to_string(),
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::db::test_support::test_pool;
    use crate::models::UploadStrategy;
    use crate::store::jobs::{JobStore, NewJob};

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(100), 3)
    }

    /// Seed a job and walk it to `queued`, where its entries become
    /// claimable.
    async fn seeded_job(pool: &SqlitePool, hash: &str) -> String {
        use crate::models::JobStatus;
        let jobs = JobStore::new(pool.clone());
        let job = jobs
            .create_job(NewJob {
                file_name: format!("{hash}.csv"),
                file_size_bytes: 64,
                file_hash: hash.to_string(),
                strategy: UploadStrategy::Parallel,
                priority: 0,
                max_retries: 0,
                expires_at: None,
            })
            .await
            .unwrap();
        jobs.transition(&job.id, JobStatus::Pending, JobStatus::Validating)
            .await
            .unwrap();
        jobs.transition(&job.id, JobStatus::Validating, JobStatus::Queued)
            .await
            .unwrap();
        job.id
    }

    fn queue(pool: &SqlitePool) -> WorkQueue {
        WorkQueue::new(pool.clone(), "chunks", Duration::from_secs(30), policy())
    }

    #[tokio::test]
    async fn test_claim_returns_none_on_empty_queue() {
        let (pool, _dir) = test_pool().await;
        let queue = queue(&pool);
        assert!(queue.claim("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_leases_entry() {
        let (pool, _dir) = test_pool().await;
        let queue = queue(&pool);
        let job_id = seeded_job(&pool, "h1").await;

        let id = queue.enqueue(&job_id, 0, 0).await.unwrap();
        let entry = queue.claim("w1").await.unwrap().unwrap();
        assert_eq!(entry.id, id);
        assert_eq!(entry.status, QueueStatus::Leased);
        assert_eq!(entry.lease_owner.as_deref(), Some("w1"));
        assert_eq!(entry.attempts, 1);
        assert!(entry.lease_expires_at.unwrap() > Utc::now());

        // Entry is leased; nothing left for a second worker.
        assert!(queue.claim("w2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_storm_single_winner() {
        let (pool, _dir) = test_pool().await;
        let queue = queue(&pool);
        let job_id = seeded_job(&pool, "h1").await;
        queue.enqueue(&job_id, 0, 0).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.claim(&format!("w{i}")).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_claim_ordering_priority_then_fifo() {
        let (pool, _dir) = test_pool().await;
        let queue = queue(&pool);
        let job_a = seeded_job(&pool, "ha").await;
        let job_b = seeded_job(&pool, "hb").await;
        let job_c = seeded_job(&pool, "hc").await;

        let low_old = queue.enqueue(&job_a, 0, 1).await.unwrap();
        let high = queue.enqueue(&job_b, 0, 9).await.unwrap();
        let low_new = queue.enqueue(&job_c, 0, 1).await.unwrap();

        assert_eq!(queue.claim("w").await.unwrap().unwrap().id, high);
        assert_eq!(queue.claim("w").await.unwrap().unwrap().id, low_old);
        assert_eq!(queue.claim("w").await.unwrap().unwrap().id, low_new);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let (pool, _dir) = test_pool().await;
        // Zero-ish lease so it expires immediately.
        let queue = WorkQueue::new(pool.clone(), "chunks", Duration::from_millis(0), policy());
        let job_id = seeded_job(&pool, "h1").await;
        queue.enqueue(&job_id, 0, 0).await.unwrap();

        let first = queue.claim("crashed-worker").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = queue.claim("recovering-worker").await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.lease_owner.as_deref(), Some("recovering-worker"));
        assert_eq!(second.attempts, 2);
    }

    #[tokio::test]
    async fn test_complete_requires_ownership() {
        let (pool, _dir) = test_pool().await;
        let queue = queue(&pool);
        let job_id = seeded_job(&pool, "h1").await;
        queue.enqueue(&job_id, 0, 0).await.unwrap();

        let entry = queue.claim("w1").await.unwrap().unwrap();
        assert!(matches!(
            queue.complete("w2", entry.id).await,
            Err(QueueError::LeaseLost { .. })
        ));
        queue.complete("w1", entry.id).await.unwrap();
        assert_eq!(queue.get(entry.id).await.unwrap().status, QueueStatus::Done);
    }

    #[tokio::test]
    async fn test_lease_lost_after_reclaim() {
        let (pool, _dir) = test_pool().await;
        let queue = WorkQueue::new(pool.clone(), "chunks", Duration::from_millis(0), policy());
        let job_id = seeded_job(&pool, "h1").await;
        queue.enqueue(&job_id, 0, 0).await.unwrap();

        let entry = queue.claim("w1").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.claim("w2").await.unwrap().unwrap();

        // w1 lost the lease to w2; both renew and complete must refuse.
        assert!(matches!(
            queue.renew_lease("w1", entry.id).await,
            Err(QueueError::LeaseLost { .. })
        ));
        assert!(matches!(
            queue.complete("w1", entry.id).await,
            Err(QueueError::LeaseLost { .. })
        ));
    }

    #[tokio::test]
    async fn test_renew_extends_expiry() {
        let (pool, _dir) = test_pool().await;
        let queue = queue(&pool);
        let job_id = seeded_job(&pool, "h1").await;
        queue.enqueue(&job_id, 0, 0).await.unwrap();

        let entry = queue.claim("w1").await.unwrap().unwrap();
        let before = entry.lease_expires_at.unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;
        queue.renew_lease("w1", entry.id).await.unwrap();
        let after = queue.get(entry.id).await.unwrap().lease_expires_at.unwrap();
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_fail_retries_then_dies() {
        let (pool, _dir) = test_pool().await;
        let queue = queue(&pool);
        let job_id = seeded_job(&pool, "h1").await;
        let id = queue.enqueue(&job_id, 0, 0).await.unwrap();

        // Attempts 1 and 2 are within the budget of 3.
        for expected_attempt in 1..3 {
            // Retry delay is tiny (10ms base, 100ms cap); wait it out.
            tokio::time::sleep(Duration::from_millis(150)).await;
            let entry = queue.claim("w1").await.unwrap().unwrap();
            assert_eq!(entry.attempts, expected_attempt);
            let status = queue
                .fail("w1", entry.id, "downstream timeout", true)
                .await
                .unwrap();
            assert_eq!(status, QueueStatus::Retry);
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        let entry = queue.claim("w1").await.unwrap().unwrap();
        assert_eq!(entry.attempts, 3);
        let status = queue
            .fail("w1", entry.id, "downstream timeout", true)
            .await
            .unwrap();
        assert_eq!(status, QueueStatus::Dead);

        let entry = queue.get(id).await.unwrap();
        assert_eq!(entry.status, QueueStatus::Dead);
        assert_eq!(entry.last_error.as_deref(), Some("downstream timeout"));
    }

    #[tokio::test]
    async fn test_non_retryable_failure_goes_straight_to_dead() {
        let (pool, _dir) = test_pool().await;
        let queue = queue(&pool);
        let job_id = seeded_job(&pool, "h1").await;
        queue.enqueue(&job_id, 0, 0).await.unwrap();

        let entry = queue.claim("w1").await.unwrap().unwrap();
        let status = queue
            .fail("w1", entry.id, "critical row error", false)
            .await
            .unwrap();
        assert_eq!(status, QueueStatus::Dead);
    }

    #[tokio::test]
    async fn test_cancelled_job_entries_not_offered() {
        let (pool, _dir) = test_pool().await;
        let queue = queue(&pool);
        let jobs = JobStore::new(pool.clone());
        let job_id = seeded_job(&pool, "h1").await;
        queue.enqueue(&job_id, 0, 0).await.unwrap();

        jobs.transition(
            &job_id,
            crate::models::JobStatus::Queued,
            crate::models::JobStatus::Cancelled,
        )
        .await
        .unwrap();
        assert!(queue.claim("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_only_deletes_terminal_entries() {
        let (pool, _dir) = test_pool().await;
        let queue = queue(&pool);
        let job_id = seeded_job(&pool, "h1").await;
        let id = queue.enqueue(&job_id, 0, 0).await.unwrap();

        queue.remove(id).await.unwrap();
        // Still waiting, so still present.
        assert_eq!(queue.get(id).await.unwrap().status, QueueStatus::Waiting);

        let entry = queue.claim("w1").await.unwrap().unwrap();
        queue.complete("w1", entry.id).await.unwrap();
        queue.remove(id).await.unwrap();
        assert!(matches!(queue.get(id).await, Err(QueueError::NotFound(_))));
    }
}
