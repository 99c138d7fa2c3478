//! Append-only audit log.
//!
//! One entry per state transition anywhere in the system: job, chunk,
//! queue entry, dedup record creation, error resolution. The engine
//! only ever writes here; the read helpers exist for external review
//! tooling and tests. Entries carry a `YYYY-MM` partition key so
//! retention can drop whole months.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use crate::models::AuditEntry;

/// System actor recorded when no external actor is involved.
pub const ENGINE_ACTOR: &str = "engine";

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A state change about to be recorded.
#[derive(Debug, Clone)]
pub struct AuditEvent<'a> {
    pub event_type: &'a str,
    pub entity_type: &'a str,
    pub entity_id: &'a str,
    pub actor: &'a str,
    pub before_state: Option<&'a str>,
    pub after_state: Option<&'a str>,
}

impl<'a> AuditEvent<'a> {
    /// Event for a status transition on some entity.
    pub fn transition(
        entity_type: &'a str,
        entity_id: &'a str,
        before: &'a str,
        after: &'a str,
    ) -> Self {
        Self {
            event_type: "transition",
            entity_type,
            entity_id,
            actor: ENGINE_ACTOR,
            before_state: Some(before),
            after_state: Some(after),
        }
    }

    /// Event for the creation of an entity (no before state).
    pub fn created(entity_type: &'a str, entity_id: &'a str, after: &'a str) -> Self {
        Self {
            event_type: "created",
            entity_type,
            entity_id,
            actor: ENGINE_ACTOR,
            before_state: None,
            after_state: Some(after),
        }
    }

    pub fn with_actor(mut self, actor: &'a str) -> Self {
        self.actor = actor;
        self
    }
}

/// Partition key for a timestamp, e.g. `2026-08`.
pub fn partition_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

/// Append one audit entry.
pub async fn record(pool: &SqlitePool, event: AuditEvent<'_>) -> Result<(), AuditError> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO audit_entries
            (event_type, entity_type, entity_id, actor, before_state, after_state,
             partition_key, timestamp)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(event.event_type)
    .bind(event.entity_type)
    .bind(event.entity_id)
    .bind(event.actor)
    .bind(event.before_state)
    .bind(event.after_state)
    .bind(partition_key(now))
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// All entries for one entity, oldest first. Read helper for review
/// tooling and tests; no processing decision ever depends on the log.
pub async fn entries_for(
    pool: &SqlitePool,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<AuditEntry>, AuditError> {
    let entries = sqlx::query_as::<_, AuditEntry>(
        r#"
        SELECT id, event_type, entity_type, entity_id, actor, before_state,
               after_state, partition_key, timestamp
        FROM audit_entries
        WHERE entity_type = ?1 AND entity_id = ?2
        ORDER BY id ASC
        "#,
    )
    .bind(entity_type)
    .bind(entity_id)
    .fetch_all(pool)
    .await?;
    Ok(entries)
}

/// Drop whole partitions older than the given `YYYY-MM` key. Retention
/// is an operator-driven decision; workers never purge on their own.
pub async fn purge_partitions_before(
    pool: &SqlitePool,
    partition: &str,
) -> Result<u64, AuditError> {
    let result = sqlx::query("DELETE FROM audit_entries WHERE partition_key < ?1")
        .bind(partition)
        .execute(pool)
        .await?;
    let purged = result.rows_affected();
    if purged > 0 {
        tracing::info!(partition, purged, "purged audit partitions");
    }
    Ok(purged)
}
