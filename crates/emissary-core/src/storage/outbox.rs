//! Repository for outbox entries awaiting delivery to the external queue.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` so concurrent dispatcher processes
//! claim disjoint rows without blocking each other. The dispatcher owns all
//! status transitions; completed and failed rows stay put until an operator
//! prunes or resets them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{EventId, OutboxCounts, OutboxEntry, OutboxId, OutboxStatus},
};

const ENTRY_COLUMNS: &str = "id, event_id, event_type, aggregate_type, aggregate_id, \
     payload, status, retry_count, max_retries, last_error, \
     created_at, processed_at, next_retry_at";

/// Repository for outbox entry operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Claims due entries for one dispatcher tick.
    ///
    /// Selects up to `batch_size` rows that are pending, or processing with
    /// an elapsed retry deadline (a crashed claimant's rows become
    /// reclaimable this way), that still have attempts left. Rows are locked
    /// with `FOR UPDATE SKIP LOCKED`, marked `processing`, and given a fresh
    /// reclaim deadline of `now + claim_timeout`, all in one short
    /// transaction. Returned entries are ordered by creation time.
    ///
    /// # Errors
    ///
    /// Returns error if the claim transaction fails.
    pub async fn claim_due(
        &self,
        batch_size: usize,
        claim_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEntry>> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<OutboxId> = sqlx::query_scalar(
            r#"
            SELECT id FROM event_outbox
            WHERE ((status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= $1))
               OR (status = 'processing' AND next_retry_at < $1))
              AND retry_count < max_retries
            ORDER BY created_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let reclaim_at = now
            + chrono::Duration::from_std(claim_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));

        let mut entries = sqlx::query_as::<_, OutboxEntry>(&format!(
            r#"
            UPDATE event_outbox
            SET status = 'processing', next_retry_at = $2
            WHERE id = ANY($1)
            RETURNING {ENTRY_COLUMNS}
            "#,
        ))
        .bind(ids.iter().map(|id| id.0).collect::<Vec<_>>())
        .bind(reclaim_at)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        // UPDATE .. RETURNING does not preserve selection order.
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.0.cmp(&b.id.0)));

        Ok(entries)
    }

    /// Marks an entry delivered to the queue. Terminal.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_completed(&self, id: OutboxId, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE event_outbox
            SET status = 'completed', processed_at = $1, next_retry_at = NULL
            WHERE id = $2
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Records a failed enqueue attempt.
    ///
    /// With `next_retry_at` set, the entry returns to `pending` and is
    /// retried once the deadline passes. With `None`, the entry enters the
    /// terminal `failed` state and persists for operator inspection.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_failed(
        &self,
        id: OutboxId,
        retry_count: i32,
        next_retry_at: Option<DateTime<Utc>>,
        last_error: &str,
    ) -> Result<()> {
        let status =
            if next_retry_at.is_some() { OutboxStatus::Pending } else { OutboxStatus::Failed };

        sqlx::query(
            r#"
            UPDATE event_outbox
            SET status = $1, retry_count = $2, next_retry_at = $3, last_error = $4
            WHERE id = $5
            "#,
        )
        .bind(status)
        .bind(retry_count)
        .bind(next_retry_at)
        .bind(last_error)
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Resets a failed entry to pending. Operator intervention only.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn retry_failed(&self, id: OutboxId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE event_outbox
            SET status = 'pending', retry_count = 0, next_retry_at = NULL, last_error = NULL
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Finds an entry by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: OutboxId) -> Result<Option<OutboxEntry>> {
        let entry = sqlx::query_as::<_, OutboxEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM event_outbox WHERE id = $1",
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(entry)
    }

    /// Finds the entry for a domain event.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_event(&self, event_id: EventId) -> Result<Option<OutboxEntry>> {
        let entry = sqlx::query_as::<_, OutboxEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM event_outbox WHERE event_id = $1",
        ))
        .bind(event_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(entry)
    }

    /// Returns per-status row counts for the operator surface.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn counts(&self) -> Result<OutboxCounts> {
        let rows: Vec<(OutboxStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM event_outbox GROUP BY status")
                .fetch_all(&*self.pool)
                .await?;

        let mut counts = OutboxCounts::default();
        for (status, count) in rows {
            match status {
                OutboxStatus::Pending => counts.pending = count,
                OutboxStatus::Processing => counts.processing = count,
                OutboxStatus::Completed => counts.completed = count,
                OutboxStatus::Failed => counts.failed = count,
            }
        }

        Ok(counts)
    }

    /// Deletes completed entries older than the given cutoff.
    ///
    /// The dispatcher never calls this; retention is an operator decision.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn prune_completed(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM event_outbox WHERE status = 'completed' AND processed_at < $1",
        )
        .bind(older_than)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
