//! Repository for the processed-event idempotency ledger.
//!
//! One row per `(event_id, handler_name)` witnesses that a handler's side
//! effects persisted. The unique constraint is the sole correctness
//! mechanism: recording a duplicate succeeds silently.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::Result,
    models::{EventId, ProcessedEvent},
};

/// Repository for ledger operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns true if the handler already completed for this event.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn has(&self, event_id: EventId, handler_name: &str) -> Result<bool> {
        let exists: (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM processed_events
                WHERE event_id = $1 AND handler_name = $2
            )
            "#,
        )
        .bind(event_id)
        .bind(handler_name)
        .fetch_one(&*self.pool)
        .await?;

        Ok(exists.0)
    }

    /// Records handler completion with insert-if-absent semantics.
    ///
    /// A duplicate key means another delivery already recorded the work;
    /// that is success, not an error.
    ///
    /// # Errors
    ///
    /// Returns error only if the insert fails for a non-duplicate reason.
    pub async fn record(
        &self,
        event_id: EventId,
        handler_name: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO processed_events (id, event_id, handler_name, processed_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (event_id, handler_name) DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(event_id)
        .bind(handler_name)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Finds all ledger rows for an event.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_event(&self, event_id: EventId) -> Result<Vec<ProcessedEvent>> {
        let rows = sqlx::query_as::<_, ProcessedEvent>(
            r#"
            SELECT id, event_id, handler_name, processed_at
            FROM processed_events
            WHERE event_id = $1
            ORDER BY processed_at ASC
            "#,
        )
        .bind(event_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows)
    }
}
