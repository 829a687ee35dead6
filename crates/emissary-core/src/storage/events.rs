//! Repository for the append-only domain event log.
//!
//! Events and their outbox rows are always written together, inside the
//! caller's transaction, so a committed aggregate write implies both exist.
//! The log is never updated or deleted by the core.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{
        DomainEvent, EventId, EventMetadata, NewEvent, OutboxEnvelope, OutboxId, OutboxStatus,
    },
};

/// Default number of enqueue attempts before an outbox entry turns `failed`.
pub const DEFAULT_MAX_RETRIES: i32 = 5;

/// Repository for domain event persistence.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Persists events and their outbox rows inside `tx`.
    ///
    /// For each event, one row is inserted into the event log and one into
    /// the outbox with status `pending`, zero retries, and no retry
    /// schedule. The outbox payload captures the full event payload plus
    /// metadata so dispatch never re-reads the event row. Returns the
    /// generated event ids in input order.
    ///
    /// No external I/O happens here; queue contact is the dispatcher's job.
    ///
    /// # Errors
    ///
    /// Returns error if any insert fails; the caller's transaction aborts.
    pub async fn persist_with_outbox(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        aggregate_type: &str,
        aggregate_id: &str,
        events: &[NewEvent],
        metadata: &EventMetadata,
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<EventId>> {
        let mut ids = Vec::with_capacity(events.len());

        for event in events {
            let event_id = EventId::new();
            let event_metadata =
                EventMetadata { schema_version: event.schema_version, ..metadata.clone() };

            sqlx::query(
                r#"
                INSERT INTO domain_events (
                    id, aggregate_type, aggregate_id, event_type, event_version,
                    payload, metadata, occurred_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(event_id)
            .bind(aggregate_type)
            .bind(aggregate_id)
            .bind(&event.event_type)
            .bind(event.schema_version)
            .bind(sqlx::types::Json(&event.payload))
            .bind(sqlx::types::Json(&event_metadata))
            .bind(occurred_at)
            .execute(&mut **tx)
            .await?;

            let envelope =
                OutboxEnvelope { payload: event.payload.clone(), metadata: event_metadata };

            sqlx::query(
                r#"
                INSERT INTO event_outbox (
                    id, event_id, event_type, aggregate_type, aggregate_id,
                    payload, status, retry_count, max_retries, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, $9)
                "#,
            )
            .bind(OutboxId::new())
            .bind(event_id)
            .bind(&event.event_type)
            .bind(aggregate_type)
            .bind(aggregate_id)
            .bind(sqlx::types::Json(&envelope))
            .bind(OutboxStatus::Pending)
            .bind(DEFAULT_MAX_RETRIES)
            .bind(occurred_at)
            .execute(&mut **tx)
            .await?;

            ids.push(event_id);
        }

        Ok(ids)
    }

    /// Finds an event by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, event_id: EventId) -> Result<Option<DomainEvent>> {
        let event = sqlx::query_as::<_, DomainEvent>(
            r#"
            SELECT id, aggregate_type, aggregate_id, event_type, event_version,
                   payload, metadata, occurred_at
            FROM domain_events
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(event)
    }

    /// Finds all events for one aggregate, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Vec<DomainEvent>> {
        let events = sqlx::query_as::<_, DomainEvent>(
            r#"
            SELECT id, aggregate_type, aggregate_id, event_type, event_version,
                   payload, metadata, occurred_at
            FROM domain_events
            WHERE aggregate_type = $1 AND aggregate_id = $2
            ORDER BY occurred_at ASC, id ASC
            "#,
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(events)
    }

    /// Finds all events sharing a correlation id, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_correlation(&self, correlation_id: &str) -> Result<Vec<DomainEvent>> {
        let events = sqlx::query_as::<_, DomainEvent>(
            r#"
            SELECT id, aggregate_type, aggregate_id, event_type, event_version,
                   payload, metadata, occurred_at
            FROM domain_events
            WHERE metadata->>'correlation_id' = $1
            ORDER BY occurred_at ASC, id ASC
            "#,
        )
        .bind(correlation_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(events)
    }

    /// Counts events recorded for one aggregate.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_for_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM domain_events WHERE aggregate_type = $1 AND aggregate_id = $2",
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .fetch_one(&*self.pool)
        .await?;

        Ok(count.0)
    }
}
