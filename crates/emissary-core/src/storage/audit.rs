//! Repository for the immutable audit trail.
//!
//! Audit rows are insert-only: the core never updates or deletes them.

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::Result,
    models::{AuditRecord, NewAuditRecord},
};

const RECORD_COLUMNS: &str = "id, correlation_id, entity_type, entity_id, action, actor, \
     before_snapshot, after_snapshot, changes, metadata, occurred_at";

/// Repository for audit trail operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts one audit row and returns its id.
    ///
    /// Success means the row exists; failure bubbles up so queue-level
    /// retries engage.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn insert(&self, record: &NewAuditRecord) -> Result<Uuid> {
        let id = Uuid::now_v7();

        sqlx::query(
            r#"
            INSERT INTO audit_log (
                id, correlation_id, entity_type, entity_id, action, actor,
                before_snapshot, after_snapshot, changes, metadata, occurred_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(id)
        .bind(&record.correlation_id)
        .bind(&record.entity_type)
        .bind(&record.entity_id)
        .bind(&record.action)
        .bind(sqlx::types::Json(&record.actor))
        .bind(record.before_snapshot.as_ref().map(sqlx::types::Json))
        .bind(record.after_snapshot.as_ref().map(sqlx::types::Json))
        .bind(sqlx::types::Json(&record.changes))
        .bind(sqlx::types::Json(&record.metadata))
        .bind(record.occurred_at)
        .execute(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Finds audit rows for one entity, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditRecord>> {
        let records = sqlx::query_as::<_, AuditRecord>(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM audit_log
            WHERE entity_type = $1 AND entity_id = $2
            ORDER BY occurred_at ASC, id ASC
            "#,
        ))
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(records)
    }

    /// Finds audit rows sharing a correlation id, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_correlation(&self, correlation_id: &str) -> Result<Vec<AuditRecord>> {
        let records = sqlx::query_as::<_, AuditRecord>(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM audit_log
            WHERE correlation_id = $1
            ORDER BY occurred_at ASC, id ASC
            "#,
        ))
        .bind(correlation_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(records)
    }
}
