//! Repository for action aggregate state rows.
//!
//! State writes are guarded by the optimistic version: an update applies
//! only when the stored version still equals the version the caller loaded.
//! The `_in_tx` variants run inside the command write path so state, events,
//! and outbox rows commit together.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{domain::Action, error::Result};

const ROW_COLUMNS: &str = "id, name, description, status, cancel_reason, version, \
     created_at, updated_at, completed_at, cancelled_at";

/// Repository for action state operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a freshly created action inside `tx`.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        action: &Action,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO actions (
                id, name, description, status, cancel_reason, version,
                created_at, updated_at, completed_at, cancelled_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(action.id)
        .bind(&action.name)
        .bind(&action.description)
        .bind(action.status)
        .bind(&action.cancel_reason)
        .bind(action.version)
        .bind(action.created_at)
        .bind(action.updated_at)
        .bind(action.completed_at)
        .bind(action.cancelled_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Writes a transitioned action inside `tx`, guarded by the version the
    /// caller loaded.
    ///
    /// Returns `false` when no row matched, meaning a concurrent writer won
    /// the race; the caller surfaces this as an optimistic-lock failure.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn update_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        action: &Action,
        expected_version: i32,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE actions
            SET name = $1, description = $2, status = $3, cancel_reason = $4,
                version = $5, updated_at = $6, completed_at = $7, cancelled_at = $8
            WHERE id = $9 AND version = $10
            "#,
        )
        .bind(&action.name)
        .bind(&action.description)
        .bind(action.status)
        .bind(&action.cancel_reason)
        .bind(action.version)
        .bind(action.updated_at)
        .bind(action.completed_at)
        .bind(action.cancelled_at)
        .bind(action.id)
        .bind(expected_version)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Finds an action by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Action>> {
        let action = sqlx::query_as::<_, Action>(&format!(
            "SELECT {ROW_COLUMNS} FROM actions WHERE id = $1",
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(action)
    }

    /// Finds an action by id inside `tx`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Option<Action>> {
        let action = sqlx::query_as::<_, Action>(&format!(
            "SELECT {ROW_COLUMNS} FROM actions WHERE id = $1",
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(action)
    }
}
