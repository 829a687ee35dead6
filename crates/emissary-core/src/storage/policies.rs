//! Repository for policy aggregate state rows.
//!
//! Same optimistic-version discipline as the actions repository: updates
//! apply only when the stored version matches what the caller loaded.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{domain::Policy, error::Result};

const ROW_COLUMNS: &str = "id, name, rules, status, suspend_reason, revoke_reason, revoked_by, \
     version, created_at, updated_at, activated_at, revoked_at";

/// Repository for policy state operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a freshly created policy inside `tx`.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        policy: &Policy,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO policies (
                id, name, rules, status, suspend_reason, revoke_reason, revoked_by,
                version, created_at, updated_at, activated_at, revoked_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(policy.id)
        .bind(&policy.name)
        .bind(&policy.rules)
        .bind(policy.status)
        .bind(&policy.suspend_reason)
        .bind(&policy.revoke_reason)
        .bind(&policy.revoked_by)
        .bind(policy.version)
        .bind(policy.created_at)
        .bind(policy.updated_at)
        .bind(policy.activated_at)
        .bind(policy.revoked_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Writes a transitioned policy inside `tx`, guarded by the version the
    /// caller loaded. Returns `false` when a concurrent writer won the race.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn update_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        policy: &Policy,
        expected_version: i32,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE policies
            SET name = $1, rules = $2, status = $3, suspend_reason = $4,
                revoke_reason = $5, revoked_by = $6, version = $7, updated_at = $8,
                activated_at = $9, revoked_at = $10
            WHERE id = $11 AND version = $12
            "#,
        )
        .bind(&policy.name)
        .bind(&policy.rules)
        .bind(policy.status)
        .bind(&policy.suspend_reason)
        .bind(&policy.revoke_reason)
        .bind(&policy.revoked_by)
        .bind(policy.version)
        .bind(policy.updated_at)
        .bind(policy.activated_at)
        .bind(policy.revoked_at)
        .bind(policy.id)
        .bind(expected_version)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Finds a policy by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Policy>> {
        let policy = sqlx::query_as::<_, Policy>(&format!(
            "SELECT {ROW_COLUMNS} FROM policies WHERE id = $1",
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(policy)
    }

    /// Finds a policy by id inside `tx`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Option<Policy>> {
        let policy = sqlx::query_as::<_, Policy>(&format!(
            "SELECT {ROW_COLUMNS} FROM policies WHERE id = $1",
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(policy)
    }
}
