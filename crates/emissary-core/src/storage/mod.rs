//! Database access layer implementing the repository pattern.
//!
//! Repositories translate between domain models and database schemas. All
//! database operations go through these repositories; direct SQL outside
//! this module is forbidden to keep the schema isolated from domain logic.

use std::sync::Arc;

use sqlx::PgPool;

pub mod actions;
pub mod audit;
pub mod events;
pub mod ledger;
pub mod outbox;
pub mod policies;

use crate::error::Result;

/// Container for all repository instances providing unified database access.
#[derive(Clone)]
pub struct Storage {
    /// Repository for the append-only domain event log.
    pub events: Arc<events::Repository>,

    /// Repository for outbox entries awaiting delivery.
    pub outbox: Arc<outbox::Repository>,

    /// Repository for the processed-event idempotency ledger.
    pub ledger: Arc<ledger::Repository>,

    /// Repository for the immutable audit trail.
    pub audit: Arc<audit::Repository>,

    /// Repository for action aggregate state rows.
    pub actions: Arc<actions::Repository>,

    /// Repository for policy aggregate state rows.
    pub policies: Arc<policies::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    ///
    /// All repositories share the same pool for efficient resource usage.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            events: Arc::new(events::Repository::new(pool.clone())),
            outbox: Arc::new(outbox::Repository::new(pool.clone())),
            ledger: Arc::new(ledger::Repository::new(pool.clone())),
            audit: Arc::new(audit::Repository::new(pool.clone())),
            actions: Arc::new(actions::Repository::new(pool.clone())),
            policies: Arc::new(policies::Repository::new(pool)),
        }
    }

    /// Performs a health check on the database connection.
    ///
    /// Executes a simple query to verify connectivity; used by liveness
    /// probes.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.events.pool()).await?;

        Ok(())
    }
}
