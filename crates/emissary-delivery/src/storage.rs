//! Storage abstraction layer for the dispatcher and queue worker.
//!
//! Trait-based seams over the outbox, ledger, and audit tables so dispatch
//! and delivery logic are testable without a database. Production
//! implementations wrap the concrete `emissary_core::storage` repositories;
//! tests use the mock implementations in [`mock`].

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use emissary_core::{
    error::Result,
    models::{AuditRecord, EventId, NewAuditRecord, OutboxCounts, OutboxEntry, OutboxId},
    storage::Storage,
    time::Clock,
};

/// Storage operations required by the outbox dispatcher.
pub trait DispatchStorage: Send + Sync + 'static {
    /// Claims due outbox entries for one tick.
    ///
    /// Production uses `FOR UPDATE SKIP LOCKED` so concurrent dispatchers
    /// claim disjoint rows. Claimed rows are marked `processing` with a
    /// reclaim deadline of now + `claim_timeout`, and returned in creation
    /// order.
    fn claim_due(
        &self,
        batch_size: usize,
        claim_timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEntry>>> + Send + '_>>;

    /// Marks an entry enqueued. Terminal.
    fn mark_completed(
        &self,
        id: OutboxId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Records a failed enqueue attempt.
    ///
    /// With `next_retry_at` set the entry returns to `pending`; with `None`
    /// it enters the terminal `failed` state.
    fn mark_failed(
        &self,
        id: OutboxId,
        retry_count: i32,
        next_retry_at: Option<DateTime<Utc>>,
        last_error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Returns per-status outbox counts for the operator surface.
    fn counts(&self) -> Pin<Box<dyn Future<Output = Result<OutboxCounts>> + Send + '_>>;
}

/// Storage operations required by the queue worker.
pub trait WorkerStorage: Send + Sync + 'static {
    /// Returns true if the ledger witnesses `(event_id, handler_name)`.
    fn is_processed(
        &self,
        event_id: EventId,
        handler_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>>;

    /// Records handler completion with insert-if-absent semantics.
    /// A duplicate key is success.
    fn record_processed(
        &self,
        event_id: EventId,
        handler_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Storage operations required by the audit sink handler.
pub trait AuditStorage: Send + Sync + 'static {
    /// Inserts one immutable audit row.
    fn insert(
        &self,
        record: NewAuditRecord,
    ) -> Pin<Box<dyn Future<Output = Result<Uuid>> + Send + '_>>;

    /// Finds audit rows for one entity, oldest first.
    fn find_by_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<AuditRecord>>> + Send + '_>>;
}

/// Production dispatcher storage over PostgreSQL.
pub struct PostgresDispatchStorage {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
}

impl PostgresDispatchStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }
}

impl DispatchStorage for PostgresDispatchStorage {
    fn claim_due(
        &self,
        batch_size: usize,
        claim_timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEntry>>> + Send + '_>> {
        let storage = self.storage.clone();
        let now = self.clock.now_utc();
        Box::pin(async move { storage.outbox.claim_due(batch_size, claim_timeout, now).await })
    }

    fn mark_completed(
        &self,
        id: OutboxId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        let now = self.clock.now_utc();
        Box::pin(async move { storage.outbox.mark_completed(id, now).await })
    }

    fn mark_failed(
        &self,
        id: OutboxId,
        retry_count: i32,
        next_retry_at: Option<DateTime<Utc>>,
        last_error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.outbox.mark_failed(id, retry_count, next_retry_at, &last_error).await
        })
    }

    fn counts(&self) -> Pin<Box<dyn Future<Output = Result<OutboxCounts>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.outbox.counts().await })
    }
}

/// Production worker storage over PostgreSQL.
pub struct PostgresWorkerStorage {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
}

impl PostgresWorkerStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }
}

impl WorkerStorage for PostgresWorkerStorage {
    fn is_processed(
        &self,
        event_id: EventId,
        handler_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let storage = self.storage.clone();
        let handler_name = handler_name.to_string();
        Box::pin(async move { storage.ledger.has(event_id, &handler_name).await })
    }

    fn record_processed(
        &self,
        event_id: EventId,
        handler_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        let handler_name = handler_name.to_string();
        let now = self.clock.now_utc();
        Box::pin(async move { storage.ledger.record(event_id, &handler_name, now).await })
    }
}

/// Production audit storage over PostgreSQL.
pub struct PostgresAuditStorage {
    storage: Arc<Storage>,
}

impl PostgresAuditStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl AuditStorage for PostgresAuditStorage {
    fn insert(
        &self,
        record: NewAuditRecord,
    ) -> Pin<Box<dyn Future<Output = Result<Uuid>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.audit.insert(&record).await })
    }

    fn find_by_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<AuditRecord>>> + Send + '_>> {
        let storage = self.storage.clone();
        let entity_type = entity_type.to_string();
        let entity_id = entity_id.to_string();
        Box::pin(async move { storage.audit.find_by_entity(&entity_type, &entity_id).await })
    }
}

pub mod mock {
    //! In-memory storage implementations for testing.
    //!
    //! Deterministic stand-ins that honor the same status-machine and
    //! uniqueness semantics as the PostgreSQL repositories, with helpers
    //! for seeding entries and inspecting state.

    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;

    use chrono::Utc;
    use tokio::sync::RwLock;
    use uuid::Uuid;

    use emissary_core::error::CoreError;
    use emissary_core::models::{
        AuditRecord, EventId, NewAuditRecord, OutboxCounts, OutboxEntry, OutboxStatus,
    };

    use super::{
        AuditStorage, DateTime, DispatchStorage, Duration, Future, OutboxId, Pin, Result,
        WorkerStorage,
    };

    /// Mock outbox storage with the production claim semantics.
    #[derive(Default)]
    pub struct MockDispatchStorage {
        entries: Arc<RwLock<Vec<OutboxEntry>>>,
        claim_error: Arc<RwLock<Option<String>>>,
    }

    impl MockDispatchStorage {
        /// Creates empty mock storage.
        pub fn new() -> Self {
            Self::default()
        }

        /// Seeds a pending outbox entry.
        pub async fn add_entry(&self, entry: OutboxEntry) {
            self.entries.write().await.push(entry);
        }

        /// Injects an error for the next claim operation.
        pub async fn inject_claim_error(&self, error: impl Into<String>) {
            *self.claim_error.write().await = Some(error.into());
        }

        /// Returns the current status of an entry.
        pub async fn entry_status(&self, id: OutboxId) -> Option<OutboxStatus> {
            self.entries.read().await.iter().find(|e| e.id == id).map(|e| e.status)
        }

        /// Returns a full entry snapshot.
        pub async fn entry(&self, id: OutboxId) -> Option<OutboxEntry> {
            self.entries.read().await.iter().find(|e| e.id == id).cloned()
        }
    }

    impl DispatchStorage for MockDispatchStorage {
        fn claim_due(
            &self,
            batch_size: usize,
            claim_timeout: Duration,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEntry>>> + Send + '_>> {
            Box::pin(async move {
                if let Some(error) = self.claim_error.write().await.take() {
                    return Err(CoreError::Database(error));
                }

                let now = Utc::now();
                let reclaim_at = now
                    + chrono::Duration::from_std(claim_timeout)
                        .unwrap_or_else(|_| chrono::Duration::seconds(30));

                let mut entries = self.entries.write().await;
                let mut due: Vec<&mut OutboxEntry> = entries
                    .iter_mut()
                    .filter(|e| {
                        let reclaimable = e.status == OutboxStatus::Processing
                            && e.next_retry_at.is_some_and(|t| t < now);
                        let pending = e.status == OutboxStatus::Pending
                            && e.next_retry_at.is_none_or(|t| t <= now);
                        (pending || reclaimable) && e.retry_count < e.max_retries
                    })
                    .collect();
                due.sort_by_key(|e| e.created_at);

                let mut claimed = Vec::new();
                for entry in due.into_iter().take(batch_size) {
                    entry.status = OutboxStatus::Processing;
                    entry.next_retry_at = Some(reclaim_at);
                    claimed.push(entry.clone());
                }

                Ok(claimed)
            })
        }

        fn mark_completed(
            &self,
            id: OutboxId,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let mut entries = self.entries.write().await;
                if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
                    entry.status = OutboxStatus::Completed;
                    entry.processed_at = Some(Utc::now());
                    entry.next_retry_at = None;
                }
                Ok(())
            })
        }

        fn mark_failed(
            &self,
            id: OutboxId,
            retry_count: i32,
            next_retry_at: Option<DateTime<Utc>>,
            last_error: String,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let mut entries = self.entries.write().await;
                if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
                    entry.status = if next_retry_at.is_some() {
                        OutboxStatus::Pending
                    } else {
                        OutboxStatus::Failed
                    };
                    entry.retry_count = retry_count;
                    entry.next_retry_at = next_retry_at;
                    entry.last_error = Some(last_error);
                }
                Ok(())
            })
        }

        fn counts(&self) -> Pin<Box<dyn Future<Output = Result<OutboxCounts>> + Send + '_>> {
            Box::pin(async move {
                let entries = self.entries.read().await;
                let mut counts = OutboxCounts::default();
                for entry in entries.iter() {
                    match entry.status {
                        OutboxStatus::Pending => counts.pending += 1,
                        OutboxStatus::Processing => counts.processing += 1,
                        OutboxStatus::Completed => counts.completed += 1,
                        OutboxStatus::Failed => counts.failed += 1,
                    }
                }
                Ok(counts)
            })
        }
    }

    /// Mock ledger storage enforcing `(event_id, handler_name)` uniqueness.
    #[derive(Default)]
    pub struct MockWorkerStorage {
        ledger: Arc<RwLock<HashSet<(EventId, String)>>>,
        record_errors: Arc<RwLock<HashMap<String, String>>>,
    }

    impl MockWorkerStorage {
        /// Creates an empty mock ledger.
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes `record_processed` fail once for the given handler.
        pub async fn inject_record_error(&self, handler_name: &str, error: impl Into<String>) {
            self.record_errors.write().await.insert(handler_name.to_string(), error.into());
        }

        /// Returns all ledger rows for verification.
        pub async fn ledger_rows(&self) -> Vec<(EventId, String)> {
            let mut rows: Vec<_> = self.ledger.read().await.iter().cloned().collect();
            rows.sort();
            rows
        }
    }

    impl WorkerStorage for MockWorkerStorage {
        fn is_processed(
            &self,
            event_id: EventId,
            handler_name: &str,
        ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
            let key = (event_id, handler_name.to_string());
            Box::pin(async move { Ok(self.ledger.read().await.contains(&key)) })
        }

        fn record_processed(
            &self,
            event_id: EventId,
            handler_name: &str,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let key = (event_id, handler_name.to_string());
            Box::pin(async move {
                if let Some(error) = self.record_errors.write().await.remove(&key.1) {
                    return Err(CoreError::Database(error));
                }
                // Insert-if-absent: a duplicate is success.
                self.ledger.write().await.insert(key);
                Ok(())
            })
        }
    }

    /// Mock audit storage collecting insert-only rows.
    #[derive(Default)]
    pub struct MockAuditStorage {
        records: Arc<RwLock<Vec<AuditRecord>>>,
        fail_next: Arc<RwLock<Option<String>>>,
    }

    impl MockAuditStorage {
        /// Creates empty mock audit storage.
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes the next insert fail with the given error.
        pub async fn inject_insert_error(&self, error: impl Into<String>) {
            *self.fail_next.write().await = Some(error.into());
        }

        /// Returns all recorded rows in insertion order.
        pub async fn records(&self) -> Vec<AuditRecord> {
            self.records.read().await.clone()
        }
    }

    impl AuditStorage for MockAuditStorage {
        fn insert(
            &self,
            record: NewAuditRecord,
        ) -> Pin<Box<dyn Future<Output = Result<Uuid>> + Send + '_>> {
            Box::pin(async move {
                if let Some(error) = self.fail_next.write().await.take() {
                    return Err(CoreError::Database(error));
                }

                let id = Uuid::now_v7();
                self.records.write().await.push(AuditRecord {
                    id,
                    correlation_id: record.correlation_id,
                    entity_type: record.entity_type,
                    entity_id: record.entity_id,
                    action: record.action,
                    actor: sqlx::types::Json(record.actor),
                    before_snapshot: record.before_snapshot.map(sqlx::types::Json),
                    after_snapshot: record.after_snapshot.map(sqlx::types::Json),
                    changes: sqlx::types::Json(record.changes),
                    metadata: sqlx::types::Json(record.metadata),
                    occurred_at: record.occurred_at,
                });
                Ok(id)
            })
        }

        fn find_by_entity(
            &self,
            entity_type: &str,
            entity_id: &str,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<AuditRecord>>> + Send + '_>> {
            let entity_type = entity_type.to_string();
            let entity_id = entity_id.to_string();
            Box::pin(async move {
                let records = self.records.read().await;
                Ok(records
                    .iter()
                    .filter(|r| r.entity_type == entity_type && r.entity_id == entity_id)
                    .cloned()
                    .collect())
            })
        }
    }
}
