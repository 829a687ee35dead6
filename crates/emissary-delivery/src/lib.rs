//! Outbox dispatch and idempotent event delivery.
//!
//! Implements the delivery half of the transactional-outbox pattern: a
//! polling dispatcher drains pending outbox rows onto a job queue, and a
//! queue worker dispatches each event to every registered handler exactly
//! once per handler, witnessed by the idempotency ledger.
//!
//! # Pipeline
//!
//! ```text
//! ┌──────────────┐ claim (SKIP LOCKED) ┌───────────────┐  enqueue   ┌───────────┐
//! │ event_outbox │────────────────────▶│  Dispatcher   │───────────▶│ JobQueue  │
//! └──────────────┘                     └───────────────┘  job id =  └───────────┘
//!        ▲                                                 event id        │
//!        │ same transaction                                                ▼
//! ┌──────────────┐                     ┌───────────────┐  invoke    ┌───────────┐
//! │ write path   │                     │  QueueWorker  │◀───────────│ JobLease  │
//! └──────────────┘                     └───────┬───────┘            └───────────┘
//!                                              │ ledger-gated fan-out
//!                                              ▼
//!                                      ┌───────────────┐
//!                                      │   Handlers    │  (audit sink, ...)
//!                                      └───────────────┘
//! ```
//!
//! Key properties:
//! - **No lost events**: outbox rows are written in the same transaction as
//!   entity state, then delivered with capped exponential retries.
//! - **Per-handler exactly-once effect**: the `(event id, handler name)`
//!   ledger row is the witness; redelivery skips completed handlers.
//! - **Lock-free claiming**: `FOR UPDATE SKIP LOCKED` lets concurrent
//!   dispatcher processes claim disjoint rows.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod dispatcher;
pub mod error;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod storage;
pub mod worker;

pub use audit::AuditHandler;
pub use dispatcher::{DispatcherConfig, OutboxDispatcher};
pub use error::{DispatchError, Result};
pub use queue::{
    memory::InMemoryQueue, EnqueueOutcome, FailedJob, JobConsumer, JobLease, JobQueue, QueueJob,
};
pub use registry::{EventHandler, HandlerEvent, HandlerRegistry, RegistryBuilder};
pub use retry::{RetryDecision, RetryPolicy};
pub use storage::{
    AuditStorage, DispatchStorage, PostgresAuditStorage, PostgresDispatchStorage,
    PostgresWorkerStorage, WorkerStorage,
};
pub use worker::{QueueWorker, WorkerConfig};

/// Default outbox rows claimed per dispatcher tick.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default dispatcher polling period.
pub const DEFAULT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Default interval after which a claimed-but-unfinished row is reclaimable.
pub const DEFAULT_CLAIM_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Default bound on concurrent handler invocations per job.
pub const DEFAULT_HANDLER_CONCURRENCY: usize = 4;
