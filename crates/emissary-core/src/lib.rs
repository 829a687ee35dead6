//! Core domain model for the Emissary event delivery service.
//!
//! Provides the error taxonomy, strongly-typed identifiers, domain events,
//! request-context propagation, the aggregate root protocol, and the
//! transactional write path that persists entity state together with its
//! events and outbox rows. All other crates depend on these foundational
//! types for type safety and consistency.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregate;
pub mod commands;
pub mod context;
pub mod domain;
pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use commands::{Command, CommandExecutor, CommandMetadata, CommandOutcome};
pub use context::RequestContext;
pub use error::{CoreError, DomainError, DomainResult, ErrorKind, Result};
pub use models::{
    Actor, AuditRecord, DomainEvent, EventId, EventMetadata, FieldChange, NewEvent, OutboxCounts,
    OutboxEntry, OutboxEnvelope, OutboxId, OutboxStatus, ProcessedEvent,
};
pub use time::{Clock, RealClock};
