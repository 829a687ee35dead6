//! Domain models and strongly-typed identifiers.
//!
//! Defines domain events, outbox entries, the processed-event ledger row,
//! audit records, and newtype ID wrappers for compile-time type safety.
//! Includes database serialization traits for the delivery pipeline.

use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed domain event identifier.
///
/// Wraps a UUIDv7 so event ids sort lexicographically by creation time.
/// Events are immutable once created, and this ID follows them through the
/// outbox, the queue, and the idempotency ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Creates a new time-ordered event ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for EventId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for EventId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed outbox entry identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutboxId(pub Uuid);

impl OutboxId {
    /// Creates a new time-ordered outbox entry ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for OutboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OutboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl sqlx::Type<PgDb> for OutboxId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for OutboxId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for OutboxId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Identity of the caller responsible for a state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Stable actor identifier.
    pub id: String,

    /// Actor email address.
    pub email: String,

    /// Owning account, when the actor belongs to one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

impl Actor {
    /// Creates an actor from id and email.
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self { id: id.into(), email: email.into(), account_id: None }
    }

    /// Sentinel actor for background work with no originating caller.
    pub fn system() -> Self {
        Self { id: "system".to_string(), email: "system@emissary.internal".to_string(), account_id: None }
    }

    /// Returns true if this is the background sentinel actor.
    pub fn is_system(&self) -> bool {
        self.id == "system"
    }
}

/// Metadata attached to every domain event at production time.
///
/// Travels with the event through the outbox payload so dispatch and handler
/// invocation never need to re-read the event row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Identifier shared by everything triggered by one original request.
    pub correlation_id: String,

    /// Id of the command or event that caused this one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// Caller responsible for the change.
    pub actor: Actor,

    /// Timestamp assigned by the producer, before persistence.
    pub produced_at: DateTime<Utc>,

    /// Schema version of the event payload.
    pub schema_version: i32,

    /// Pass-through fields not interpreted by the core.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// An event produced by an aggregate but not yet persisted.
///
/// Aggregates return these from state-changing operations; the write path
/// assigns ids and timestamps when it persists them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    /// Dotted, past-tense event type name, e.g. `policy.activated`.
    pub event_type: String,

    /// Schema version of the payload, starting at 1.
    pub schema_version: i32,

    /// Immutable event payload.
    pub payload: serde_json::Value,
}

impl NewEvent {
    /// Creates a version-1 event of the given type.
    pub fn v1(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self { event_type: event_type.into(), schema_version: 1, payload }
    }
}

/// A persisted domain event: an immutable, past-tense fact.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DomainEvent {
    /// Unique, time-ordered identifier.
    pub id: EventId,

    /// Short name of the producing aggregate type, e.g. `policy`.
    pub aggregate_type: String,

    /// Identifier of the producing aggregate instance.
    pub aggregate_id: String,

    /// Dotted, past-tense event type name.
    pub event_type: String,

    /// Schema version of the payload.
    pub event_version: i32,

    /// Immutable event payload.
    pub payload: sqlx::types::Json<serde_json::Value>,

    /// Correlation, causation, actor, and producer timestamp.
    pub metadata: sqlx::types::Json<EventMetadata>,

    /// Timestamp assigned at persistence.
    pub occurred_at: DateTime<Utc>,
}

/// Outbox entry lifecycle status.
///
/// ```text
/// pending -> processing -> completed
///        ^--------------'-> failed (after max retries)
/// ```
///
/// `completed` and `failed` are terminal; only operator action may reset a
/// failed row to pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Awaiting claim by a dispatcher tick.
    Pending,

    /// Claimed by a dispatcher; reclaimable once `next_retry_at` elapses.
    Processing,

    /// Enqueued on the external queue. Terminal.
    Completed,

    /// Enqueue failed after exhausting retries. Terminal, kept for operators.
    Failed,
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl sqlx::Type<PgDb> for OutboxStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for OutboxStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid outbox status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for OutboxStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Denormalized payload stored on each outbox row.
///
/// Captures the full event payload plus metadata so dispatch never re-reads
/// the event row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEnvelope {
    /// Original event payload.
    pub payload: serde_json::Value,

    /// Original event metadata.
    pub metadata: EventMetadata,
}

/// An event awaiting delivery to the external queue.
///
/// Inserted in the same transaction as its domain event. The dispatcher owns
/// all status transitions and retry scheduling.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxEntry {
    /// Unique identifier for this entry.
    pub id: OutboxId,

    /// Domain event this entry delivers.
    pub event_id: EventId,

    /// Denormalized routing field.
    pub event_type: String,

    /// Denormalized routing field.
    pub aggregate_type: String,

    /// Denormalized routing field.
    pub aggregate_id: String,

    /// Event payload plus metadata envelope.
    pub payload: sqlx::types::Json<OutboxEnvelope>,

    /// Current delivery status.
    pub status: OutboxStatus,

    /// Failed enqueue attempts so far.
    pub retry_count: i32,

    /// Attempts allowed before the entry turns `failed`.
    pub max_retries: i32,

    /// Most recent enqueue error, empty when none occurred.
    pub last_error: Option<String>,

    /// When the entry was inserted.
    pub created_at: DateTime<Utc>,

    /// When the entry reached `completed`.
    pub processed_at: Option<DateTime<Utc>>,

    /// Earliest time the next attempt may run.
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// Returns true if this entry has exhausted its enqueue attempts.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Outbox row counts by status, exposed to health checks and operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxCounts {
    /// Rows awaiting a dispatcher claim.
    pub pending: i64,
    /// Rows claimed by a dispatcher tick.
    pub processing: i64,
    /// Rows enqueued on the external queue.
    pub completed: i64,
    /// Rows that exhausted their enqueue attempts.
    pub failed: i64,
}

/// Ledger row witnessing that a handler completed for an event.
///
/// `(event_id, handler_name)` is unique; the row is never updated.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcessedEvent {
    /// Unique identifier for this ledger row.
    pub id: Uuid,

    /// Event the handler processed.
    pub event_id: EventId,

    /// Name of the completing handler.
    pub handler_name: String,

    /// When the handler finished.
    pub processed_at: DateTime<Utc>,
}

/// Before/after pair for a single audited field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    /// Value before the change.
    pub from: serde_json::Value,

    /// Value after the change.
    pub to: serde_json::Value,
}

/// Actor details captured on audit rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditActor {
    /// Stable actor identifier.
    pub id: String,

    /// Actor email address.
    pub email: String,

    /// Source address when the change came from a network caller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    /// Client user agent when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl From<&Actor> for AuditActor {
    fn from(actor: &Actor) -> Self {
        Self { id: actor.id.clone(), email: actor.email.clone(), ip: None, user_agent: None }
    }
}

/// Immutable audit trail row. Insert-only; never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditRecord {
    /// Unique identifier for this row.
    pub id: Uuid,

    /// Correlation id of the originating request.
    pub correlation_id: String,

    /// Audited entity type, e.g. `policy`.
    pub entity_type: String,

    /// Audited entity identifier.
    pub entity_id: String,

    /// Normalized action name, e.g. `create`, `activate`.
    pub action: String,

    /// Actor responsible for the change.
    pub actor: sqlx::types::Json<AuditActor>,

    /// Entity snapshot before the change, when the event carried one.
    pub before_snapshot: Option<sqlx::types::Json<serde_json::Value>>,

    /// Entity snapshot after the change.
    pub after_snapshot: Option<sqlx::types::Json<serde_json::Value>>,

    /// Field-level change map.
    pub changes: sqlx::types::Json<HashMap<String, FieldChange>>,

    /// Original event metadata.
    pub metadata: sqlx::types::Json<serde_json::Value>,

    /// When the audited event occurred.
    pub occurred_at: DateTime<Utc>,
}

/// Audit row content prior to insertion.
#[derive(Debug, Clone)]
pub struct NewAuditRecord {
    /// Correlation id of the originating request.
    pub correlation_id: String,
    /// Audited entity type.
    pub entity_type: String,
    /// Audited entity identifier.
    pub entity_id: String,
    /// Normalized action name.
    pub action: String,
    /// Actor responsible for the change.
    pub actor: AuditActor,
    /// Snapshot before the change.
    pub before_snapshot: Option<serde_json::Value>,
    /// Snapshot after the change.
    pub after_snapshot: Option<serde_json::Value>,
    /// Field-level change map.
    pub changes: HashMap<String, FieldChange>,
    /// Original event metadata.
    pub metadata: serde_json::Value,
    /// When the audited event occurred.
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_ids_sort_by_creation_time() {
        // Millisecond gaps guarantee distinct UUIDv7 timestamp prefixes.
        let ids: Vec<EventId> = (0..4)
            .map(|_| {
                std::thread::sleep(std::time::Duration::from_millis(2));
                EventId::new()
            })
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted, "UUIDv7 ids should sort by creation time");
    }

    #[test]
    fn outbox_status_display_format() {
        assert_eq!(OutboxStatus::Pending.to_string(), "pending");
        assert_eq!(OutboxStatus::Processing.to_string(), "processing");
        assert_eq!(OutboxStatus::Completed.to_string(), "completed");
        assert_eq!(OutboxStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn system_actor_is_sentinel() {
        let actor = Actor::system();
        assert!(actor.is_system());
        assert!(!Actor::new("u1", "u1@example.com").is_system());
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let envelope = OutboxEnvelope {
            payload: serde_json::json!({"name": "P"}),
            metadata: EventMetadata {
                correlation_id: "c1".into(),
                causation_id: None,
                actor: Actor::new("u1", "u1@example.com"),
                produced_at: Utc::now(),
                schema_version: 1,
                extra: serde_json::Map::new(),
            },
        };

        let json = serde_json::to_value(&envelope).expect("serialize envelope");
        let back: OutboxEnvelope = serde_json::from_value(json).expect("deserialize envelope");
        assert_eq!(back, envelope);
    }
}
