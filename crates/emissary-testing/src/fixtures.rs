//! Fixture builders for events, jobs, and outbox entries.
//!
//! One builder produces every representation of the same logical event, so
//! a test can seed the outbox, the queue, or a handler directly without
//! hand-assembling envelopes.

use chrono::{DateTime, Utc};
use serde_json::json;

use emissary_core::models::{
    Actor, EventId, EventMetadata, OutboxEntry, OutboxEnvelope, OutboxId, OutboxStatus,
};
use emissary_delivery::{HandlerEvent, QueueJob};

/// Builder for a test domain event and its derived shapes.
#[derive(Debug, Clone)]
pub struct EventFixture {
    event_id: EventId,
    event_type: String,
    aggregate_type: String,
    aggregate_id: String,
    payload: serde_json::Value,
    correlation_id: String,
    causation_id: Option<String>,
    actor: Actor,
    produced_at: DateTime<Utc>,
    extra: serde_json::Map<String, serde_json::Value>,
    max_retries: i32,
}

impl EventFixture {
    /// Starts a fixture for the given event type.
    ///
    /// Defaults: aggregate `policy`/`p1`, payload `{"name": "P"}`,
    /// correlation `c1`, actor `u1`.
    pub fn new(event_type: impl Into<String>) -> Self {
        let event_type = event_type.into();
        let aggregate_type =
            event_type.split('.').next().unwrap_or("policy").to_string();

        Self {
            event_id: EventId::new(),
            event_type,
            aggregate_type,
            aggregate_id: "p1".to_string(),
            payload: json!({"name": "P"}),
            correlation_id: "c1".to_string(),
            causation_id: None,
            actor: Actor::new("u1", "u1@example.com"),
            produced_at: Utc::now(),
            extra: serde_json::Map::new(),
            max_retries: 5,
        }
    }

    /// Sets the aggregate instance id.
    #[must_use]
    pub fn aggregate_id(mut self, aggregate_id: impl Into<String>) -> Self {
        self.aggregate_id = aggregate_id.into();
        self
    }

    /// Sets the event payload.
    #[must_use]
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Sets the acting user.
    #[must_use]
    pub fn actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    /// Sets the producer timestamp.
    #[must_use]
    pub fn produced_at(mut self, produced_at: DateTime<Utc>) -> Self {
        self.produced_at = produced_at;
        self
    }

    /// Marks the event for controlled-fault injection (see
    /// [`crate::FlakyHandler`]).
    #[must_use]
    pub fn simulate_failure(mut self) -> Self {
        self.extra.insert("simulate_failure".to_string(), json!(true));
        self
    }

    /// Sets an arbitrary metadata pass-through field.
    #[must_use]
    pub fn extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Overrides the outbox retry budget.
    #[must_use]
    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Returns the fixture's event id.
    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    /// Builds the event metadata.
    pub fn metadata(&self) -> EventMetadata {
        EventMetadata {
            correlation_id: self.correlation_id.clone(),
            causation_id: self.causation_id.clone(),
            actor: self.actor.clone(),
            produced_at: self.produced_at,
            schema_version: 1,
            extra: self.extra.clone(),
        }
    }

    /// Builds the queue job representation.
    pub fn queue_job(&self) -> QueueJob {
        QueueJob {
            event_id: self.event_id,
            event_type: self.event_type.clone(),
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
            payload: OutboxEnvelope { payload: self.payload.clone(), metadata: self.metadata() },
        }
    }

    /// Builds the handler-facing event representation.
    pub fn handler_event(&self) -> HandlerEvent {
        HandlerEvent::from(self.queue_job())
    }

    /// Builds a pending outbox entry for the event.
    pub fn outbox_entry(&self) -> OutboxEntry {
        OutboxEntry {
            id: OutboxId::new(),
            event_id: self.event_id,
            event_type: self.event_type.clone(),
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
            payload: sqlx::types::Json(OutboxEnvelope {
                payload: self.payload.clone(),
                metadata: self.metadata(),
            }),
            status: OutboxStatus::Pending,
            retry_count: 0,
            max_retries: self.max_retries,
            last_error: None,
            created_at: self.produced_at,
            processed_at: None,
            next_retry_at: None,
        }
    }
}
