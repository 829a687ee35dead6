//! Handler registry: event type -> ordered handler list.
//!
//! Handlers are registered explicitly at startup through [`RegistryBuilder`];
//! there is no discovery or reflection. The builder fails loudly on a
//! duplicate handler name or a subscription to an unknown event type, so
//! wiring mistakes surface at boot instead of as silently-dropped events.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use emissary_core::models::{EventId, EventMetadata};

use crate::error::{DispatchError, Result};
use crate::queue::QueueJob;

/// An event as seen by handlers: reconstructed from a queue job, never
/// re-read from the event log.
#[derive(Debug, Clone)]
pub struct HandlerEvent {
    /// Event identifier.
    pub id: EventId,

    /// Dotted event type name.
    pub event_type: String,

    /// Producing aggregate type.
    pub aggregate_type: String,

    /// Producing aggregate instance.
    pub aggregate_id: String,

    /// Event payload.
    pub payload: serde_json::Value,

    /// Original event metadata.
    pub metadata: EventMetadata,
}

impl From<QueueJob> for HandlerEvent {
    fn from(job: QueueJob) -> Self {
        Self {
            id: job.event_id,
            event_type: job.event_type,
            aggregate_type: job.aggregate_type,
            aggregate_id: job.aggregate_id,
            payload: job.payload.payload,
            metadata: job.payload.metadata,
        }
    }
}

/// A reaction to domain events with an idempotent side effect.
///
/// Handlers must tolerate redelivery: the worker skips handlers already
/// witnessed by the ledger, but a crash between side effect and ledger
/// insert means `invoke` can run again for the same event. Handlers writing
/// to external systems must be idempotent by natural key.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Unique handler name, recorded in the idempotency ledger.
    fn name(&self) -> &str;

    /// Event types this handler subscribes to.
    fn event_types(&self) -> Vec<String>;

    /// Performs the side effect for one event.
    async fn invoke(&self, event: &HandlerEvent) -> Result<()>;
}

/// Immutable mapping from event type to ordered handler list.
///
/// Populated once at startup and shared read-only across worker tasks.
pub struct HandlerRegistry {
    by_type: HashMap<String, Vec<Arc<dyn EventHandler>>>,
    handler_count: usize,
}

impl HandlerRegistry {
    /// Starts building a registry validated against the domain event types.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Handlers subscribed to `event_type`, in registration order.
    pub fn handlers_for(&self, event_type: &str) -> &[Arc<dyn EventHandler>] {
        self.by_type.get(event_type).map_or(&[], Vec::as_slice)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handler_count
    }

    /// Returns true if no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handler_count == 0
    }
}

/// Deterministic registry assembly with fail-loud validation.
pub struct RegistryBuilder {
    known_types: Vec<String>,
    names: Vec<String>,
    by_type: HashMap<String, Vec<Arc<dyn EventHandler>>>,
}

impl RegistryBuilder {
    /// Creates a builder accepting subscriptions to the domain event types.
    pub fn new() -> Self {
        Self::with_known_types(emissary_core::domain::EVENT_TYPES.iter().map(|s| s.to_string()))
    }

    /// Creates a builder with a custom set of known event types.
    pub fn with_known_types(known_types: impl IntoIterator<Item = String>) -> Self {
        Self {
            known_types: known_types.into_iter().collect(),
            names: Vec::new(),
            by_type: HashMap::new(),
        }
    }

    /// Registers a handler for every event type it subscribes to.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the handler name is already
    /// registered, the handler subscribes to nothing, or any subscribed
    /// type is unknown.
    pub fn register(mut self, handler: Arc<dyn EventHandler>) -> Result<Self> {
        let name = handler.name().to_string();
        if self.names.contains(&name) {
            return Err(DispatchError::configuration(format!(
                "duplicate handler name '{name}'"
            )));
        }

        let event_types = handler.event_types();
        if event_types.is_empty() {
            return Err(DispatchError::configuration(format!(
                "handler '{name}' subscribes to no event types"
            )));
        }

        for event_type in &event_types {
            if !self.known_types.contains(event_type) {
                return Err(DispatchError::configuration(format!(
                    "handler '{name}' subscribes to unknown event type '{event_type}'"
                )));
            }
        }

        self.names.push(name);
        for event_type in event_types {
            self.by_type.entry(event_type).or_default().push(handler.clone());
        }

        Ok(self)
    }

    /// Finalizes the registry.
    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry { by_type: self.by_type, handler_count: self.names.len() }
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubHandler {
        name: &'static str,
        types: Vec<String>,
    }

    impl StubHandler {
        fn new(name: &'static str, types: &[&str]) -> Arc<Self> {
            Arc::new(Self { name, types: types.iter().map(|s| s.to_string()).collect() })
        }
    }

    #[async_trait]
    impl EventHandler for StubHandler {
        fn name(&self) -> &str {
            self.name
        }

        fn event_types(&self) -> Vec<String> {
            self.types.clone()
        }

        async fn invoke(&self, _event: &HandlerEvent) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn registers_handlers_in_order() {
        let registry = HandlerRegistry::builder()
            .register(StubHandler::new("first", &["policy.created"]))
            .and_then(|b| b.register(StubHandler::new("second", &["policy.created"])))
            .expect("registration should succeed")
            .build();

        let handlers = registry.handlers_for("policy.created");
        assert_eq!(handlers.len(), 2);
        assert_eq!(handlers[0].name(), "first");
        assert_eq!(handlers[1].name(), "second");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn duplicate_handler_name_rejected() {
        let err = HandlerRegistry::builder()
            .register(StubHandler::new("audit", &["policy.created"]))
            .and_then(|b| b.register(StubHandler::new("audit", &["action.created"])))
            .err()
            .expect("duplicate registration must fail");

        match err {
            DispatchError::ConfigurationError { message } => {
                assert!(message.contains("duplicate handler name 'audit'"));
            },
            other => unreachable!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_event_type_rejected() {
        let err = HandlerRegistry::builder()
            .register(StubHandler::new("audit", &["policy.minted"]))
            .err()
            .expect("unknown event type must fail");

        match err {
            DispatchError::ConfigurationError { message } => {
                assert!(message.contains("unknown event type 'policy.minted'"));
            },
            other => unreachable!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn empty_subscription_rejected() {
        let result = HandlerRegistry::builder().register(StubHandler::new("idle", &[]));
        assert!(matches!(result, Err(DispatchError::ConfigurationError { .. })));
    }

    #[test]
    fn unsubscribed_type_has_no_handlers() {
        let registry = HandlerRegistry::builder()
            .register(StubHandler::new("audit", &["policy.created"]))
            .expect("registration should succeed")
            .build();

        assert!(registry.handlers_for("action.created").is_empty());
        assert!(!registry.is_empty());
    }
}
