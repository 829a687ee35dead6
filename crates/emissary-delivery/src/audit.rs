//! Audit sink: the reference event handler.
//!
//! Produces one immutable audit row per event. The event type's past-tense
//! suffix maps to a normalized action name; status-transition events carry
//! `previous_status`/`status` in their payload, which become a synthetic
//! `changes` map. The event payload is the after-snapshot; events that do
//! not carry prior state leave the before-snapshot null.
//!
//! Writing the row is a single insert: success means the row exists, and
//! failure bubbles up so the queue and outbox retry ladders engage.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use emissary_core::models::{AuditActor, FieldChange, NewAuditRecord};

use crate::error::{DispatchError, Result};
use crate::registry::{EventHandler, HandlerEvent};
use crate::storage::AuditStorage;

/// Ledger name of the audit handler.
pub const AUDIT_HANDLER_NAME: &str = "audit";

/// Maps a dotted event type to its normalized audit action.
///
/// Returns `None` for suffixes outside the domain vocabulary; the registry
/// validates subscriptions, so reaching `None` at runtime indicates a new
/// event type was added without an action mapping.
pub fn audit_action(event_type: &str) -> Option<&'static str> {
    match event_type.rsplit('.').next()? {
        "created" => Some("create"),
        "updated" => Some("update"),
        "completed" => Some("complete"),
        "cancelled" => Some("cancel"),
        "activated" => Some("activate"),
        "suspended" => Some("suspend"),
        "resumed" => Some("resume"),
        "revoked" => Some("revoke"),
        _ => None,
    }
}

/// Handler writing one audit row per domain event.
pub struct AuditHandler {
    storage: Arc<dyn AuditStorage>,
}

impl AuditHandler {
    /// Creates an audit handler over the given storage.
    pub fn new(storage: Arc<dyn AuditStorage>) -> Self {
        Self { storage }
    }

    /// Builds the audit row content for one event.
    fn record_for(event: &HandlerEvent) -> Result<NewAuditRecord> {
        let action = audit_action(&event.event_type).ok_or_else(|| {
            DispatchError::configuration(format!(
                "no audit action mapping for event type '{}'",
                event.event_type
            ))
        })?;

        let mut changes: HashMap<String, FieldChange> = HashMap::new();
        if let (Some(previous), Some(current)) = (
            event.payload.get("previous_status"),
            event.payload.get("status"),
        ) {
            changes.insert(
                "status".to_string(),
                FieldChange { from: previous.clone(), to: current.clone() },
            );
        }

        let metadata = &event.metadata;
        let actor = AuditActor {
            id: metadata.actor.id.clone(),
            email: metadata.actor.email.clone(),
            ip: metadata.extra.get("ip").and_then(|v| v.as_str()).map(String::from),
            user_agent: metadata
                .extra
                .get("user_agent")
                .and_then(|v| v.as_str())
                .map(String::from),
        };

        Ok(NewAuditRecord {
            correlation_id: metadata.correlation_id.clone(),
            entity_type: event.aggregate_type.clone(),
            entity_id: event.aggregate_id.clone(),
            action: action.to_string(),
            actor,
            before_snapshot: None,
            after_snapshot: Some(event.payload.clone()),
            changes,
            metadata: serde_json::to_value(metadata)
                .map_err(|e| DispatchError::serialization(e.to_string()))?,
            occurred_at: metadata.produced_at,
        })
    }
}

#[async_trait]
impl EventHandler for AuditHandler {
    fn name(&self) -> &str {
        AUDIT_HANDLER_NAME
    }

    fn event_types(&self) -> Vec<String> {
        emissary_core::domain::EVENT_TYPES.iter().map(|s| s.to_string()).collect()
    }

    async fn invoke(&self, event: &HandlerEvent) -> Result<()> {
        let record = Self::record_for(event)?;
        self.storage
            .insert(record)
            .await
            .map_err(|e| DispatchError::handler(AUDIT_HANDLER_NAME, e.to_string()))?;
        Ok(())
    }
}
