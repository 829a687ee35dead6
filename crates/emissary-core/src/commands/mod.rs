//! Command execution: the transactional write path.
//!
//! Every state-changing command runs the same pattern: begin a transaction,
//! load and mutate the aggregate under its optimistic version, write the
//! state row with a version-guarded update, persist the produced events and
//! their outbox rows, commit. All-or-nothing: a failure at any step aborts
//! the transaction and the caller receives the original failure as a value.
//!
//! No external I/O happens inside the transaction; queue contact is the
//! dispatcher's job after commit.

mod action;
mod policy;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::{
    aggregate::Transition,
    error::{CoreError, DomainError, DomainResult},
    models::{Actor, EventId, EventMetadata},
    storage::Storage,
    time::Clock,
};

/// Default cap on a single event payload, in serialized bytes.
///
/// Oversized payloads would fail queue-side later; rejecting them up front
/// keeps the failure synchronous and attributable.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Caller-supplied metadata accompanying every command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMetadata {
    /// Identifier shared by everything triggered by one original request.
    pub correlation_id: String,

    /// Id of the preceding command or event, when part of a chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// Caller identity.
    pub actor: Actor,

    /// Caller-side timestamp of the request.
    pub timestamp: DateTime<Utc>,

    /// Pass-through fields stamped onto event metadata uninterpreted.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CommandMetadata {
    /// Builds the base event metadata for events this command produces.
    fn event_metadata(&self, produced_at: DateTime<Utc>) -> EventMetadata {
        EventMetadata {
            correlation_id: self.correlation_id.clone(),
            causation_id: self.causation_id.clone(),
            actor: self.actor.clone(),
            produced_at,
            schema_version: 1,
            extra: self.extra.clone(),
        }
    }
}

/// A state-changing request against one aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Command {
    /// Creates an active action.
    CreateAction {
        /// Action name.
        name: String,
        /// Optional description.
        description: Option<String>,
    },
    /// Updates an active action's name and/or description.
    UpdateAction {
        /// Target action.
        action_id: Uuid,
        /// Version the caller loaded.
        expected_version: i32,
        /// New name, unchanged when `None`.
        name: Option<String>,
        /// New description, unchanged when `None`.
        description: Option<String>,
    },
    /// Completes an active action.
    CompleteAction {
        /// Target action.
        action_id: Uuid,
        /// Version the caller loaded.
        expected_version: i32,
    },
    /// Cancels an active action with a reason.
    CancelAction {
        /// Target action.
        action_id: Uuid,
        /// Version the caller loaded.
        expected_version: i32,
        /// Non-empty cancellation reason.
        reason: String,
    },
    /// Creates a draft policy.
    CreatePolicy {
        /// Policy name.
        name: String,
        /// Rule payload.
        rules: serde_json::Value,
    },
    /// Replaces a draft policy's rules.
    UpdatePolicyRules {
        /// Target policy.
        policy_id: Uuid,
        /// Version the caller loaded.
        expected_version: i32,
        /// New rule payload.
        rules: serde_json::Value,
    },
    /// Activates a draft policy.
    ActivatePolicy {
        /// Target policy.
        policy_id: Uuid,
        /// Version the caller loaded.
        expected_version: i32,
    },
    /// Suspends an active policy.
    SuspendPolicy {
        /// Target policy.
        policy_id: Uuid,
        /// Version the caller loaded.
        expected_version: i32,
        /// Non-empty suspension reason.
        reason: String,
    },
    /// Returns a suspended policy to active.
    ResumePolicy {
        /// Target policy.
        policy_id: Uuid,
        /// Version the caller loaded.
        expected_version: i32,
    },
    /// Revokes a non-revoked policy. The revoker is the command actor.
    RevokePolicy {
        /// Target policy.
        policy_id: Uuid,
        /// Version the caller loaded.
        expected_version: i32,
        /// Non-empty revocation reason.
        reason: String,
    },
}

impl Command {
    /// Stable command name for logging.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CreateAction { .. } => "action.create",
            Self::UpdateAction { .. } => "action.update",
            Self::CompleteAction { .. } => "action.complete",
            Self::CancelAction { .. } => "action.cancel",
            Self::CreatePolicy { .. } => "policy.create",
            Self::UpdatePolicyRules { .. } => "policy.update_rules",
            Self::ActivatePolicy { .. } => "policy.activate",
            Self::SuspendPolicy { .. } => "policy.suspend",
            Self::ResumePolicy { .. } => "policy.resume",
            Self::RevokePolicy { .. } => "policy.revoke",
        }
    }
}

/// Result of a successfully executed command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    /// Aggregate the command acted on.
    pub aggregate_id: Uuid,

    /// Aggregate version after the command.
    pub version: i32,

    /// Ids of the persisted events, in production order. Empty for no-ops.
    pub event_ids: Vec<EventId>,
}

/// Executes commands against aggregates with transactional event publication.
pub struct CommandExecutor {
    pool: PgPool,
    storage: Storage,
    clock: Arc<dyn Clock>,
    max_payload_bytes: usize,
}

impl CommandExecutor {
    /// Creates an executor over the given pool and storage.
    pub fn new(pool: PgPool, storage: Storage, clock: Arc<dyn Clock>) -> Self {
        Self { pool, storage, clock, max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES }
    }

    /// Overrides the event payload size cap.
    #[must_use]
    pub fn with_max_payload_bytes(mut self, max_payload_bytes: usize) -> Self {
        self.max_payload_bytes = max_payload_bytes;
        self
    }

    /// Executes one command and returns its outcome.
    ///
    /// Expected failures (validation, version mismatch, rule violations)
    /// come back as [`DomainError`] values; infrastructure failures are
    /// converted to `infrastructure`-kind errors.
    pub async fn execute(
        &self,
        command: Command,
        metadata: CommandMetadata,
    ) -> DomainResult<CommandOutcome> {
        let command_name = command.name();
        let correlation_id = metadata.correlation_id.clone();

        let outcome = match command {
            Command::CreateAction { name, description } => {
                self.create_action(name, description, &metadata).await
            },
            Command::UpdateAction { action_id, expected_version, name, description } => {
                self.update_action(action_id, expected_version, name, description, &metadata).await
            },
            Command::CompleteAction { action_id, expected_version } => {
                self.complete_action(action_id, expected_version, &metadata).await
            },
            Command::CancelAction { action_id, expected_version, reason } => {
                self.cancel_action(action_id, expected_version, reason, &metadata).await
            },
            Command::CreatePolicy { name, rules } => {
                self.create_policy(name, rules, &metadata).await
            },
            Command::UpdatePolicyRules { policy_id, expected_version, rules } => {
                self.update_policy_rules(policy_id, expected_version, rules, &metadata).await
            },
            Command::ActivatePolicy { policy_id, expected_version } => {
                self.activate_policy(policy_id, expected_version, &metadata).await
            },
            Command::SuspendPolicy { policy_id, expected_version, reason } => {
                self.suspend_policy(policy_id, expected_version, reason, &metadata).await
            },
            Command::ResumePolicy { policy_id, expected_version } => {
                self.resume_policy(policy_id, expected_version, &metadata).await
            },
            Command::RevokePolicy { policy_id, expected_version, reason } => {
                self.revoke_policy(policy_id, expected_version, reason, &metadata).await
            },
        }?;

        info!(
            correlation_id = %correlation_id,
            command = command_name,
            aggregate_id = %outcome.aggregate_id,
            version = outcome.version,
            events = outcome.event_ids.len(),
            "command executed"
        );

        Ok(outcome)
    }

    /// Begins the write-path transaction.
    pub(crate) async fn begin(&self) -> DomainResult<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await.map_err(CoreError::from)?)
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now_utc()
    }

    /// Persists a transition's events and outbox rows inside `tx`.
    pub(crate) async fn persist_transition(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        aggregate_type: &str,
        aggregate_id: &str,
        transition: &Transition,
        metadata: &CommandMetadata,
        occurred_at: DateTime<Utc>,
    ) -> DomainResult<Vec<EventId>> {
        for event in &transition.events {
            let size = serde_json::to_vec(&event.payload)
                .map_err(|e| DomainError::internal(format!("unserializable payload: {e}")))?
                .len();
            if size > self.max_payload_bytes {
                return Err(DomainError::validation_with_details(
                    "event payload exceeds maximum size",
                    serde_json::json!({
                        "event_type": event.event_type,
                        "size_bytes": size,
                        "limit_bytes": self.max_payload_bytes,
                    }),
                ));
            }
        }

        let ids = self
            .storage
            .events
            .persist_with_outbox(
                tx,
                aggregate_type,
                aggregate_id,
                &transition.events,
                &metadata.event_metadata(occurred_at),
                occurred_at,
            )
            .await?;

        Ok(ids)
    }

    /// Surfaces a lost version-guarded write as an optimistic-lock failure.
    ///
    /// Reached only when a concurrent writer committed between our in-tx
    /// load and the guarded update.
    pub(crate) fn write_conflict(rule: &str, expected_version: i32) -> DomainError {
        DomainError {
            kind: crate::error::ErrorKind::OptimisticLock,
            rule: Some(rule.to_string()),
            message: "row version changed during write".to_string(),
            details: Some(serde_json::json!({ "expected": expected_version })),
            service: None,
        }
    }
}
