//! The `Action` aggregate.
//!
//! State machine: `active -> inactive` via complete or cancel. Updates are
//! allowed only while active; cancellation requires a non-empty reason.
//! Completed and cancelled actions admit no further transitions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::{
    check_version, require_max_len, require_non_empty, AggregateRoot, Transition,
};
use crate::error::{DomainError, DomainResult};
use crate::models::NewEvent;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

const MAX_NAME_LEN: usize = 200;

/// Action lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Accepting updates and transitions.
    Active,
    /// Finished successfully. Terminal.
    Completed,
    /// Abandoned with a reason. Terminal.
    Cancelled,
}

impl ActionStatus {
    /// Returns true once the action admits no further transitions.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl sqlx::Type<PgDb> for ActionStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for ActionStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid action status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for ActionStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// A unit of work tracked by the service.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Action {
    /// Unique identifier.
    pub id: Uuid,

    /// Human-readable name.
    pub name: String,

    /// Optional free-form description.
    pub description: Option<String>,

    /// Current lifecycle status.
    pub status: ActionStatus,

    /// Reason supplied at cancellation.
    pub cancel_reason: Option<String>,

    /// Optimistic concurrency version, bumped by exactly 1 per transition.
    pub version: i32,

    /// When the action was created.
    pub created_at: DateTime<Utc>,

    /// When the action state last changed.
    pub updated_at: DateTime<Utc>,

    /// When the action completed.
    pub completed_at: Option<DateTime<Utc>>,

    /// When the action was cancelled.
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl AggregateRoot for Action {
    const AGGREGATE_TYPE: &'static str = "action";

    fn aggregate_id(&self) -> String {
        self.id.to_string()
    }

    fn version(&self) -> i32 {
        self.version
    }
}

impl Action {
    /// Creates a new active action at version 1.
    pub fn create(
        name: String,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<(Self, Transition)> {
        require_non_empty(&name, "name", "action.create.name_required")?;
        require_max_len(&name, MAX_NAME_LEN, "name", "action.create.name_too_long")?;

        let action = Self {
            id: Uuid::now_v7(),
            name,
            description,
            status: ActionStatus::Active,
            cancel_reason: None,
            version: 1,
            created_at: now,
            updated_at: now,
            completed_at: None,
            cancelled_at: None,
        };

        let event = NewEvent::v1("action.created", action.snapshot());
        Ok((action, Transition { events: vec![event], new_version: 1 }))
    }

    /// Updates name and/or description while the action is active.
    ///
    /// Fields left as `None` are unchanged. An update in which every
    /// provided field equals the current value succeeds with zero events
    /// and no version bump.
    pub fn update(
        &mut self,
        expected_version: i32,
        name: Option<String>,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<Transition> {
        check_version(self.version, expected_version, "action.version.mismatch")?;
        self.ensure_active("action.update.not_active")?;

        if let Some(ref name) = name {
            require_non_empty(name, "name", "action.update.name_required")?;
            require_max_len(name, MAX_NAME_LEN, "name", "action.update.name_too_long")?;
        }

        let name_changed = name.as_ref().is_some_and(|n| *n != self.name);
        let description_changed = description.as_ref().is_some_and(|d| Some(d) != self.description.as_ref());

        if !name_changed && !description_changed {
            return Ok(Transition::noop(self.version));
        }

        if let Some(name) = name {
            self.name = name;
        }
        if description_changed {
            self.description = description;
        }
        self.version += 1;
        self.updated_at = now;

        let event = NewEvent::v1("action.updated", self.snapshot());
        Ok(Transition { events: vec![event], new_version: self.version })
    }

    /// Completes an active action. Terminal.
    pub fn complete(&mut self, expected_version: i32, now: DateTime<Utc>) -> DomainResult<Transition> {
        check_version(self.version, expected_version, "action.version.mismatch")?;
        self.ensure_active("action.complete.not_active")?;

        let previous = self.status;
        self.status = ActionStatus::Completed;
        self.completed_at = Some(now);
        self.updated_at = now;
        self.version += 1;

        let event = NewEvent::v1(
            "action.completed",
            serde_json::json!({
                "id": self.id,
                "previous_status": previous.to_string(),
                "status": self.status.to_string(),
            }),
        );
        Ok(Transition { events: vec![event], new_version: self.version })
    }

    /// Cancels an active action with a reason. Terminal.
    pub fn cancel(
        &mut self,
        expected_version: i32,
        reason: String,
        now: DateTime<Utc>,
    ) -> DomainResult<Transition> {
        check_version(self.version, expected_version, "action.version.mismatch")?;
        self.ensure_active("action.cancel.not_active")?;
        require_non_empty(&reason, "reason", "action.cancel.reason_required")?;

        let previous = self.status;
        self.status = ActionStatus::Cancelled;
        self.cancel_reason = Some(reason.clone());
        self.cancelled_at = Some(now);
        self.updated_at = now;
        self.version += 1;

        let event = NewEvent::v1(
            "action.cancelled",
            serde_json::json!({
                "id": self.id,
                "reason": reason,
                "previous_status": previous.to_string(),
                "status": self.status.to_string(),
            }),
        );
        Ok(Transition { events: vec![event], new_version: self.version })
    }

    fn ensure_active(&self, rule: &str) -> DomainResult<()> {
        if self.status == ActionStatus::Active {
            Ok(())
        } else {
            Err(DomainError::business_rule(
                rule,
                format!("action is {} and admits no further changes", self.status),
            ))
        }
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "description": self.description,
            "status": self.status.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn new_action() -> Action {
        Action::create("ship release".to_string(), None, Utc::now())
            .expect("create should succeed")
            .0
    }

    #[test]
    fn create_produces_created_event_at_version_one() {
        let (action, transition) = Action::create("ship".into(), Some("desc".into()), Utc::now())
            .expect("create should succeed");

        assert_eq!(action.version, 1);
        assert_eq!(action.status, ActionStatus::Active);
        assert_eq!(transition.new_version, 1);
        assert_eq!(transition.events.len(), 1);
        assert_eq!(transition.events[0].event_type, "action.created");
        assert_eq!(transition.events[0].schema_version, 1);
    }

    #[test]
    fn create_rejects_blank_name() {
        let err = Action::create("   ".into(), None, Utc::now()).unwrap_err();
        assert_eq!(err.rule.as_deref(), Some("action.create.name_required"));
    }

    #[test]
    fn update_bumps_version_by_exactly_one() {
        let mut action = new_action();
        let transition = action
            .update(1, Some("ship v2".into()), None, Utc::now())
            .expect("update should succeed");

        assert_eq!(transition.new_version, 2);
        assert_eq!(action.version, 2);
        assert_eq!(transition.events[0].event_type, "action.updated");
    }

    #[test]
    fn noop_update_produces_no_events_and_no_bump() {
        let mut action = new_action();
        let transition = action
            .update(1, Some(action.name.clone()), None, Utc::now())
            .expect("no-op update should succeed");

        assert!(transition.is_noop());
        assert_eq!(transition.new_version, 1);
        assert_eq!(action.version, 1);
    }

    #[test]
    fn version_mismatch_checked_before_business_rules() {
        let mut action = new_action();
        action.complete(1, Utc::now()).expect("complete should succeed");

        // Wrong version on a terminal action: the version error must win.
        let err = action.update(1, Some("renamed".into()), None, Utc::now()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::OptimisticLock);
        assert_eq!(err.rule.as_deref(), Some("action.version.mismatch"));
    }

    #[test]
    fn completed_action_rejects_updates() {
        let mut action = new_action();
        action.complete(1, Utc::now()).expect("complete should succeed");

        let err = action.update(2, Some("renamed".into()), None, Utc::now()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BusinessRule);
        assert_eq!(err.rule.as_deref(), Some("action.update.not_active"));
    }

    #[test]
    fn cancel_requires_reason() {
        let mut action = new_action();
        let err = action.cancel(1, "  ".into(), Utc::now()).unwrap_err();
        assert_eq!(err.rule.as_deref(), Some("action.cancel.reason_required"));
        assert_eq!(action.version, 1, "failed cancel must not mutate state");
    }

    #[test]
    fn cancel_records_reason_and_transition() {
        let mut action = new_action();
        let transition =
            action.cancel(1, "superseded".into(), Utc::now()).expect("cancel should succeed");

        assert_eq!(action.status, ActionStatus::Cancelled);
        assert_eq!(action.cancel_reason.as_deref(), Some("superseded"));
        let payload = &transition.events[0].payload;
        assert_eq!(payload["previous_status"], "active");
        assert_eq!(payload["status"], "cancelled");
    }

    #[test]
    fn complete_then_cancel_rejected() {
        let mut action = new_action();
        action.complete(1, Utc::now()).expect("complete should succeed");

        let err = action.cancel(2, "late".into(), Utc::now()).unwrap_err();
        assert_eq!(err.rule.as_deref(), Some("action.cancel.not_active"));
    }
}
