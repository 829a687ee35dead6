//! The `Policy` aggregate.
//!
//! State machine: `draft -> active -> {suspended <-> active}`; any
//! non-revoked policy may be revoked, and revocation is terminal. Suspension
//! requires a reason; revocation requires a reason and the revoker's id.
//! Rule payloads are mutable only while the policy is a draft.

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

/// Policy lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStatus {
    /// Editable, not yet enforced.
    Draft,
    /// Enforced.
    Active,
    /// Temporarily not enforced; may return to active.
    Suspended,
    /// Permanently withdrawn. Terminal.
    Revoked,
}

impl fmt::Display for PolicyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Active => write!(f, "active"),
            Self::Suspended => write!(f, "suspended"),
            Self::Revoked => write!(f, "revoked"),
        }
    }
}

impl sqlx::Type<PgDb> for PolicyStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for PolicyStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            "revoked" => Ok(Self::Revoked),
            _ => Err(format!("invalid policy status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for PolicyStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// A named rule set enforced by downstream systems.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Policy {
    /// Unique identifier.
    pub id: Uuid,

    /// Human-readable name.
    pub name: String,

    /// Rule payload, opaque to the core.
    pub rules: sqlx::types::Json<serde_json::Value>,

    /// Current lifecycle status.
    pub status: PolicyStatus,

    /// Reason supplied at suspension; cleared on resume.
    pub suspend_reason: Option<String>,

    /// Reason supplied at revocation.
    pub revoke_reason: Option<String>,

    /// Actor id that revoked the policy.
    pub revoked_by: Option<String>,

    /// Optimistic concurrency version, bumped by exactly 1 per transition.
    pub version: i32,

    /// When the policy was created.
    pub created_at: DateTime<Utc>,

    /// When the policy state last changed.
    pub updated_at: DateTime<Utc>,

    /// When the policy first became active.
    pub activated_at: Option<DateTime<Utc>>,

    /// When the policy was revoked.
    pub revoked_at: Option<DateTime<Utc>>,
}

impl AggregateRoot for Policy {
    const AGGREGATE_TYPE: &'static str = "policy";

    fn aggregate_id(&self) -> String {
        self.id.to_string()
    }

    fn version(&self) -> i32 {
        self.version
    }
}

impl Policy {
    /// Creates a new draft policy at version 1.
    pub fn create(
        name: String,
        rules: serde_json::Value,
        now: DateTime<Utc>,
    ) -> DomainResult<(Self, Transition)> {
        require_non_empty(&name, "name", "policy.create.name_required")?;
        require_max_len(&name, MAX_NAME_LEN, "name", "policy.create.name_too_long")?;

        let policy = Self {
            id: Uuid::now_v7(),
            name,
            rules: sqlx::types::Json(rules),
            status: PolicyStatus::Draft,
            suspend_reason: None,
            revoke_reason: None,
            revoked_by: None,
            version: 1,
            created_at: now,
            updated_at: now,
            activated_at: None,
            revoked_at: None,
        };

        let event = NewEvent::v1("policy.created", policy.snapshot());
        Ok((policy, Transition { events: vec![event], new_version: 1 }))
    }

    /// Replaces the rule payload while the policy is a draft.
    ///
    /// Setting rules equal to the current payload is a no-op: zero events,
    /// no version bump.
    pub fn update_rules(
        &mut self,
        expected_version: i32,
        rules: serde_json::Value,
        now: DateTime<Utc>,
    ) -> DomainResult<Transition> {
        check_version(self.version, expected_version, "policy.version.mismatch")?;
        self.ensure_not_revoked("policy.update.revoked")?;
        if self.status != PolicyStatus::Draft {
            return Err(DomainError::business_rule(
                "policy.update.not_draft",
                format!("rules are editable only while draft, policy is {}", self.status),
            ));
        }

        if self.rules.0 == rules {
            return Ok(Transition::noop(self.version));
        }

        self.rules = sqlx::types::Json(rules);
        self.version += 1;
        self.updated_at = now;

        let event = NewEvent::v1("policy.updated", self.snapshot());
        Ok(Transition { events: vec![event], new_version: self.version })
    }

    /// Activates a draft policy.
    pub fn activate(&mut self, expected_version: i32, now: DateTime<Utc>) -> DomainResult<Transition> {
        check_version(self.version, expected_version, "policy.version.mismatch")?;
        if self.status != PolicyStatus::Draft {
            return Err(DomainError::business_rule(
                "policy.activate.not_draft",
                format!("only draft policies can be activated, policy is {}", self.status),
            ));
        }

        let previous = self.status;
        self.status = PolicyStatus::Active;
        self.activated_at = Some(now);
        self.updated_at = now;
        self.version += 1;

        Ok(Transition {
            events: vec![self.transition_event("policy.activated", previous, None)],
            new_version: self.version,
        })
    }

    /// Suspends an active policy with a reason.
    pub fn suspend(
        &mut self,
        expected_version: i32,
        reason: String,
        now: DateTime<Utc>,
    ) -> DomainResult<Transition> {
        check_version(self.version, expected_version, "policy.version.mismatch")?;
        if self.status != PolicyStatus::Active {
            return Err(DomainError::business_rule(
                "policy.suspend.not_active",
                format!("only active policies can be suspended, policy is {}", self.status),
            ));
        }
        require_non_empty(&reason, "reason", "policy.suspend.reason_required")?;

        let previous = self.status;
        self.status = PolicyStatus::Suspended;
        self.suspend_reason = Some(reason.clone());
        self.updated_at = now;
        self.version += 1;

        Ok(Transition {
            events: vec![self.transition_event(
                "policy.suspended",
                previous,
                Some(serde_json::json!({ "reason": reason })),
            )],
            new_version: self.version,
        })
    }

    /// Returns a suspended policy to active.
    pub fn resume(&mut self, expected_version: i32, now: DateTime<Utc>) -> DomainResult<Transition> {
        check_version(self.version, expected_version, "policy.version.mismatch")?;
        if self.status != PolicyStatus::Suspended {
            return Err(DomainError::business_rule(
                "policy.resume.not_suspended",
                format!("only suspended policies can be resumed, policy is {}", self.status),
            ));
        }

        let previous = self.status;
        self.status = PolicyStatus::Active;
        self.suspend_reason = None;
        self.updated_at = now;
        self.version += 1;

        Ok(Transition {
            events: vec![self.transition_event("policy.resumed", previous, None)],
            new_version: self.version,
        })
    }

    /// Revokes any non-revoked policy. Terminal.
    pub fn revoke(
        &mut self,
        expected_version: i32,
        reason: String,
        revoked_by: String,
        now: DateTime<Utc>,
    ) -> DomainResult<Transition> {
        check_version(self.version, expected_version, "policy.version.mismatch")?;
        self.ensure_not_revoked("policy.revoke.already_revoked")?;
        require_non_empty(&reason, "reason", "policy.revoke.reason_required")?;
        require_non_empty(&revoked_by, "revoked_by", "policy.revoke.revoker_required")?;

        let previous = self.status;
        self.status = PolicyStatus::Revoked;
        self.revoke_reason = Some(reason.clone());
        self.revoked_by = Some(revoked_by.clone());
        self.revoked_at = Some(now);
        self.updated_at = now;
        self.version += 1;

        Ok(Transition {
            events: vec![self.transition_event(
                "policy.revoked",
                previous,
                Some(serde_json::json!({ "reason": reason, "revoked_by": revoked_by })),
            )],
            new_version: self.version,
        })
    }

    fn ensure_not_revoked(&self, rule: &str) -> DomainResult<()> {
        if self.status == PolicyStatus::Revoked {
            Err(DomainError::business_rule(rule, "policy is revoked and admits no transitions"))
        } else {
            Ok(())
        }
    }

    fn transition_event(
        &self,
        event_type: &str,
        previous: PolicyStatus,
        extra: Option<serde_json::Value>,
    ) -> NewEvent {
        let mut payload = serde_json::json!({
            "id": self.id,
            "previous_status": previous.to_string(),
            "status": self.status.to_string(),
        });
        if let (Some(object), Some(serde_json::Value::Object(extra))) =
            (payload.as_object_mut(), extra)
        {
            object.extend(extra);
        }
        NewEvent::v1(event_type, payload)
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "rules": self.rules.0,
            "status": self.status.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn draft_policy() -> Policy {
        Policy::create("P".to_string(), serde_json::json!({"x": 1}), Utc::now())
            .expect("create should succeed")
            .0
    }

    fn active_policy() -> Policy {
        let mut policy = draft_policy();
        policy.activate(1, Utc::now()).expect("activate should succeed");
        policy
    }

    #[test]
    fn create_produces_draft_at_version_one() {
        let (policy, transition) = Policy::create("P".into(), serde_json::json!({}), Utc::now())
            .expect("create should succeed");

        assert_eq!(policy.status, PolicyStatus::Draft);
        assert_eq!(policy.version, 1);
        assert_eq!(transition.events[0].event_type, "policy.created");
        assert_eq!(transition.events[0].payload["status"], "draft");
    }

    #[test]
    fn activate_transitions_draft_to_active() {
        let mut policy = draft_policy();
        let transition = policy.activate(1, Utc::now()).expect("activate should succeed");

        assert_eq!(policy.status, PolicyStatus::Active);
        assert_eq!(transition.new_version, 2);
        let payload = &transition.events[0].payload;
        assert_eq!(payload["previous_status"], "draft");
        assert_eq!(payload["status"], "active");
    }

    #[test]
    fn activate_rejects_non_draft() {
        let mut policy = active_policy();
        let err = policy.activate(2, Utc::now()).unwrap_err();
        assert_eq!(err.rule.as_deref(), Some("policy.activate.not_draft"));
    }

    #[test]
    fn suspend_and_resume_round_trip() {
        let mut policy = active_policy();

        policy.suspend(2, "maintenance".into(), Utc::now()).expect("suspend should succeed");
        assert_eq!(policy.status, PolicyStatus::Suspended);
        assert_eq!(policy.suspend_reason.as_deref(), Some("maintenance"));

        let transition = policy.resume(3, Utc::now()).expect("resume should succeed");
        assert_eq!(policy.status, PolicyStatus::Active);
        assert_eq!(policy.suspend_reason, None);
        assert_eq!(transition.events[0].payload["previous_status"], "suspended");
    }

    #[test]
    fn suspend_requires_reason() {
        let mut policy = active_policy();
        let err = policy.suspend(2, " ".into(), Utc::now()).unwrap_err();
        assert_eq!(err.rule.as_deref(), Some("policy.suspend.reason_required"));
        assert_eq!(policy.version, 2);
    }

    #[test]
    fn revoke_allowed_from_any_non_revoked_state() {
        for make in [draft_policy as fn() -> Policy, active_policy as fn() -> Policy] {
            let mut policy = make();
            let version = policy.version;
            policy
                .revoke(version, "breach".into(), "admin-1".into(), Utc::now())
                .expect("revoke should succeed");
            assert_eq!(policy.status, PolicyStatus::Revoked);
            assert_eq!(policy.revoked_by.as_deref(), Some("admin-1"));
        }
    }

    #[test]
    fn revoked_policy_is_terminal() {
        let mut policy = active_policy();
        policy.revoke(2, "breach".into(), "admin-1".into(), Utc::now()).expect("revoke");

        let err = policy.revoke(3, "again".into(), "admin-1".into(), Utc::now()).unwrap_err();
        assert_eq!(err.rule.as_deref(), Some("policy.revoke.already_revoked"));

        let err = policy.activate(3, Utc::now()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BusinessRule);
    }

    #[test]
    fn revoke_requires_reason_and_revoker() {
        let mut policy = active_policy();

        let err = policy.revoke(2, "".into(), "admin-1".into(), Utc::now()).unwrap_err();
        assert_eq!(err.rule.as_deref(), Some("policy.revoke.reason_required"));

        let err = policy.revoke(2, "breach".into(), "  ".into(), Utc::now()).unwrap_err();
        assert_eq!(err.rule.as_deref(), Some("policy.revoke.revoker_required"));
    }

    #[test]
    fn update_rules_only_in_draft() {
        let mut policy = active_policy();
        let err = policy.update_rules(2, serde_json::json!({"x": 2}), Utc::now()).unwrap_err();
        assert_eq!(err.rule.as_deref(), Some("policy.update.not_draft"));
    }

    #[test]
    fn equal_rules_update_is_noop() {
        let mut policy = draft_policy();
        let transition = policy
            .update_rules(1, serde_json::json!({"x": 1}), Utc::now())
            .expect("no-op update should succeed");
        assert!(transition.is_noop());
        assert_eq!(policy.version, 1);
    }

    #[test]
    fn version_mismatch_wins_over_state_errors() {
        let mut policy = active_policy();
        // Wrong version on an illegal transition: optimistic-lock must win.
        let err = policy.activate(1, Utc::now()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::OptimisticLock);
        assert_eq!(err.rule.as_deref(), Some("policy.version.mismatch"));
    }
}
