//! Property-based tests for aggregate versioning invariants.
//!
//! Verifies that no sequence of operations can produce version gaps or
//! duplicates: every accepted transition bumps the version by exactly one,
//! and every rejected transition leaves the aggregate untouched.

use chrono::Utc;
use emissary_core::domain::{Action, ActionStatus, Policy, PolicyStatus};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum ActionOp {
    Update(String),
    Complete,
    Cancel(String),
}

fn action_op() -> impl Strategy<Value = ActionOp> {
    prop_oneof![
        "[a-z ]{0,12}".prop_map(ActionOp::Update),
        Just(ActionOp::Complete),
        "[a-z ]{0,12}".prop_map(ActionOp::Cancel),
    ]
}

proptest! {
    #[test]
    fn action_versions_have_no_gaps_or_duplicates(ops in prop::collection::vec(action_op(), 1..24)) {
        let now = Utc::now();
        let (mut action, transition) = Action::create("subject".to_string(), None, now)
            .expect("create should succeed");
        prop_assert_eq!(transition.new_version, 1);

        let mut version = 1;
        for op in ops {
            let before = action.clone();
            let result = match op {
                ActionOp::Update(name) => action.update(version, Some(name), None, now),
                ActionOp::Complete => action.complete(version, now),
                ActionOp::Cancel(reason) => action.cancel(version, reason, now),
            };

            match result {
                Ok(transition) if transition.is_noop() => {
                    // No events means no version movement.
                    prop_assert_eq!(action.version, version);
                    prop_assert_eq!(transition.new_version, version);
                },
                Ok(transition) => {
                    // Successor exactly: previous + 1, never more.
                    prop_assert_eq!(transition.new_version, version + 1);
                    prop_assert_eq!(action.version, version + 1);
                    version += 1;
                },
                Err(_) => {
                    // Rejected transitions must not mutate state.
                    prop_assert_eq!(action.version, before.version);
                    prop_assert_eq!(action.status, before.status);
                },
            }
        }

        // Terminal states hold (completed/cancelled admit nothing further).
        if action.status != ActionStatus::Active {
            let v = action.version;
            prop_assert!(action.update(v, Some("late".into()), None, now).is_err());
            prop_assert_eq!(action.version, v);
        }
    }

    #[test]
    fn stale_expected_versions_always_rejected(offset in 1i32..10) {
        let now = Utc::now();
        let (mut policy, _) = Policy::create("P".to_string(), serde_json::json!({"x": 1}), now)
            .expect("create should succeed");

        let err = policy.activate(1 + offset, now).unwrap_err();
        prop_assert_eq!(err.kind, emissary_core::ErrorKind::OptimisticLock);
        prop_assert_eq!(policy.status, PolicyStatus::Draft);
        prop_assert_eq!(policy.version, 1);
    }

    #[test]
    fn revocation_is_terminal_from_any_state(activate in any::<bool>(), suspend in any::<bool>()) {
        let now = Utc::now();
        let (mut policy, _) = Policy::create("P".to_string(), serde_json::json!({}), now)
            .expect("create should succeed");

        if activate {
            policy.activate(policy.version, now).expect("activate should succeed");
            if suspend {
                policy.suspend(policy.version, "pause".into(), now).expect("suspend should succeed");
            }
        }

        policy
            .revoke(policy.version, "breach".into(), "admin-1".into(), now)
            .expect("revoke should succeed from any non-revoked state");
        prop_assert_eq!(policy.status, PolicyStatus::Revoked);

        let v = policy.version;
        prop_assert!(policy.activate(v, now).is_err());
        prop_assert!(policy.resume(v, now).is_err());
        prop_assert!(policy.revoke(v, "again".into(), "admin-1".into(), now).is_err());
        prop_assert_eq!(policy.version, v);
    }
}
