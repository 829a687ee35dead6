//! Aggregate root protocol.
//!
//! Aggregates encapsulate entity invariants and produce events as the sole
//! record of change. Every state-changing operation takes the caller's
//! expected version, runs the version check before any business rule so
//! version errors are never masked, mutates the in-memory state, and returns
//! the produced events as a plain vector. There is no hidden uncommitted
//! buffer; the write path persists whatever the operation returned.

use crate::error::{DomainError, DomainResult};
use crate::models::NewEvent;

/// Contract implemented by every aggregate.
pub trait AggregateRoot {
    /// Short aggregate type name used on events and audit rows.
    const AGGREGATE_TYPE: &'static str;

    /// Identifier of this instance, as stored on events.
    fn aggregate_id(&self) -> String;

    /// Current optimistic version, starting at 1 for a new instance.
    fn version(&self) -> i32;
}

/// Outcome of a successful state-changing operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Events recording the observable facts of this transition, in order.
    pub events: Vec<NewEvent>,

    /// Aggregate version after the transition.
    ///
    /// Equal to the previous version for no-op operations that produced no
    /// events.
    pub new_version: i32,
}

impl Transition {
    /// A transition that changed nothing: zero events, no version bump.
    pub fn noop(version: i32) -> Self {
        Self { events: Vec::new(), new_version: version }
    }

    /// Returns true if the operation produced no events.
    pub fn is_noop(&self) -> bool {
        self.events.is_empty()
    }
}

/// Rejects a transition whose expected version does not match the current
/// row version. Evaluated before any business rule.
pub fn check_version(current: i32, expected: i32, rule: &str) -> DomainResult<()> {
    if current == expected {
        Ok(())
    } else {
        Err(DomainError::optimistic_lock(rule, expected, current))
    }
}

/// Rejects empty or whitespace-only strings before any length check runs.
pub fn require_non_empty(value: &str, field: &str, rule: &str) -> DomainResult<()> {
    if value.trim().is_empty() {
        Err(DomainError::business_rule(rule, format!("{field} must not be empty")))
    } else {
        Ok(())
    }
}

/// Rejects strings longer than `max` characters.
pub fn require_max_len(value: &str, max: usize, field: &str, rule: &str) -> DomainResult<()> {
    if value.chars().count() > max {
        Err(DomainError::business_rule(
            rule,
            format!("{field} must be at most {max} characters"),
        ))
    } else {
        Ok(())
    }
}
