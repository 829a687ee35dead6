//! Test infrastructure for deterministic delivery testing.
//!
//! Provides a controllable clock, fixture builders for events and outbox
//! entries, and the controlled-fault handler decorator used to exercise
//! retry ladders. Everything here is test tooling: the production binary
//! never links fault injection into its critical path.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod flaky;
pub mod time;

pub use fixtures::EventFixture;
pub use flaky::FlakyHandler;
pub use time::TestClock;
