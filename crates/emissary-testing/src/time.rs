//! Deterministic time control for tests.
//!
//! [`TestClock`] advances only when told to (or when slept on), giving
//! reproducible timestamps and retry schedules.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use emissary_core::time::Clock;

/// Test clock with manually controlled time progression.
#[derive(Clone)]
pub struct TestClock {
    /// Monotonic time in nanoseconds since clock creation.
    monotonic_ns: Arc<AtomicU64>,
    /// System time as milliseconds since `UNIX_EPOCH`.
    system_ms: Arc<AtomicU64>,
    /// Base instant for monotonic calculations.
    base_instant: Instant,
}

impl TestClock {
    /// Creates a test clock starting at the current system time.
    pub fn new() -> Self {
        Self::with_start_time(SystemTime::now())
    }

    /// Creates a test clock starting at a specific system time.
    pub fn with_start_time(start: SystemTime) -> Self {
        let since_epoch = start.duration_since(UNIX_EPOCH).unwrap_or_default();

        Self {
            monotonic_ns: Arc::new(AtomicU64::new(0)),
            system_ms: Arc::new(AtomicU64::new(
                u64::try_from(since_epoch.as_millis()).unwrap_or(0),
            )),
            base_instant: Instant::now(),
        }
    }

    /// Advances both clocks by the given duration.
    pub fn advance(&self, duration: Duration) {
        self.monotonic_ns.fetch_add(
            u64::try_from(duration.as_nanos().min(u128::from(u64::MAX))).unwrap_or(0),
            Ordering::AcqRel,
        );
        self.system_ms.fetch_add(
            u64::try_from(duration.as_millis().min(u128::from(u64::MAX))).unwrap_or(0),
            Ordering::AcqRel,
        );
    }

    /// Elapsed virtual time since clock creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.monotonic_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + Duration::from_nanos(self.monotonic_ns.load(Ordering::Acquire))
    }

    fn now_system(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.system_ms.load(Ordering::Acquire))
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        // Sleeping advances virtual time immediately and yields once so
        // other tasks can run.
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_advances_on_demand() {
        let clock = TestClock::new();
        let start = clock.now();

        clock.advance(Duration::from_secs(10));

        assert_eq!(clock.now().duration_since(start), Duration::from_secs(10));
        assert_eq!(clock.elapsed(), Duration::from_secs(10));
    }

    #[test]
    fn system_time_tracks_advancement() {
        let start = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let clock = TestClock::with_start_time(start);

        assert_eq!(clock.now_system(), start);

        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now_system(), start + Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn sleep_advances_instead_of_waiting() {
        let clock = TestClock::new();
        let wall_start = Instant::now();

        clock.sleep(Duration::from_secs(3600)).await;

        assert_eq!(clock.elapsed(), Duration::from_secs(3600));
        assert!(wall_start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn utc_timestamps_are_monotone() {
        let clock = TestClock::new();
        let first = clock.now_utc();
        clock.advance(Duration::from_millis(250));
        let second = clock.now_utc();

        assert!(second > first);
        assert_eq!((second - first).num_milliseconds(), 250);
    }
}
