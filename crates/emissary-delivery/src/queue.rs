//! Job queue contract between the outbox dispatcher and the queue worker.
//!
//! The dispatcher enqueues one job per outbox row, keyed by event id so the
//! queue can coalesce duplicates (a reclaimed row never yields two live
//! jobs). The consumer side leases jobs with a visibility deadline; a
//! negatively-acknowledged job is redelivered on the queue's own retry
//! ladder and lands on the dead list once its attempts are exhausted.
//!
//! The bundled [`memory::InMemoryQueue`] implements the contract in-process
//! for single-node deployments and the test pipeline; a broker-backed queue
//! plugs in behind the same traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use emissary_core::models::{EventId, OutboxEntry, OutboxEnvelope};

use crate::error::Result;

/// Name of the single queue carrying domain events.
pub const QUEUE_NAME: &str = "domain-events";

/// A delivery job for one domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    /// Event being delivered; doubles as the job id for deduplication.
    pub event_id: EventId,

    /// Dotted event type name for handler routing.
    pub event_type: String,

    /// Producing aggregate type.
    pub aggregate_type: String,

    /// Producing aggregate instance.
    pub aggregate_id: String,

    /// Event payload plus original metadata.
    pub payload: OutboxEnvelope,
}

impl QueueJob {
    /// Builds the job for an outbox entry.
    pub fn from_outbox(entry: &OutboxEntry) -> Self {
        Self {
            event_id: entry.event_id,
            event_type: entry.event_type.clone(),
            aggregate_type: entry.aggregate_type.clone(),
            aggregate_id: entry.aggregate_id.clone(),
            payload: entry.payload.0.clone(),
        }
    }

    /// Stable job identifier used for queue-side deduplication.
    pub fn job_id(&self) -> String {
        self.event_id.to_string()
    }
}

/// Outcome of an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The job was accepted as new work.
    Enqueued,
    /// A live job with the same id already exists; nothing was added.
    Deduplicated,
}

/// A job leased to a consumer.
///
/// The lease stays open until [`JobConsumer::ack`] or [`JobConsumer::nack`];
/// handlers inherit `visibility_timeout` as their invocation deadline.
#[derive(Debug, Clone)]
pub struct JobLease {
    /// The leased job.
    pub job: QueueJob,

    /// Delivery attempt number, 1-based.
    pub attempt: u32,

    /// Time budget for processing this lease.
    pub visibility_timeout: std::time::Duration,
}

/// A job that exhausted its delivery attempts.
#[derive(Debug, Clone)]
pub struct FailedJob {
    /// The dead job.
    pub job: QueueJob,

    /// Attempts made before giving up.
    pub attempts_made: u32,

    /// Error reported by the final attempt.
    pub last_error: String,

    /// When the job was moved to the dead list.
    pub failed_at: DateTime<Utc>,
}

/// Producer side of the queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueues a job, deduplicating on job id among live jobs.
    async fn enqueue(&self, job: QueueJob) -> Result<EnqueueOutcome>;

    /// Closes the queue; pending consumers drain and then receive `None`.
    async fn close(&self) {}
}

/// Consumer side of the queue.
#[async_trait]
pub trait JobConsumer: Send + Sync {
    /// Waits for the next job lease. Returns `None` once the queue is
    /// closed and drained.
    async fn recv(&self) -> Result<Option<JobLease>>;

    /// Acknowledges successful processing; the job id becomes reusable.
    async fn ack(&self, lease: &JobLease) -> Result<()>;

    /// Reports failed processing. The job is redelivered after backoff, or
    /// moved to the dead list once attempts are exhausted.
    async fn nack(&self, lease: &JobLease, error: &str) -> Result<()>;
}

pub mod memory {
    //! In-process queue implementation.
    //!
    //! Bounded, deduplicating, with per-job exponential redelivery (default
    //! 3 attempts, base 1 s) and a dead list for exhausted jobs. Redelivery
    //! scheduling runs on tokio time, so paused-clock tests advance it
    //! instantly.

    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::{Mutex, Notify};
    use tokio::time::Instant;

    use super::{EnqueueOutcome, FailedJob, JobConsumer, JobLease, JobQueue, QueueJob, Result};
    use crate::error::DispatchError;
    use crate::retry::RetryPolicy;

    /// Configuration for the in-process queue.
    #[derive(Debug, Clone)]
    pub struct QueueConfig {
        /// Maximum live jobs (ready + delayed + leased).
        pub capacity: usize,

        /// Per-job retry policy. Defaults to 3 attempts, base 1 s.
        pub retry_policy: RetryPolicy,

        /// Visibility timeout inherited by handler invocations.
        pub visibility_timeout: Duration,
    }

    impl Default for QueueConfig {
        fn default() -> Self {
            Self {
                capacity: 1024,
                retry_policy: RetryPolicy::queue_default(),
                visibility_timeout: Duration::from_secs(30),
            }
        }
    }

    #[derive(Debug)]
    struct Delayed {
        job: QueueJob,
        attempt: u32,
        ready_at: Instant,
    }

    #[derive(Default)]
    struct State {
        ready: VecDeque<(QueueJob, u32)>,
        delayed: Vec<Delayed>,
        leased: HashMap<String, (QueueJob, u32)>,
        live_ids: HashSet<String>,
        dead: Vec<FailedJob>,
        closed: bool,
    }

    impl State {
        fn live_count(&self) -> usize {
            self.ready.len() + self.delayed.len() + self.leased.len()
        }

        /// Moves due delayed jobs to the ready list, preserving readiness order.
        fn promote_due(&mut self, now: Instant) {
            let mut due: Vec<Delayed> = Vec::new();
            self.delayed.retain_mut(|d| {
                if d.ready_at <= now {
                    due.push(Delayed { job: d.job.clone(), attempt: d.attempt, ready_at: d.ready_at });
                    false
                } else {
                    true
                }
            });
            due.sort_by_key(|d| d.ready_at);
            for d in due {
                self.ready.push_back((d.job, d.attempt));
            }
        }

        fn next_ready_at(&self) -> Option<Instant> {
            self.delayed.iter().map(|d| d.ready_at).min()
        }
    }

    /// Bounded in-process job queue with dedup and redelivery.
    pub struct InMemoryQueue {
        state: Arc<Mutex<State>>,
        notify: Arc<Notify>,
        config: QueueConfig,
    }

    impl InMemoryQueue {
        /// Creates a queue with default configuration.
        pub fn new() -> Self {
            Self::with_config(QueueConfig::default())
        }

        /// Creates a queue with the given configuration.
        pub fn with_config(config: QueueConfig) -> Self {
            Self {
                state: Arc::new(Mutex::new(State::default())),
                notify: Arc::new(Notify::new()),
                config,
            }
        }

        /// Jobs that exhausted their attempts, for operators and tests.
        pub async fn failed_jobs(&self) -> Vec<FailedJob> {
            self.state.lock().await.dead.clone()
        }

        /// Number of live jobs (ready, delayed, or leased).
        pub async fn depth(&self) -> usize {
            self.state.lock().await.live_count()
        }
    }

    impl Default for InMemoryQueue {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl JobQueue for InMemoryQueue {
        async fn enqueue(&self, job: QueueJob) -> Result<EnqueueOutcome> {
            let mut state = self.state.lock().await;

            if state.closed {
                return Err(DispatchError::queue("queue is closed"));
            }
            if state.live_ids.contains(&job.job_id()) {
                return Ok(EnqueueOutcome::Deduplicated);
            }
            if state.live_count() >= self.config.capacity {
                return Err(DispatchError::queue_full(self.config.capacity));
            }

            state.live_ids.insert(job.job_id());
            state.ready.push_back((job, 1));
            drop(state);

            self.notify.notify_waiters();
            Ok(EnqueueOutcome::Enqueued)
        }

        async fn close(&self) {
            self.state.lock().await.closed = true;
            self.notify.notify_waiters();
        }
    }

    #[async_trait]
    impl JobConsumer for InMemoryQueue {
        async fn recv(&self) -> Result<Option<JobLease>> {
            loop {
                // Register for wakeups before inspecting state; a notify
                // between the check and the await would otherwise be lost.
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let wait_until = {
                    let mut state = self.state.lock().await;
                    state.promote_due(Instant::now());

                    if let Some((job, attempt)) = state.ready.pop_front() {
                        state.leased.insert(job.job_id(), (job.clone(), attempt));
                        return Ok(Some(JobLease {
                            job,
                            attempt,
                            visibility_timeout: self.config.visibility_timeout,
                        }));
                    }

                    if state.closed && state.delayed.is_empty() {
                        return Ok(None);
                    }

                    state.next_ready_at()
                };

                match wait_until {
                    Some(ready_at) => {
                        tokio::select! {
                            () = &mut notified => {},
                            () = tokio::time::sleep_until(ready_at) => {},
                        }
                    },
                    None => notified.await,
                }
            }
        }

        async fn ack(&self, lease: &JobLease) -> Result<()> {
            let mut state = self.state.lock().await;
            let job_id = lease.job.job_id();
            state.leased.remove(&job_id);
            state.live_ids.remove(&job_id);
            drop(state);

            self.notify.notify_waiters();
            Ok(())
        }

        async fn nack(&self, lease: &JobLease, error: &str) -> Result<()> {
            let mut state = self.state.lock().await;
            let job_id = lease.job.job_id();

            let Some((job, attempt)) = state.leased.remove(&job_id) else {
                return Err(DispatchError::internal(format!("nack for unleased job {job_id}")));
            };

            if attempt >= self.config.retry_policy.max_attempts {
                state.live_ids.remove(&job_id);
                state.dead.push(FailedJob {
                    job,
                    attempts_made: attempt,
                    last_error: error.to_string(),
                    failed_at: Utc::now(),
                });
            } else {
                // Attempt k failed: redeliver after base * 2^(k-1).
                let delay = self.config.retry_policy.delay_after(attempt.saturating_sub(1));
                state.delayed.push(Delayed {
                    job,
                    attempt: attempt + 1,
                    ready_at: Instant::now() + delay,
                });
            }
            drop(state);

            self.notify.notify_waiters();
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use emissary_core::models::{Actor, EventMetadata, OutboxEnvelope};

        use super::*;

        fn test_job(suffix: u32) -> QueueJob {
            QueueJob {
                event_id: emissary_core::models::EventId::new(),
                event_type: "policy.created".to_string(),
                aggregate_type: "policy".to_string(),
                aggregate_id: format!("agg-{suffix}"),
                payload: OutboxEnvelope {
                    payload: serde_json::json!({"n": suffix}),
                    metadata: EventMetadata {
                        correlation_id: "c1".into(),
                        causation_id: None,
                        actor: Actor::new("u1", "u1@example.com"),
                        produced_at: Utc::now(),
                        schema_version: 1,
                        extra: serde_json::Map::new(),
                    },
                },
            }
        }

        #[tokio::test]
        async fn enqueue_then_recv_round_trip() {
            let queue = InMemoryQueue::new();
            let job = test_job(1);

            assert_eq!(queue.enqueue(job.clone()).await.unwrap(), EnqueueOutcome::Enqueued);

            let lease = queue.recv().await.unwrap().expect("lease expected");
            assert_eq!(lease.job, job);
            assert_eq!(lease.attempt, 1);

            queue.ack(&lease).await.unwrap();
            assert_eq!(queue.depth().await, 0);
        }

        #[tokio::test]
        async fn duplicate_job_ids_coalesce() {
            let queue = InMemoryQueue::new();
            let job = test_job(1);

            assert_eq!(queue.enqueue(job.clone()).await.unwrap(), EnqueueOutcome::Enqueued);
            assert_eq!(queue.enqueue(job.clone()).await.unwrap(), EnqueueOutcome::Deduplicated);
            assert_eq!(queue.depth().await, 1);

            // After the job completes its id is free again.
            let lease = queue.recv().await.unwrap().expect("lease expected");
            queue.ack(&lease).await.unwrap();
            assert_eq!(queue.enqueue(job).await.unwrap(), EnqueueOutcome::Enqueued);
        }

        #[tokio::test]
        async fn capacity_limit_enforced() {
            let queue = InMemoryQueue::with_config(QueueConfig {
                capacity: 2,
                ..QueueConfig::default()
            });

            queue.enqueue(test_job(1)).await.unwrap();
            queue.enqueue(test_job(2)).await.unwrap();

            match queue.enqueue(test_job(3)).await {
                Err(DispatchError::QueueFull { capacity }) => assert_eq!(capacity, 2),
                other => unreachable!("expected queue full, got {other:?}"),
            }
        }

        #[tokio::test(start_paused = true)]
        async fn nacked_job_redelivered_with_backoff() {
            let queue = InMemoryQueue::new();
            queue.enqueue(test_job(1)).await.unwrap();

            let lease = queue.recv().await.unwrap().expect("first lease");
            assert_eq!(lease.attempt, 1);
            queue.nack(&lease, "boom").await.unwrap();

            // Redelivery waits ~1s (base * 2^0); paused time auto-advances.
            let lease = queue.recv().await.unwrap().expect("second lease");
            assert_eq!(lease.attempt, 2);
            queue.nack(&lease, "boom again").await.unwrap();

            let lease = queue.recv().await.unwrap().expect("third lease");
            assert_eq!(lease.attempt, 3);
            queue.ack(&lease).await.unwrap();

            assert!(queue.failed_jobs().await.is_empty());
        }

        #[tokio::test(start_paused = true)]
        async fn exhausted_job_moves_to_dead_list() {
            let queue = InMemoryQueue::new();
            let job = test_job(1);
            queue.enqueue(job.clone()).await.unwrap();

            for expected_attempt in 1..=3 {
                let lease = queue.recv().await.unwrap().expect("lease expected");
                assert_eq!(lease.attempt, expected_attempt);
                queue.nack(&lease, "permanent failure").await.unwrap();
            }

            let dead = queue.failed_jobs().await;
            assert_eq!(dead.len(), 1);
            assert_eq!(dead[0].attempts_made, 3);
            assert_eq!(dead[0].last_error, "permanent failure");
            assert_eq!(dead[0].job.event_id, job.event_id);
            assert_eq!(queue.depth().await, 0);
        }

        #[tokio::test]
        async fn close_drains_consumers() {
            let queue = Arc::new(InMemoryQueue::new());

            let consumer = {
                let queue = queue.clone();
                tokio::spawn(async move { queue.recv().await })
            };

            queue.close().await;
            let received = consumer.await.expect("consumer task").expect("recv result");
            assert!(received.is_none(), "closed queue should yield None");
        }
    }
}
