//! Outbox dispatcher: drains pending outbox rows onto the job queue.
//!
//! A single polling loop claims due rows in batches, enqueues one job per
//! row keyed by event id, and records the outcome on the row: `completed`
//! on success, a backoff reschedule on failure, `failed` once attempts are
//! exhausted. Re-entrancy within the process is guarded by an atomic flag;
//! across processes the database claim provides the exclusion.
//!
//! Per aggregate, first-attempt delivery follows row creation order. After
//! retries a failed event can land behind a later success; handlers needing
//! strict per-aggregate order must re-sequence themselves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use emissary_core::models::{OutboxCounts, OutboxEntry};
use emissary_core::time::Clock;

use crate::error::{DispatchError, Result};
use crate::queue::{JobQueue, QueueJob};
use crate::retry::RetryPolicy;
use crate::storage::DispatchStorage;

/// Configuration for the outbox dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Polling period between empty ticks.
    pub poll_interval: Duration,

    /// Maximum rows claimed per tick.
    pub batch_size: usize,

    /// Interval after which a claimed-but-unfinished row is reclaimable.
    pub claim_timeout: Duration,

    /// Backoff policy for failed enqueues. `max_attempts` is advisory here;
    /// the per-row `max_retries` column is authoritative.
    pub retry_policy: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: crate::DEFAULT_POLL_INTERVAL,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            claim_timeout: crate::DEFAULT_CLAIM_TIMEOUT,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Polling dispatcher that moves outbox entries onto the external queue.
pub struct OutboxDispatcher {
    storage: Arc<dyn DispatchStorage>,
    queue: Arc<dyn JobQueue>,
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
    ticking: AtomicBool,
}

impl OutboxDispatcher {
    /// Creates a dispatcher over the given storage and queue.
    pub fn new(
        storage: Arc<dyn DispatchStorage>,
        queue: Arc<dyn JobQueue>,
        config: DispatcherConfig,
        clock: Arc<dyn Clock>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { storage, queue, config, clock, cancellation_token, ticking: AtomicBool::new(false) }
    }

    /// Runs the polling loop until the cancellation token fires.
    ///
    /// On shutdown the in-flight batch completes, no new claim cycles
    /// start, and the queue is closed.
    pub async fn run(&self) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            "outbox dispatcher starting"
        );

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            match self.tick().await {
                Ok(0) => {
                    tokio::select! {
                        () = self.clock.sleep(self.config.poll_interval) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Ok(dispatched) => {
                    debug!(dispatched, "dispatcher tick completed");
                },
                Err(error) => {
                    error!(error = %error, "dispatcher tick failed");
                    tokio::select! {
                        () = self.clock.sleep(Duration::from_secs(5)) => {
                            // Avoid a tight loop when the database is down.
                        },
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        self.queue.close().await;
        info!("outbox dispatcher stopped");
    }

    /// Forces one dispatch tick. Operator and test entrypoint.
    ///
    /// # Errors
    ///
    /// Returns error if claiming fails; per-entry enqueue failures are
    /// recorded on the rows, not returned.
    pub async fn trigger_once(&self) -> Result<usize> {
        self.tick().await
    }

    /// Returns outbox counts by status for health checks.
    ///
    /// # Errors
    ///
    /// Returns error if the count query fails.
    pub async fn metrics(&self) -> Result<OutboxCounts> {
        Ok(self.storage.counts().await?)
    }

    /// Claims and dispatches one batch. Returns the number of entries
    /// processed.
    async fn tick(&self) -> Result<usize> {
        // A tick already in flight means this invocation has nothing to do;
        // the claim query would only see locked rows anyway.
        if self.ticking.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }

        let result = self.dispatch_batch().await;
        self.ticking.store(false, Ordering::Release);
        result
    }

    async fn dispatch_batch(&self) -> Result<usize> {
        let entries =
            self.storage.claim_due(self.config.batch_size, self.config.claim_timeout).await?;

        if entries.is_empty() {
            return Ok(0);
        }

        debug!(claimed = entries.len(), "claimed outbox batch");

        let count = entries.len();
        for entry in entries {
            // The in-flight batch always completes, even during shutdown.
            self.dispatch_entry(entry).await;
        }

        Ok(count)
    }

    /// Enqueues one entry and records the outcome on its row.
    async fn dispatch_entry(&self, entry: OutboxEntry) {
        let job = QueueJob::from_outbox(&entry);

        match self.queue.enqueue(job).await {
            Ok(outcome) => {
                // Deduplicated means an earlier attempt already enqueued
                // this event; the row is complete either way.
                if let Err(error) = self.storage.mark_completed(entry.id).await {
                    error!(
                        outbox_id = %entry.id,
                        event_id = %entry.event_id,
                        error = %error,
                        "failed to mark outbox entry completed"
                    );
                    return;
                }

                debug!(
                    outbox_id = %entry.id,
                    event_id = %entry.event_id,
                    event_type = %entry.event_type,
                    outcome = ?outcome,
                    "outbox entry enqueued"
                );
            },
            Err(enqueue_error) => {
                self.record_enqueue_failure(&entry, &enqueue_error).await;
            },
        }
    }

    async fn record_enqueue_failure(&self, entry: &OutboxEntry, enqueue_error: &DispatchError) {
        let attempts = entry.retry_count + 1;
        let now = self.clock.now_utc();

        let next_retry_at = if attempts >= entry.max_retries {
            None
        } else {
            let delay = self.config.retry_policy.delay_after(attempts.unsigned_abs());
            Some(
                now + chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(1)),
            )
        };

        let result = self
            .storage
            .mark_failed(entry.id, attempts, next_retry_at, enqueue_error.to_string())
            .await;

        if let Err(error) = result {
            error!(
                outbox_id = %entry.id,
                event_id = %entry.event_id,
                error = %error,
                "failed to record enqueue failure"
            );
            return;
        }

        match next_retry_at {
            Some(next_retry_at) => warn!(
                outbox_id = %entry.id,
                event_id = %entry.event_id,
                attempts,
                next_retry_at = %next_retry_at,
                error = %enqueue_error,
                "enqueue failed, retry scheduled"
            ),
            None => error!(
                outbox_id = %entry.id,
                event_id = %entry.event_id,
                attempts,
                error = %enqueue_error,
                "enqueue failed permanently, entry parked for operator"
            ),
        }
    }
}
