//! Queue worker: consumes jobs and dispatches events to handlers.
//!
//! For each leased job the worker reconstructs the domain event, binds a
//! fresh request context from the event metadata, and fans out to every
//! subscribed handler under a bounded concurrency limit. The idempotency
//! ledger gates each handler: already-witnessed handlers are skipped, and
//! completion is recorded with insert-if-absent semantics so redelivery
//! never double-applies a side effect.
//!
//! Job outcome aggregation: any handler failure fails the job (the queue
//! redelivers it on its own retry ladder); if every handler failed the log
//! severity escalates; if all succeeded the job is acknowledged.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use emissary_core::context::{self, RequestContext};

use crate::error::{DispatchError, Result};
use crate::queue::{JobConsumer, JobLease};
use crate::registry::{HandlerEvent, HandlerRegistry};
use crate::storage::WorkerStorage;

/// Configuration for the queue worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Bound on concurrent handler invocations per job.
    pub handler_concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { handler_concurrency: crate::DEFAULT_HANDLER_CONCURRENCY }
    }
}

/// Per-handler result of one job dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
enum HandlerOutcome {
    /// Handler ran and its completion is on the ledger.
    Completed,
    /// Ledger already witnessed this handler; invocation skipped.
    AlreadyProcessed,
    /// Handler or ledger insert failed.
    Failed(String),
}

/// Aggregated result of one job.
#[derive(Debug, Default)]
struct JobOutcome {
    completed: usize,
    skipped: usize,
    failures: Vec<(String, String)>,
    total: usize,
}

impl JobOutcome {
    fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    fn all_failed(&self) -> bool {
        self.total > 0 && self.failures.len() == self.total
    }
}

/// Worker that drains the job queue and invokes registered handlers.
pub struct QueueWorker {
    consumer: Arc<dyn JobConsumer>,
    registry: Arc<HandlerRegistry>,
    storage: Arc<dyn WorkerStorage>,
    config: WorkerConfig,
    cancellation_token: CancellationToken,
}

impl QueueWorker {
    /// Creates a worker over the given consumer, registry, and ledger.
    pub fn new(
        consumer: Arc<dyn JobConsumer>,
        registry: Arc<HandlerRegistry>,
        storage: Arc<dyn WorkerStorage>,
        config: WorkerConfig,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { consumer, registry, storage, config, cancellation_token }
    }

    /// Runs the consume loop until cancellation or queue close.
    pub async fn run(&self) {
        info!(
            handlers = self.registry.len(),
            handler_concurrency = self.config.handler_concurrency,
            "queue worker starting"
        );

        loop {
            let lease = tokio::select! {
                lease = self.consumer.recv() => lease,
                () = self.cancellation_token.cancelled() => break,
            };

            match lease {
                Ok(Some(lease)) => self.process_job(lease).await,
                Ok(None) => {
                    info!("queue closed, worker draining complete");
                    break;
                },
                Err(error) => {
                    error!(error = %error, "job receive failed");
                },
            }
        }

        info!("queue worker stopped");
    }

    /// Processes one leased job end to end.
    async fn process_job(&self, lease: JobLease) {
        let event = HandlerEvent::from(lease.job.clone());
        let event_id = event.id;
        let event_type = event.event_type.clone();

        // Background work never inherits the producer's scope; the context
        // is rebuilt from the event metadata (correlation preserved,
        // causation = event id).
        let ctx = RequestContext::for_event(&event.metadata, event.id);
        let correlation_id = ctx.correlation_id.clone();
        let outcome = context::run(ctx, self.dispatch_event(&event, &lease)).await;

        if outcome.succeeded() {
            debug!(
                event_id = %event_id,
                event_type = %event_type,
                correlation_id = %correlation_id,
                completed = outcome.completed,
                skipped = outcome.skipped,
                "job processed"
            );
            if let Err(error) = self.consumer.ack(&lease).await {
                error!(event_id = %event_id, error = %error, "job acknowledgment failed");
            }
            return;
        }

        let summary = outcome
            .failures
            .iter()
            .map(|(handler, message)| format!("{handler}: {message}"))
            .collect::<Vec<_>>()
            .join("; ");

        if outcome.all_failed() {
            error!(
                event_id = %event_id,
                event_type = %event_type,
                correlation_id = %correlation_id,
                attempt = lease.attempt,
                failures = %summary,
                "all handlers failed for event"
            );
        } else {
            warn!(
                event_id = %event_id,
                event_type = %event_type,
                correlation_id = %correlation_id,
                attempt = lease.attempt,
                completed = outcome.completed,
                failures = %summary,
                "some handlers failed for event"
            );
        }

        if let Err(error) = self.consumer.nack(&lease, &summary).await {
            error!(event_id = %event_id, error = %error, "job rejection failed");
        }
    }

    /// Fans the event out to all subscribed handlers.
    async fn dispatch_event(&self, event: &HandlerEvent, lease: &JobLease) -> JobOutcome {
        let handlers = self.registry.handlers_for(&event.event_type);
        if handlers.is_empty() {
            debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                "no handlers subscribed, acknowledging"
            );
            return JobOutcome::default();
        }

        let total = handlers.len();
        let semaphore = Arc::new(Semaphore::new(self.config.handler_concurrency.max(1)));
        let mut join_set = JoinSet::new();

        for handler in handlers {
            let handler = handler.clone();
            let storage = self.storage.clone();
            let event = event.clone();
            let semaphore = semaphore.clone();
            let deadline = lease.visibility_timeout;
            let ctx = RequestContext::for_event(&event.metadata, event.id);

            join_set.spawn(async move {
                // The semaphore is never closed, so acquisition cannot fail.
                let _permit = semaphore.acquire_owned().await.ok();
                let name = handler.name().to_string();
                let outcome = context::run(
                    ctx,
                    invoke_handler(handler.as_ref(), &storage, &event, deadline),
                )
                .await;
                (name, outcome)
            });
        }

        let mut outcome = JobOutcome { total, ..Default::default() };

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, HandlerOutcome::Completed)) => {
                    debug!(event_id = %event.id, handler = %name, "handler completed");
                    outcome.completed += 1;
                },
                Ok((name, HandlerOutcome::AlreadyProcessed)) => {
                    debug!(
                        event_id = %event.id,
                        handler = %name,
                        "handler already witnessed by ledger, skipped"
                    );
                    outcome.skipped += 1;
                },
                Ok((name, HandlerOutcome::Failed(message))) => {
                    outcome.failures.push((name, message));
                },
                Err(join_error) => {
                    // A panicking handler must not take the worker down.
                    outcome.failures.push(("<panicked>".to_string(), join_error.to_string()));
                },
            }
        }

        outcome
    }
}

/// Invokes one handler with ledger gating and a delivery deadline.
async fn invoke_handler(
    handler: &dyn crate::registry::EventHandler,
    storage: &Arc<dyn WorkerStorage>,
    event: &HandlerEvent,
    deadline: std::time::Duration,
) -> HandlerOutcome {
    let name = handler.name();

    match storage.is_processed(event.id, name).await {
        Ok(true) => return HandlerOutcome::AlreadyProcessed,
        Ok(false) => {},
        Err(error) => return HandlerOutcome::Failed(format!("ledger lookup failed: {error}")),
    }

    let invocation = tokio::time::timeout(deadline, handler.invoke(event)).await;
    match invocation {
        Ok(Ok(())) => {},
        Ok(Err(error)) => return HandlerOutcome::Failed(error.to_string()),
        Err(_elapsed) => {
            let error = DispatchError::HandlerDeadlineExceeded {
                handler: name.to_string(),
                timeout_secs: deadline.as_secs(),
            };
            return HandlerOutcome::Failed(error.to_string());
        },
    }

    // Duplicate key inside record_processed is success; only real failures
    // surface here, and they fail the job so the queue redelivers.
    match storage.record_processed(event.id, name).await {
        Ok(()) => HandlerOutcome::Completed,
        Err(error) => HandlerOutcome::Failed(format!("ledger insert failed: {error}")),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Utc;
    use emissary_core::models::{Actor, EventId, EventMetadata, OutboxEnvelope};

    use super::*;
    use crate::queue::memory::InMemoryQueue;
    use crate::queue::{JobQueue, QueueJob};
    use crate::registry::EventHandler;
    use crate::storage::mock::MockWorkerStorage;

    /// Counts invocations; optionally fails the first `fail_first` calls.
    #[derive(Debug)]
    struct CountingHandler {
        name: &'static str,
        invocations: Arc<AtomicUsize>,
        fail_first: usize,
    }

    impl CountingHandler {
        fn new(name: &'static str) -> (Arc<Self>, Arc<AtomicUsize>) {
            Self::failing(name, 0)
        }

        fn failing(name: &'static str, fail_first: usize) -> (Arc<Self>, Arc<AtomicUsize>) {
            let invocations = Arc::new(AtomicUsize::new(0));
            let handler =
                Arc::new(Self { name, invocations: invocations.clone(), fail_first });
            (handler, invocations)
        }
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        fn name(&self) -> &str {
            self.name
        }

        fn event_types(&self) -> Vec<String> {
            vec!["policy.created".to_string()]
        }

        async fn invoke(&self, _event: &HandlerEvent) -> Result<()> {
            let call = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                return Err(DispatchError::handler(self.name, format!("induced failure {call}")));
            }
            Ok(())
        }
    }

    /// Asserts the task-local context was rebuilt from event metadata.
    #[derive(Debug)]
    struct ContextAssertingHandler {
        seen: Arc<tokio::sync::Mutex<Option<RequestContext>>>,
    }

    #[async_trait]
    impl EventHandler for ContextAssertingHandler {
        fn name(&self) -> &str {
            "context-assert"
        }

        fn event_types(&self) -> Vec<String> {
            vec!["policy.created".to_string()]
        }

        async fn invoke(&self, _event: &HandlerEvent) -> Result<()> {
            *self.seen.lock().await = context::current();
            Ok(())
        }
    }

    fn test_job() -> QueueJob {
        QueueJob {
            event_id: EventId::new(),
            event_type: "policy.created".to_string(),
            aggregate_type: "policy".to_string(),
            aggregate_id: "p1".to_string(),
            payload: OutboxEnvelope {
                payload: serde_json::json!({"name": "P", "status": "draft"}),
                metadata: EventMetadata {
                    correlation_id: "c1".into(),
                    causation_id: Some("cmd-1".into()),
                    actor: Actor::new("u1", "u1@example.com"),
                    produced_at: Utc::now(),
                    schema_version: 1,
                    extra: serde_json::Map::new(),
                },
            },
        }
    }

    fn registry_with(handlers: Vec<Arc<dyn EventHandler>>) -> Arc<HandlerRegistry> {
        let mut builder = HandlerRegistry::builder();
        for handler in handlers {
            builder = builder.register(handler).expect("registration should succeed");
        }
        Arc::new(builder.build())
    }

    async fn worker_for(
        queue: &Arc<InMemoryQueue>,
        registry: Arc<HandlerRegistry>,
        storage: Arc<MockWorkerStorage>,
    ) -> QueueWorker {
        QueueWorker::new(
            queue.clone(),
            registry,
            storage,
            WorkerConfig::default(),
            CancellationToken::new(),
        )
    }

    /// Drains the queue through the worker until it is empty.
    async fn drain(queue: &Arc<InMemoryQueue>, worker: &QueueWorker) {
        while let Some(lease) =
            tokio::time::timeout(std::time::Duration::from_secs(30), queue.recv())
                .await
                .expect("queue should produce or close promptly")
                .expect("recv should not error")
        {
            worker.process_job(lease).await;
            if queue.depth().await == 0 {
                break;
            }
        }
    }

    #[tokio::test]
    async fn successful_job_records_ledger_row_per_handler() {
        let queue = Arc::new(InMemoryQueue::new());
        let storage = Arc::new(MockWorkerStorage::new());
        let (handler, invocations) = CountingHandler::new("audit");
        let registry = registry_with(vec![handler]);

        let job = test_job();
        let event_id = job.event_id;
        queue.enqueue(job).await.expect("enqueue");

        let worker = worker_for(&queue, registry, storage.clone()).await;
        drain(&queue, &worker).await;

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(storage.ledger_rows().await, vec![(event_id, "audit".to_string())]);
        assert_eq!(queue.depth().await, 0);
    }

    #[tokio::test]
    async fn redelivery_skips_handlers_on_ledger() {
        let queue = Arc::new(InMemoryQueue::new());
        let storage = Arc::new(MockWorkerStorage::new());
        let (handler, invocations) = CountingHandler::new("audit");
        let registry = registry_with(vec![handler]);

        let job = test_job();
        let event_id = job.event_id;

        let worker = worker_for(&queue, registry, storage.clone()).await;

        // Deliver the same event twice (simulates queue redelivery after a
        // crash between side effect and acknowledgment).
        for _ in 0..2 {
            queue.enqueue(job.clone()).await.expect("enqueue");
            drain(&queue, &worker).await;
        }

        assert_eq!(invocations.load(Ordering::SeqCst), 1, "second delivery must be skipped");
        assert_eq!(storage.ledger_rows().await.len(), 1);
        let _ = event_id;
    }

    #[tokio::test(start_paused = true)]
    async fn failing_handler_fails_job_until_it_succeeds() {
        let queue = Arc::new(InMemoryQueue::new());
        let storage = Arc::new(MockWorkerStorage::new());
        // Fails attempts 1 and 2, succeeds on attempt 3.
        let (handler, invocations) = CountingHandler::failing("audit", 2);
        let registry = registry_with(vec![handler]);

        let job = test_job();
        let event_id = job.event_id;
        queue.enqueue(job).await.expect("enqueue");

        let worker = worker_for(&queue, registry, storage.clone()).await;
        drain(&queue, &worker).await;

        assert_eq!(invocations.load(Ordering::SeqCst), 3);
        assert_eq!(storage.ledger_rows().await, vec![(event_id, "audit".to_string())]);
        assert!(queue.failed_jobs().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn permanently_failing_handler_dead_letters_job() {
        let queue = Arc::new(InMemoryQueue::new());
        let storage = Arc::new(MockWorkerStorage::new());
        let (handler, invocations) = CountingHandler::failing("audit", usize::MAX);
        let registry = registry_with(vec![handler]);

        let job = test_job();
        queue.enqueue(job).await.expect("enqueue");

        let worker = worker_for(&queue, registry, storage.clone()).await;
        drain(&queue, &worker).await;

        // Queue policy: 3 attempts, then the dead list.
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
        assert!(storage.ledger_rows().await.is_empty(), "no ledger row without success");

        let dead = queue.failed_jobs().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts_made, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_failure_retries_only_unfinished_handlers() {
        let queue = Arc::new(InMemoryQueue::new());
        let storage = Arc::new(MockWorkerStorage::new());
        let (good, good_calls) = CountingHandler::new("projection");
        let (flaky, flaky_calls) = CountingHandler::failing("audit", 1);
        let registry = registry_with(vec![good, flaky]);

        let job = test_job();
        let event_id = job.event_id;
        queue.enqueue(job).await.expect("enqueue");

        let worker = worker_for(&queue, registry, storage.clone()).await;
        drain(&queue, &worker).await;

        // The successful handler ran once; the redelivery skipped it via
        // the ledger and only re-ran the failed one.
        assert_eq!(good_calls.load(Ordering::SeqCst), 1);
        assert_eq!(flaky_calls.load(Ordering::SeqCst), 2);

        let mut expected =
            vec![(event_id, "audit".to_string()), (event_id, "projection".to_string())];
        expected.sort();
        assert_eq!(storage.ledger_rows().await, expected);
    }

    #[tokio::test]
    async fn event_with_no_handlers_is_acknowledged() {
        let queue = Arc::new(InMemoryQueue::new());
        let storage = Arc::new(MockWorkerStorage::new());
        let registry = registry_with(vec![]);

        queue.enqueue(test_job()).await.expect("enqueue");

        let worker = worker_for(&queue, registry, storage.clone()).await;
        drain(&queue, &worker).await;

        assert_eq!(queue.depth().await, 0);
        assert!(queue.failed_jobs().await.is_empty());
        assert!(storage.ledger_rows().await.is_empty());
    }

    #[tokio::test]
    async fn handler_sees_background_context_from_metadata() {
        let queue = Arc::new(InMemoryQueue::new());
        let storage = Arc::new(MockWorkerStorage::new());
        let seen = Arc::new(tokio::sync::Mutex::new(None));
        let handler = Arc::new(ContextAssertingHandler { seen: seen.clone() });
        let registry = registry_with(vec![handler]);

        let job = test_job();
        let event_id = job.event_id;
        queue.enqueue(job).await.expect("enqueue");

        let worker = worker_for(&queue, registry, storage).await;
        drain(&queue, &worker).await;

        let ctx = seen.lock().await.clone().expect("handler should observe a context");
        assert_eq!(ctx.correlation_id, "c1");
        assert_eq!(ctx.causation_id, Some(event_id.to_string()));
        assert_eq!(ctx.actor.id, "u1");
    }

    #[tokio::test]
    async fn ledger_insert_failure_fails_job_for_redelivery() {
        let queue = Arc::new(InMemoryQueue::new());
        let storage = Arc::new(MockWorkerStorage::new());
        storage.inject_record_error("audit", "connection lost").await;

        let (handler, invocations) = CountingHandler::new("audit");
        let registry = registry_with(vec![handler]);

        queue.enqueue(test_job()).await.expect("enqueue");

        let worker = worker_for(&queue, registry, storage.clone()).await;

        // First delivery: handler runs, ledger insert fails, job is nacked.
        let lease = queue.recv().await.expect("recv").expect("lease");
        worker.process_job(lease).await;

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert!(storage.ledger_rows().await.is_empty());
        assert_eq!(queue.depth().await, 1, "job must stay live for redelivery");
    }
}
