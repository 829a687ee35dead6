//! End-to-end delivery pipeline scenarios.
//!
//! Drives the real dispatcher, queue, worker, registry, and audit handler
//! over the in-memory storage seam: outbox rows are seeded as the write
//! path would have written them, then delivery runs exactly as in
//! production. Aggregate-side behavior (versioning, rule checks) is covered
//! by the core crate's unit and property tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use emissary_core::models::OutboxStatus;
use emissary_core::RealClock;
use emissary_delivery::storage::mock::{
    MockAuditStorage, MockDispatchStorage, MockWorkerStorage,
};
use emissary_delivery::{
    AuditHandler, AuditStorage, DispatcherConfig, EventHandler, HandlerRegistry, InMemoryQueue,
    JobQueue, OutboxDispatcher, QueueWorker, WorkerConfig,
};
use emissary_testing::{EventFixture, FlakyHandler};

struct Pipeline {
    dispatch_storage: Arc<MockDispatchStorage>,
    worker_storage: Arc<MockWorkerStorage>,
    audit_storage: Arc<MockAuditStorage>,
    queue: Arc<InMemoryQueue>,
    dispatcher: Arc<OutboxDispatcher>,
    worker_task: tokio::task::JoinHandle<()>,
    shutdown: CancellationToken,
}

impl Pipeline {
    /// Assembles the full delivery stack with the audit handler, optionally
    /// wrapped in a controlled-fault decorator.
    fn new(failures_before_success: Option<u32>) -> Self {
        let dispatch_storage = Arc::new(MockDispatchStorage::new());
        let worker_storage = Arc::new(MockWorkerStorage::new());
        let audit_storage = Arc::new(MockAuditStorage::new());
        let queue = Arc::new(InMemoryQueue::new());
        let shutdown = CancellationToken::new();

        let audit = Arc::new(AuditHandler::new(audit_storage.clone()));
        let handler: Arc<dyn EventHandler> = match failures_before_success {
            Some(failures) => Arc::new(FlakyHandler::new(audit, failures)),
            None => audit,
        };

        let registry = Arc::new(
            HandlerRegistry::builder()
                .register(handler)
                .expect("handler registration should succeed")
                .build(),
        );

        let dispatcher = Arc::new(OutboxDispatcher::new(
            dispatch_storage.clone(),
            queue.clone(),
            DispatcherConfig::default(),
            Arc::new(RealClock),
            shutdown.clone(),
        ));

        let worker = Arc::new(QueueWorker::new(
            queue.clone(),
            registry,
            worker_storage.clone(),
            WorkerConfig::default(),
            shutdown.clone(),
        ));

        let worker_task = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });

        Self {
            dispatch_storage,
            worker_storage,
            audit_storage,
            queue,
            dispatcher,
            worker_task,
            shutdown,
        }
    }

    /// Waits until the queue is fully drained (no live jobs).
    async fn drained(&self) {
        for _ in 0..10_000 {
            if self.queue.depth().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue did not drain");
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.queue.close().await;
        let _ = self.worker_task.await;
    }
}

#[tokio::test(start_paused = true)]
async fn create_then_activate_policy_produces_ordered_audit_trail() {
    let pipeline = Pipeline::new(None);

    let created = EventFixture::new("policy.created")
        .aggregate_id("policy-1")
        .correlation_id("c1")
        .payload(serde_json::json!({"id": "policy-1", "name": "P", "status": "draft"}));
    let activated = EventFixture::new("policy.activated")
        .aggregate_id("policy-1")
        .correlation_id("c1")
        .produced_at(Utc::now() + chrono::Duration::milliseconds(5))
        .payload(serde_json::json!({
            "id": "policy-1", "previous_status": "draft", "status": "active"
        }));

    let created_entry = created.outbox_entry();
    let activated_entry = activated.outbox_entry();
    let created_entry_id = created_entry.id;
    pipeline.dispatch_storage.add_entry(created_entry).await;
    pipeline.dispatch_storage.add_entry(activated_entry).await;

    let dispatched = pipeline.dispatcher.trigger_once().await.expect("tick should succeed");
    assert_eq!(dispatched, 2);
    pipeline.drained().await;

    // Outbox rows completed.
    assert_eq!(
        pipeline.dispatch_storage.entry_status(created_entry_id).await,
        Some(OutboxStatus::Completed)
    );

    // One ledger row per (event, handler).
    let ledger = pipeline.worker_storage.ledger_rows().await;
    assert_eq!(ledger.len(), 2);
    assert!(ledger.iter().all(|(_, handler)| handler == "audit"));
    assert!(ledger.iter().any(|(event_id, _)| *event_id == created.event_id()));

    // Audit trail in per-aggregate order with the transition change map.
    let records = pipeline.audit_storage.find_by_entity("policy", "policy-1").await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].action, "create");
    assert_eq!(records[0].correlation_id, "c1");
    assert_eq!(records[1].action, "activate");
    let status_change = records[1].changes.0.get("status").expect("status change expected");
    assert_eq!(status_change.from, serde_json::json!("draft"));
    assert_eq!(status_change.to, serde_json::json!("active"));

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn controlled_fault_succeeds_on_third_attempt() {
    // Audit handler fails attempts 1 and 2, succeeds on attempt 3.
    let pipeline = Pipeline::new(Some(2));

    let fixture = EventFixture::new("policy.created")
        .aggregate_id("policy-flaky")
        .simulate_failure()
        .payload(serde_json::json!({"id": "policy-flaky", "name": "P", "status": "draft"}));
    pipeline.dispatch_storage.add_entry(fixture.outbox_entry()).await;

    pipeline.dispatcher.trigger_once().await.expect("tick should succeed");
    pipeline.drained().await;

    // Exactly one audit row and one ledger row despite two failures.
    let records = pipeline.audit_storage.find_by_entity("policy", "policy-flaky").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].action, "create");

    let ledger = pipeline.worker_storage.ledger_rows().await;
    assert_eq!(ledger, vec![(fixture.event_id(), "audit".to_string())]);

    assert!(pipeline.queue.failed_jobs().await.is_empty());

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn dead_letter_after_exhausted_queue_attempts() {
    // Audit handler never succeeds.
    let pipeline = Pipeline::new(Some(u32::MAX));

    let fixture = EventFixture::new("policy.created")
        .aggregate_id("policy-dead")
        .simulate_failure()
        .payload(serde_json::json!({"id": "policy-dead", "name": "P", "status": "draft"}));
    let entry = fixture.outbox_entry();
    let entry_id = entry.id;
    pipeline.dispatch_storage.add_entry(entry).await;

    pipeline.dispatcher.trigger_once().await.expect("tick should succeed");
    pipeline.drained().await;

    // The outbox row is completed (enqueue succeeded); the failure lives on
    // the queue's dead list for operators.
    assert_eq!(
        pipeline.dispatch_storage.entry_status(entry_id).await,
        Some(OutboxStatus::Completed)
    );

    let records = pipeline.audit_storage.find_by_entity("policy", "policy-dead").await.unwrap();
    assert!(records.is_empty(), "no audit row may exist");
    assert!(pipeline.worker_storage.ledger_rows().await.is_empty(), "no ledger row may exist");

    let dead = pipeline.queue.failed_jobs().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts_made, 3);
    assert_eq!(dead[0].job.event_id, fixture.event_id());

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn per_aggregate_audit_order_preserved() {
    let pipeline = Pipeline::new(None);

    let base = Utc::now();
    for (offset, event_type, payload) in [
        (0, "action.created", serde_json::json!({"id": "a1", "name": "task", "status": "active"})),
        (5, "action.updated", serde_json::json!({"id": "a1", "name": "task v2", "status": "active"})),
        (
            10,
            "action.completed",
            serde_json::json!({"id": "a1", "previous_status": "active", "status": "completed"}),
        ),
    ] {
        let fixture = EventFixture::new(event_type)
            .aggregate_id("a1")
            .produced_at(base + chrono::Duration::milliseconds(offset))
            .payload(payload);
        pipeline.dispatch_storage.add_entry(fixture.outbox_entry()).await;
    }

    pipeline.dispatcher.trigger_once().await.expect("tick should succeed");
    pipeline.drained().await;

    let records = pipeline.audit_storage.find_by_entity("action", "a1").await.unwrap();
    let actions: Vec<&str> = records.iter().map(|r| r.action.as_str()).collect();
    assert_eq!(actions, vec!["create", "update", "complete"]);

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn crashed_claim_is_reclaimed_and_enqueued_once() {
    let pipeline = Pipeline::new(None);

    // Simulate a dispatcher that died between claim and enqueue: the row is
    // stuck in `processing` with an elapsed reclaim deadline.
    let fixture = EventFixture::new("policy.created")
        .aggregate_id("policy-crash")
        .payload(serde_json::json!({"id": "policy-crash", "name": "P", "status": "draft"}));
    let mut entry = fixture.outbox_entry();
    entry.status = OutboxStatus::Processing;
    entry.next_retry_at = Some(Utc::now() - chrono::Duration::seconds(60));
    let entry_id = entry.id;
    pipeline.dispatch_storage.add_entry(entry).await;

    let dispatched = pipeline.dispatcher.trigger_once().await.expect("tick should succeed");
    assert_eq!(dispatched, 1, "stale processing row must be reclaimed");
    pipeline.drained().await;

    assert_eq!(
        pipeline.dispatch_storage.entry_status(entry_id).await,
        Some(OutboxStatus::Completed)
    );

    // Exactly one delivery happened.
    let records = pipeline.audit_storage.find_by_entity("policy", "policy-crash").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(pipeline.worker_storage.ledger_rows().await.len(), 1);

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_dispatchers_claim_disjoint_rows() {
    let pipeline = Pipeline::new(None);

    // A second dispatcher process sharing the same storage and queue.
    let second_dispatcher = Arc::new(OutboxDispatcher::new(
        pipeline.dispatch_storage.clone(),
        pipeline.queue.clone(),
        DispatcherConfig::default(),
        Arc::new(RealClock),
        CancellationToken::new(),
    ));

    let base = Utc::now();
    let mut event_ids = Vec::new();
    for i in 0..8 {
        let fixture = EventFixture::new("policy.created")
            .aggregate_id(format!("policy-{i}"))
            .produced_at(base + chrono::Duration::milliseconds(i))
            .payload(serde_json::json!({"id": format!("policy-{i}"), "status": "draft"}));
        event_ids.push(fixture.event_id());
        pipeline.dispatch_storage.add_entry(fixture.outbox_entry()).await;
    }

    let (first, second) = tokio::join!(
        pipeline.dispatcher.trigger_once(),
        second_dispatcher.trigger_once(),
    );
    let total = first.expect("first tick") + second.expect("second tick");
    assert_eq!(total, 8, "every row claimed exactly once across dispatchers");

    pipeline.drained().await;

    // One ledger row per event: nothing was processed twice.
    let ledger = pipeline.worker_storage.ledger_rows().await;
    assert_eq!(ledger.len(), 8);

    let counts = pipeline.dispatcher.metrics().await.expect("metrics");
    assert_eq!(counts.completed, 8);
    assert_eq!(counts.pending + counts.processing + counts.failed, 0);

    pipeline.stop().await;
}
