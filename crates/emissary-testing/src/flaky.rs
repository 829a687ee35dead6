//! Controlled-fault handler decorator.
//!
//! Wraps a real handler and fails its first invocations for events flagged
//! with `simulate_failure` metadata, keyed per `(aggregate id, event type)`.
//! Used to exercise the queue and outbox retry ladders; the production
//! binary never constructs one, keeping fault simulation out of the
//! production critical path.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use emissary_delivery::{DispatchError, EventHandler, HandlerEvent};

/// Decorator failing the first `failures_before_success` invocations per
/// `(aggregate id, event type)` key, then delegating to the inner handler.
///
/// Only events carrying `simulate_failure: true` in their metadata extras
/// are affected; everything else passes straight through.
pub struct FlakyHandler {
    inner: Arc<dyn EventHandler>,
    failures_before_success: u32,
    attempts: Mutex<HashMap<(String, String), u32>>,
}

impl FlakyHandler {
    /// Wraps `inner`, failing its first `failures_before_success` flagged
    /// invocations per key.
    pub fn new(inner: Arc<dyn EventHandler>, failures_before_success: u32) -> Self {
        Self { inner, failures_before_success, attempts: Mutex::new(HashMap::new()) }
    }

    /// Number of invocations observed for one key.
    pub async fn attempts_for(&self, aggregate_id: &str, event_type: &str) -> u32 {
        self.attempts
            .lock()
            .await
            .get(&(aggregate_id.to_string(), event_type.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn is_flagged(event: &HandlerEvent) -> bool {
        event
            .metadata
            .extra
            .get("simulate_failure")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

#[async_trait]
impl EventHandler for FlakyHandler {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn event_types(&self) -> Vec<String> {
        self.inner.event_types()
    }

    async fn invoke(&self, event: &HandlerEvent) -> emissary_delivery::Result<()> {
        if Self::is_flagged(event) {
            let key = (event.aggregate_id.clone(), event.event_type.clone());
            let mut attempts = self.attempts.lock().await;
            let count = attempts.entry(key).or_insert(0);
            *count += 1;

            if *count <= self.failures_before_success {
                let attempt = *count;
                drop(attempts);
                return Err(DispatchError::handler(
                    self.inner.name(),
                    format!("simulated failure on attempt {attempt}"),
                ));
            }
        }

        self.inner.invoke(event).await
    }
}
