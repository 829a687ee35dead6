//! Request context propagation across synchronous and asynchronous paths.
//!
//! Carries correlation id, causation id, and actor without threading them
//! through every signature. The context is bound to the current task via
//! [`tokio::task_local!`]; nested [`run`] calls replace the visible context
//! for the nested scope only.
//!
//! Code that crosses into background processing must not inherit the parent
//! scope implicitly: the worker constructs a fresh context from event
//! metadata with [`RequestContext::for_event`].

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::models::{Actor, EventId, EventMetadata};

/// Caller context for one logical request or background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Identifier shared by all events and logs triggered by one request.
    pub correlation_id: String,

    /// Id of the preceding command or event that caused this work.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// Caller identity.
    pub actor: Actor,
}

impl RequestContext {
    /// Creates a context for a fresh inbound request.
    pub fn new(correlation_id: impl Into<String>, actor: Actor) -> Self {
        Self { correlation_id: correlation_id.into(), causation_id: None, actor }
    }

    /// Creates a background context seeded from event metadata.
    ///
    /// The correlation id is preserved, the causation id becomes the event
    /// id, and the actor is copied from the metadata. Used at every async
    /// boundary instead of inheriting the parent scope's context.
    pub fn for_event(metadata: &EventMetadata, event_id: EventId) -> Self {
        Self {
            correlation_id: metadata.correlation_id.clone(),
            causation_id: Some(event_id.to_string()),
            actor: metadata.actor.clone(),
        }
    }

    /// Creates a context for internal work with no originating caller.
    pub fn system(correlation_id: impl Into<String>) -> Self {
        Self::new(correlation_id, Actor::system())
    }
}

tokio::task_local! {
    static CURRENT: RequestContext;
}

/// Executes `fut` with `context` bound as the current context.
///
/// Nested calls shadow the outer context for the duration of the inner
/// future only.
pub async fn run<F>(context: RequestContext, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(context, fut).await
}

/// Returns the currently-bound context, or `None` outside any [`run`] scope.
pub fn current() -> Option<RequestContext> {
    CURRENT.try_with(Clone::clone).ok()
}
