//! Error types for dispatch and worker operations.
//!
//! Errors carry enough context for debugging and are partitioned into
//! retryable and terminal categories so the dispatcher and queue can make
//! retry decisions without string matching.

use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Error conditions in the dispatch and worker pipeline.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Queue rejected or failed an enqueue.
    #[error("queue error: {message}")]
    QueueError {
        /// Description of the queue failure.
        message: String,
    },

    /// Queue at capacity.
    #[error("queue full: capacity {capacity} reached")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// Job payload could not be serialized or deserialized.
    #[error("serialization error: {message}")]
    SerializationError {
        /// Description of the codec failure.
        message: String,
    },

    /// Database operation failed during dispatch or ledger access.
    #[error("database error: {message}")]
    DatabaseError {
        /// Database error message.
        message: String,
    },

    /// Invalid wiring detected at startup.
    #[error("configuration error: {message}")]
    ConfigurationError {
        /// Description of the misconfiguration.
        message: String,
    },

    /// A handler reported failure for an event.
    #[error("handler '{handler}' failed: {message}")]
    HandlerFailed {
        /// Name of the failing handler.
        handler: String,
        /// Failure description.
        message: String,
    },

    /// A handler exceeded the job's delivery deadline.
    #[error("handler '{handler}' exceeded deadline of {timeout_secs}s")]
    HandlerDeadlineExceeded {
        /// Name of the timed-out handler.
        handler: String,
        /// Deadline that was exceeded, in seconds.
        timeout_secs: u64,
    },

    /// Shutdown signal received.
    #[error("shutdown requested")]
    ShutdownRequested,

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message.
        message: String,
    },
}

impl DispatchError {
    /// Creates a queue error from a message.
    pub fn queue(message: impl Into<String>) -> Self {
        Self::QueueError { message: message.into() }
    }

    /// Creates a queue-full error.
    pub fn queue_full(capacity: usize) -> Self {
        Self::QueueFull { capacity }
    }

    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError { message: message.into() }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::DatabaseError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates a handler failure.
    pub fn handler(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HandlerFailed { handler: handler.into(), message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Returns true for transient failures worth another attempt.
    ///
    /// Queue, database, and handler failures are retryable; configuration
    /// and serialization problems will not improve with repetition.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::QueueError { .. }
            | Self::QueueFull { .. }
            | Self::DatabaseError { .. }
            | Self::HandlerFailed { .. }
            | Self::HandlerDeadlineExceeded { .. } => true,

            Self::SerializationError { .. }
            | Self::ConfigurationError { .. }
            | Self::ShutdownRequested
            | Self::InternalError { .. } => false,
        }
    }
}

impl From<emissary_core::CoreError> for DispatchError {
    fn from(err: emissary_core::CoreError) -> Self {
        Self::DatabaseError { message: err.to_string() }
    }
}
