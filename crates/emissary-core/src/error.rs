//! Error taxonomy and result handling for commands and aggregates.
//!
//! Expected failures are values, not panics: aggregates and command handlers
//! return [`DomainError`] with a string-coded [`ErrorKind`] so the boundary
//! layer can map failures to transport categories without downcasting.
//! Infrastructure code surfaces [`CoreError`], which the command layer
//! converts into `infrastructure`-kind domain errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for infrastructure operations using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Result type alias for domain operations using [`DomainError`].
pub type DomainResult<T> = std::result::Result<T, DomainError>;

/// Core error type for storage and other infrastructure operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique, foreign-key, or check constraint violation.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input rejected before reaching the database.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

/// Discriminator for expected command and aggregate failures.
///
/// Codes are stable strings consumed by boundary layers; they are never
/// subclass names. The transport mapping lives in [`ErrorKind::status_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Field-level input constraint violated.
    Validation,
    /// Referenced entity does not exist.
    NotFound,
    /// State conflict that is not a version race.
    Conflict,
    /// Expected aggregate version did not match the stored version.
    OptimisticLock,
    /// Caller identity missing or invalid.
    Unauthorized,
    /// Caller identity valid but not permitted.
    Forbidden,
    /// Aggregate rule violated; carries a rule identifier.
    BusinessRule,
    /// Database-level serialization or uniqueness race.
    Concurrency,
    /// Upstream service failure; carries the service name.
    Infrastructure,
    /// Invariant violation indicating a programming bug.
    Internal,
}

impl ErrorKind {
    /// Returns the stable string code for this kind.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not-found",
            Self::Conflict => "conflict",
            Self::OptimisticLock => "optimistic-lock",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::BusinessRule => "business-rule",
            Self::Concurrency => "concurrency",
            Self::Infrastructure => "infrastructure",
            Self::Internal => "internal",
        }
    }

    /// Maps this kind to an HTTP-style category code for boundary layers.
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::Conflict | Self::OptimisticLock | Self::Concurrency => 409,
            Self::BusinessRule => 422,
            Self::Infrastructure => 503,
            Self::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Expected failure returned by aggregates and command handlers.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct DomainError {
    /// Failure category.
    pub kind: ErrorKind,

    /// Rule identifier for business-rule and version failures,
    /// e.g. `policy.activate.not_draft`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,

    /// Human-readable description of the failure.
    pub message: String,

    /// Structured context (offending field, expected/actual versions).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// Upstream service name for infrastructure failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

impl DomainError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, rule: None, message: message.into(), details: None, service: None }
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Creates a validation error with structured details.
    pub fn validation_with_details(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self { details: Some(details), ..Self::new(ErrorKind::Validation, message) }
    }

    /// Creates a not-found error for an entity type and id.
    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound, format!("{entity} {id} not found"))
    }

    /// Creates a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    /// Creates a business-rule error carrying a rule identifier.
    pub fn business_rule(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self { rule: Some(rule.into()), ..Self::new(ErrorKind::BusinessRule, message) }
    }

    /// Creates an optimistic-lock error from a version mismatch.
    pub fn optimistic_lock(rule: impl Into<String>, expected: i32, actual: i32) -> Self {
        Self {
            rule: Some(rule.into()),
            details: Some(serde_json::json!({ "expected": expected, "actual": actual })),
            ..Self::new(
                ErrorKind::OptimisticLock,
                format!("version mismatch: expected {expected}, found {actual}"),
            )
        }
    }

    /// Creates a concurrency error from a database-level race.
    pub fn concurrency(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Concurrency, message)
    }

    /// Creates an infrastructure error carrying the upstream service name.
    pub fn infrastructure(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self { service: Some(service.into()), ..Self::new(ErrorKind::Infrastructure, message) }
    }

    /// Creates an internal error for invariant violations.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Returns true if retrying the same command could succeed after reload.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::OptimisticLock | ErrorKind::Concurrency | ErrorKind::Infrastructure
        )
    }
}

impl From<CoreError> for DomainError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound(message) => Self::new(ErrorKind::NotFound, message),
            CoreError::ConstraintViolation(message) => Self::concurrency(message),
            CoreError::InvalidInput(message) => Self::validation(message),
            CoreError::Database(message) => Self::infrastructure("postgres", message),
        }
    }
}
