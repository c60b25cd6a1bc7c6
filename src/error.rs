//! Structured error types for broker operations.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Error codes for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed input; the caller must fix it before retrying.
    InvalidSpec,
    /// Access check failed; retrying without a grant is pointless.
    Unauthorized,
    /// Dedup collision or other uniqueness conflict.
    DuplicateKey,
    /// Admission control rejected the call; retry after `retry_after`.
    RateLimited,
    NotFound,
    InternalError,
}

/// Structured error returned by every broker operation.
#[derive(Debug, Serialize)]
pub struct BrokerError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Seconds the caller should wait before retrying (rate limiting only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
}

impl BrokerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field: None,
            retry_after: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    // Convenience constructors

    pub fn invalid_spec(field: &str, reason: &str) -> Self {
        Self::new(ErrorCode::InvalidSpec, reason).with_field(field)
    }

    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, reason)
    }

    pub fn duplicate_key(what: impl fmt::Display) -> Self {
        Self::new(ErrorCode::DuplicateKey, format!("Duplicate key: {}", what))
    }

    pub fn rate_limited(delay: Duration) -> Self {
        Self {
            retry_after: Some(delay.as_secs_f64()),
            ..Self::new(ErrorCode::RateLimited, "Too many requests")
        }
    }

    pub fn project_not_found(project_id: i64) -> Self {
        Self::new(
            ErrorCode::NotFound,
            format!("Project not found: {}", project_id),
        )
    }

    pub fn worker_not_found(worker_id: i64) -> Self {
        Self::new(
            ErrorCode::NotFound,
            format!("Worker not found: {}", worker_id),
        )
    }

    pub fn task_not_found(task_id: i64) -> Self {
        Self::new(ErrorCode::NotFound, format!("Task not found: {}", task_id))
    }

    pub fn internal(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::InternalError, err.to_string())
    }

    /// Delay carried by a rate-limit rejection.
    pub fn retry_delay(&self) -> Option<Duration> {
        self.retry_after
            .map(|secs| Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for BrokerError {}

/// True when the SQLite error is a UNIQUE (or primary key) constraint failure.
fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        }
        _ => false,
    }
}

impl From<rusqlite::Error> for BrokerError {
    fn from(err: rusqlite::Error) -> Self {
        if is_unique_violation(&err) {
            let what = match &err {
                rusqlite::Error::SqliteFailure(_, Some(msg)) => msg.clone(),
                _ => err.to_string(),
            };
            BrokerError::duplicate_key(what)
        } else {
            BrokerError::internal(err)
        }
    }
}

// Allow using ? with anyhow errors from the storage layer
impl From<anyhow::Error> for BrokerError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<BrokerError>() {
            Ok(broker_err) => broker_err,
            Err(err) => match err.downcast::<rusqlite::Error>() {
                Ok(sql_err) => BrokerError::from(sql_err),
                Err(err) => BrokerError::internal(err),
            },
        }
    }
}

/// Result type for broker operations.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;
