//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. Each kernel component owns one error
//! family; the crate-level [`Error`] wraps them so callers can use `?` across
//! component boundaries and still branch on a stable [`Error::code`].

use thiserror::Error;

use super::ids::{ApprovalId, BackendId, ContextId, TaskId};

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Routing failures (router façade).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoutingError {
    #[error("invalid routing request: {0}")]
    InvalidRequest(String),

    #[error("no available backend: {0}")]
    NoAvailableBackend(String),

    /// `backends` lists every backend invoked, in order.
    #[error("all backends failed after {attempts} attempts: {last_error}")]
    AllBackendsFailed {
        attempts: u32,
        backends: Vec<BackendId>,
        last_error: String,
    },
}

/// Budget and global-breaker failures (circuit breaker).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BudgetError {
    #[error("circuit open: retry after {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },

    #[error("budget exceeded: {resource} {used} >= {limit}")]
    BudgetExceeded {
        resource: &'static str,
        used: f64,
        limit: f64,
    },

    #[error("fuel depleted for context {0}")]
    FuelDepleted(ContextId),

    #[error("context {context_id} timed out after {elapsed_ms}ms (limit {limit_ms}ms)")]
    Timeout {
        context_id: ContextId,
        elapsed_ms: u64,
        limit_ms: u64,
    },

    #[error("max turns exceeded: {turns} >= {limit}")]
    MaxTurnsExceeded { turns: u32, limit: u32 },

    #[error("unknown context: {0}")]
    ContextNotFound(ContextId),
}

/// Scheduling failures (scheduler + queue).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("unknown task: {0}")]
    TaskNotFound(TaskId),

    #[error("task {task_id} timed out after {timeout_ms}ms")]
    TaskTimeout { task_id: TaskId, timeout_ms: u64 },

    #[error("task {0} cancelled before admission")]
    TaskCancelled(TaskId),

    #[error("scheduler stopped")]
    SchedulerStopped,
}

/// Human-approval failures (approval gate).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApprovalError {
    #[error("unknown approval request: {0}")]
    RequestNotFound(ApprovalId),

    #[error("approval request {id} already resolved as {status}")]
    AlreadyResolved { id: ApprovalId, status: String },

    #[error("approval request {0} expired")]
    Expired(ApprovalId),

    #[error("operation blocked: {0}")]
    Blocked(String),

    #[error("approval request {id} denied: {reason}")]
    Denied { id: ApprovalId, reason: String },
}

/// Main error enum for the kernel.
#[derive(Error, Debug)]
pub enum Error {
    /// Validation errors.
    #[error("validation error: {0}")]
    Validation(String),

    /// Internal errors, including recovered panics.
    #[error("internal error: {0}")]
    Internal(String),

    /// Timeout (event bus waits and similar).
    #[error("timeout: {0}")]
    Timeout(String),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION",
            Error::Internal(_) => "INTERNAL",
            Error::Timeout(_) => "TIMEOUT",
            Error::Routing(e) => match e {
                RoutingError::InvalidRequest(_) => "INVALID_REQUEST",
                RoutingError::NoAvailableBackend(_) => "NO_AVAILABLE_BACKEND",
                RoutingError::AllBackendsFailed { .. } => "ALL_BACKENDS_FAILED",
            },
            Error::Budget(e) => match e {
                BudgetError::CircuitOpen { .. } => "CIRCUIT_OPEN",
                BudgetError::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
                BudgetError::FuelDepleted(_) => "FUEL_DEPLETED",
                BudgetError::Timeout { .. } => "BUDGET_TIMEOUT",
                BudgetError::MaxTurnsExceeded { .. } => "MAX_TURNS_EXCEEDED",
                BudgetError::ContextNotFound(_) => "CONTEXT_NOT_FOUND",
            },
            Error::Scheduler(e) => match e {
                SchedulerError::TaskNotFound(_) => "TASK_NOT_FOUND",
                SchedulerError::TaskTimeout { .. } => "TASK_TIMEOUT",
                SchedulerError::TaskCancelled(_) => "TASK_CANCELLED",
                SchedulerError::SchedulerStopped => "SCHEDULER_STOPPED",
            },
            Error::Approval(e) => match e {
                ApprovalError::RequestNotFound(_) => "REQUEST_NOT_FOUND",
                ApprovalError::AlreadyResolved { .. } => "ALREADY_RESOLVED",
                ApprovalError::Expired(_) => "APPROVAL_EXPIRED",
                ApprovalError::Blocked(_) => "APPROVAL_BLOCKED",
                ApprovalError::Denied { .. } => "APPROVAL_DENIED",
            },
            Error::Serialization(_) => "SERIALIZATION",
            Error::Io(_) => "IO",
        }
    }

    /// Whether a caller may reasonably retry the same operation.
    ///
    /// Budget exhaustion, an open circuit and approval denial are never
    /// retryable; the kernel surfaces them unretried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::Routing(RoutingError::AllBackendsFailed { .. })
                | Error::Scheduler(SchedulerError::TaskTimeout { .. })
        )
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Owned copy of a shared error (completion records hand out `&Error`).
    ///
    /// Component errors keep their variant and code. Serialization and I/O
    /// errors are not `Clone` and come back as `Internal` with the message.
    pub fn duplicate(&self) -> Self {
        match self {
            Error::Validation(m) => Error::Validation(m.clone()),
            Error::Internal(m) => Error::Internal(m.clone()),
            Error::Timeout(m) => Error::Timeout(m.clone()),
            Error::Routing(e) => Error::Routing(e.clone()),
            Error::Budget(e) => Error::Budget(e.clone()),
            Error::Scheduler(e) => Error::Scheduler(e.clone()),
            Error::Approval(e) => Error::Approval(e.clone()),
            Error::Serialization(e) => Error::Internal(e.to_string()),
            Error::Io(e) => Error::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_errors_keep_their_codes() {
        let err: Error = BudgetError::FuelDepleted(ContextId::must("ctx")).into();
        assert_eq!(err.code(), "FUEL_DEPLETED");
        assert!(!err.is_retryable());

        let err: Error = SchedulerError::TaskTimeout {
            task_id: TaskId::must("t1"),
            timeout_ms: 10,
        }
        .into();
        assert_eq!(err.code(), "TASK_TIMEOUT");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_duplicate_keeps_component_code() {
        let err: Error = RoutingError::AllBackendsFailed {
            attempts: 2,
            backends: vec![BackendId::must("a"), BackendId::must("b")],
            last_error: "down".to_string(),
        }
        .into();
        assert_eq!(err.duplicate().code(), "ALL_BACKENDS_FAILED");

        let io: Error = std::io::Error::other("disk").into();
        assert_eq!(io.duplicate().code(), "INTERNAL");
    }

    #[test]
    fn test_transparent_display() {
        let err: Error = ApprovalError::Blocked("rm -rf".to_string()).into();
        assert_eq!(err.to_string(), "operation blocked: rm -rf");
    }
}
