//! Runtime error types.

use cirrina_core::CoreError;
use thiserror::Error;

/// Runtime errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no service implementation for '{name}' (local required: {local})")]
    ServiceNotFound { name: String, local: bool },

    #[error("service invocation of '{name}' failed: {reason}")]
    Service { name: String, reason: String },

    #[error("timeout '{0}' is already active")]
    TimeoutExists(String),

    #[error("timeout '{0}' is not active")]
    TimeoutNotFound(String),

    #[error("invalid timeout delay for '{name}': {value}")]
    InvalidDelay { name: String, value: String },

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("state machine '{0}' is abstract and cannot be instantiated")]
    AbstractMachine(String),

    #[error("state machine not found: {0}")]
    MachineNotFound(String),

    #[error("runtime shutting down")]
    ShuttingDown,

    #[error("no async executor available: {0}")]
    Executor(String),

    #[error("coordination error: {0}")]
    Coordination(String),

    #[error("lock '{0}' is held by another runtime")]
    LockContended(String),

    #[error("malformed job '{path}': {reason}")]
    MalformedJob { path: String, reason: String },
}

impl RuntimeError {
    /// Returns an error code string.
    pub fn error_code(&self) -> &'static str {
        match self {
            RuntimeError::Core(e) => e.error_code(),
            RuntimeError::Json(_) => "JSON_ERROR",
            RuntimeError::ServiceNotFound { .. } => "SERVICE_NOT_FOUND",
            RuntimeError::Service { .. } => "SERVICE_FAILED",
            RuntimeError::TimeoutExists(_) => "TIMEOUT_EXISTS",
            RuntimeError::TimeoutNotFound(_) => "TIMEOUT_NOT_FOUND",
            RuntimeError::InvalidDelay { .. } => "INVALID_DELAY",
            RuntimeError::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            RuntimeError::AbstractMachine(_) => "ABSTRACT_MACHINE",
            RuntimeError::MachineNotFound(_) => "MACHINE_NOT_FOUND",
            RuntimeError::ShuttingDown => "SHUTTING_DOWN",
            RuntimeError::Executor(_) => "EXECUTOR_UNAVAILABLE",
            RuntimeError::Coordination(_) => "COORDINATION_ERROR",
            RuntimeError::LockContended(_) => "LOCK_CONTENDED",
            RuntimeError::MalformedJob { .. } => "MALFORMED_JOB",
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RuntimeError::LockContended(_))
    }
}
