//! Error taxonomy for the tool-invocation runtime.
//!
//! Two families are kept deliberately separate: admission rejections are
//! synchronous `Result` values returned before any task exists, while
//! execution failures are captured as `{code, message}` state on the task
//! record. They share the [`ErrorCode`] vocabulary but never one type.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable machine-readable codes shared by every failure surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    PayloadTooLarge,
    InvalidStructure,
    PermissionDenied,
    RateLimited,
    ToolNotFound,
    ValidationError,
    ExecutionError,
    Timeout,
    Cancelled,
}

impl ErrorCode {
    /// The wire form of the code, e.g. `RATE_LIMITED`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::InvalidStructure => "INVALID_STRUCTURE",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::ToolNotFound => "TOOL_NOT_FOUND",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::ExecutionError => "EXECUTION_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejection produced by the admission gateway before any task is created.
///
/// No state is mutated on rejection; in particular the rate counters are only
/// incremented on fully successful admission.
#[derive(Debug, Clone, Error)]
pub enum AdmissionError {
    /// Serialized payload exceeds the configured byte limit.
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Payload violates a structural bound (depth, lengths, keys).
    #[error("invalid payload structure: {reason}")]
    InvalidStructure { reason: String },

    /// Caller's scope set does not grant the capability's required scope.
    #[error("capability '{capability}' requires scope '{missing_scope}'")]
    PermissionDenied {
        capability: String,
        missing_scope: String,
    },

    /// A sliding window is at its limit for this subject/capability pair.
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
}

impl AdmissionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AdmissionError::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            AdmissionError::InvalidStructure { .. } => ErrorCode::InvalidStructure,
            AdmissionError::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            AdmissionError::RateLimited { .. } => ErrorCode::RateLimited,
        }
    }

    /// Wait hint for `RATE_LIMITED` rejections, `None` otherwise.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AdmissionError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Failure reported by a capability at its invocation boundary.
#[derive(Debug, Clone, Error)]
pub enum CapabilityError {
    /// The capability rejected its input against its own contract.
    #[error("invalid input: {0}")]
    Validation(String),

    /// The capability started work and failed.
    #[error("execution failed: {0}")]
    Execution(String),

    /// The capability observed a cancellation request at a checkpoint.
    #[error("invocation cancelled")]
    Cancelled,
}

impl CapabilityError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CapabilityError::Validation(_) => ErrorCode::ValidationError,
            CapabilityError::Execution(_) => ErrorCode::ExecutionError,
            CapabilityError::Cancelled => ErrorCode::Cancelled,
        }
    }
}

/// Structured failure captured on a task record once it reaches `FAILED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub code: ErrorCode,
    pub message: String,
}

impl TaskError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<CapabilityError> for TaskError {
    fn from(err: CapabilityError) -> Self {
        TaskError::new(err.code(), err.to_string())
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Outcome of looking up a task on behalf of a requester.
///
/// `Forbidden` and `NotFound` stay distinguishable so a caller probing
/// another owner's task id gets an authorization failure, never a phantom
/// "not found".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TaskAccessError {
    #[error("task not found")]
    NotFound,

    #[error("task is owned by another caller")]
    Forbidden,
}

/// Failure of the synchronous invocation path.
///
/// Unlike the async path, these are raised directly to the caller rather
/// than recorded on a task.
#[derive(Debug, Clone, Error)]
pub enum InvokeError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("unknown tool '{tool}'")]
    UnknownTool { tool: String },

    #[error("{0}")]
    Failed(TaskError),
}

impl InvokeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            InvokeError::Admission(err) => err.code(),
            InvokeError::UnknownTool { .. } => ErrorCode::ToolNotFound,
            InvokeError::Failed(err) => err.code,
        }
    }
}
