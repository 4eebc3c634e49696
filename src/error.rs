//! Error types for the agent runtime
//!
//! Every failure carries an [`ErrorKind`] so the retry layer, the breaker and the loop
//! controller can decide what to do with it without string matching. Tower layers move
//! errors around as [`BoxError`]; [`classify`] recovers the kind from a boxed error.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower::BoxError;

/// Result type alias for the agent runtime
pub type Result<T> = std::result::Result<T, AgentError>;

/// Closed taxonomy attached to every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rate limits, timeouts, connection resets, 5xx. Safe to retry.
    Transient,
    /// Bad auth, malformed request, not found, quota exhausted. Never retried.
    Permanent,
    /// The surrounding request was aborted.
    Cancelled,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

/// Which of the three nested time bounds expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutScope {
    Tool,
    ModelCall,
    Request,
}

impl fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimeoutScope::Tool => "tool",
            TimeoutScope::ModelCall => "model call",
            TimeoutScope::Request => "request",
        })
    }
}

/// Failure classes a tool collaborator reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorClass {
    Timeout,
    Validation,
    Transient,
    Permanent,
}

impl fmt::Display for ToolErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ToolErrorClass::Timeout => "timeout",
            ToolErrorClass::Validation => "validation",
            ToolErrorClass::Transient => "transient",
            ToolErrorClass::Permanent => "permanent",
        })
    }
}

/// Error raised by a tool handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class} error: {message}")]
pub struct ToolError {
    pub class: ToolErrorClass,
    pub message: String,
}

impl ToolError {
    pub fn new(class: ToolErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ToolErrorClass::Timeout, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ToolErrorClass::Validation, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ToolErrorClass::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ToolErrorClass::Permanent, message)
    }

    pub fn kind(&self) -> ErrorKind {
        match self.class {
            ToolErrorClass::Timeout | ToolErrorClass::Transient => ErrorKind::Transient,
            ToolErrorClass::Validation | ToolErrorClass::Permanent => ErrorKind::Permanent,
        }
    }
}

/// Main error type for the agent runtime
#[derive(Debug, Error)]
pub enum AgentError {
    /// A dependency failed in a way that may succeed on retry
    #[error("{dependency} failed: {message}")]
    Transient { dependency: String, message: String },

    /// A dependency rejected the request; retrying will not help
    #[error("{dependency} rejected the request: {message}")]
    Permanent { dependency: String, message: String },

    /// One of the nested time bounds expired
    #[error("{scope} timed out after {after:?}")]
    Timeout { scope: TimeoutScope, after: Duration },

    /// The breaker for a dependency is open; no call was attempted
    #[error("circuit '{dependency}' is open, retry in {retry_in:?}")]
    CircuitOpen {
        dependency: String,
        retry_in: Duration,
    },

    /// No tokens were available within the allowed wait
    #[error("rate limit exhausted for '{resource}'")]
    RateLimited { resource: String },

    /// The retry budget ran out; wraps the last error
    #[error("'{dependency}' failed after {attempts} attempts: {source}")]
    RetryExhausted {
        dependency: String,
        attempts: usize,
        #[source]
        source: BoxError,
    },

    /// A tool failed outside the model's control
    #[error("tool '{tool}' failed: {source}")]
    Tool {
        tool: String,
        #[source]
        source: BoxError,
    },

    /// A critical tool failed and the run cannot continue
    #[error("critical tool '{tool}' failed: {source}")]
    CriticalTool {
        tool: String,
        #[source]
        source: BoxError,
    },

    /// The model answered with something the loop cannot act on
    #[error("invalid model response: {0}")]
    ModelBehavior(String),

    /// The request was cancelled from outside
    #[error("request cancelled")]
    Cancelled,

    /// Configuration rejected at load or validation time
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Tool registry rejected a definition
    #[error("invalid tool registration: {0}")]
    Registration(String),

    /// The job id is unknown or its retention window has passed
    #[error("job {0} not found")]
    JobNotFound(String),

    /// Too many queued jobs
    #[error("queue is full ({depth} jobs waiting)")]
    QueueFull { depth: usize },

    /// A worker tried to settle a job it no longer holds a lease for
    #[error("lease on job {job_id} is no longer held by {worker_id}")]
    LeaseLost { job_id: String, worker_id: String },

    /// The job's lease expired more often than its delivery budget allows
    #[error("job {job_id} abandoned after {attempts} expired leases")]
    LeaseExpired { job_id: String, attempts: u32 },

    /// Request rejected before enqueueing
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Storage returned something unreadable
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl AgentError {
    pub fn transient(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        AgentError::Transient {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    pub fn permanent(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        AgentError::Permanent {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    /// Recover a typed error from a boxed one, wrapping foreign errors with the
    /// dependency they came from.
    pub fn from_boxed(err: BoxError, dependency: &str) -> Self {
        match err.downcast::<AgentError>() {
            Ok(e) => *e,
            Err(other) => match classify(&other) {
                ErrorKind::Permanent => AgentError::Permanent {
                    dependency: dependency.to_string(),
                    message: other.to_string(),
                },
                ErrorKind::Cancelled => AgentError::Cancelled,
                ErrorKind::Transient => AgentError::Transient {
                    dependency: dependency.to_string(),
                    message: other.to_string(),
                },
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Transient { .. }
            | AgentError::CircuitOpen { .. }
            | AgentError::RateLimited { .. }
            | AgentError::RetryExhausted { .. }
            | AgentError::QueueFull { .. }
            | AgentError::Io(_)
            | AgentError::Database(_) => ErrorKind::Transient,
            AgentError::Timeout { scope, .. } => match scope {
                TimeoutScope::Request => ErrorKind::Cancelled,
                TimeoutScope::Tool | TimeoutScope::ModelCall => ErrorKind::Transient,
            },
            AgentError::Tool { source, .. } => classify(source),
            AgentError::Cancelled => ErrorKind::Cancelled,
            AgentError::Permanent { .. }
            | AgentError::CriticalTool { .. }
            | AgentError::ModelBehavior(_)
            | AgentError::Config(_)
            | AgentError::Registration(_)
            | AgentError::JobNotFound(_)
            | AgentError::LeaseLost { .. }
            | AgentError::LeaseExpired { .. }
            | AgentError::InvalidRequest(_)
            | AgentError::Storage(_)
            | AgentError::Serialization(_) => ErrorKind::Permanent,
        }
    }

    /// Stable machine-readable code stored on failed jobs.
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::Transient { .. } => "transient_error",
            AgentError::Permanent { .. } => "permanent_error",
            AgentError::Timeout { .. } => "timeout",
            AgentError::CircuitOpen { .. } => "circuit_open",
            AgentError::RateLimited { .. } => "rate_limited",
            AgentError::RetryExhausted { .. } => "retry_exhausted",
            AgentError::Tool { .. } => "tool_error",
            AgentError::CriticalTool { .. } => "critical_tool_failed",
            AgentError::ModelBehavior(_) => "invalid_model_response",
            AgentError::Cancelled => "cancelled",
            AgentError::Config(_) => "invalid_config",
            AgentError::Registration(_) => "invalid_registration",
            AgentError::JobNotFound(_) => "job_not_found",
            AgentError::QueueFull { .. } => "queue_full",
            AgentError::LeaseLost { .. } => "lease_lost",
            AgentError::LeaseExpired { .. } => "lease_expired",
            AgentError::InvalidRequest(_) => "invalid_request",
            AgentError::Storage(_)
            | AgentError::Serialization(_)
            | AgentError::Io(_)
            | AgentError::Database(_) => "internal",
        }
    }

    /// Text safe to show an end user. Never includes dependency names or payloads.
    pub fn user_message(&self) -> &'static str {
        match self {
            AgentError::Timeout { .. } => "The request took too long to process. Please try again.",
            AgentError::CircuitOpen { .. }
            | AgentError::RateLimited { .. }
            | AgentError::RetryExhausted { .. }
            | AgentError::Transient { .. }
            | AgentError::QueueFull { .. } => {
                "The service is temporarily unavailable. Please try again shortly."
            }
            AgentError::Cancelled => "The request was cancelled.",
            AgentError::InvalidRequest(_) => "The request was invalid.",
            _ => "The request could not be completed.",
        }
    }
}

/// Kind of a boxed error produced anywhere in a tower stack.
pub fn classify(err: &BoxError) -> ErrorKind {
    classify_dyn(&**err)
}

fn classify_dyn(err: &(dyn std::error::Error + Send + Sync + 'static)) -> ErrorKind {
    if let Some(e) = err.downcast_ref::<AgentError>() {
        return e.kind();
    }
    if let Some(e) = err.downcast_ref::<ToolError>() {
        return e.kind();
    }
    if err.is::<tower::timeout::error::Elapsed>() {
        return ErrorKind::Transient;
    }
    if let Some(e) = err.downcast_ref::<serde_json::Error>() {
        return if e.is_io() {
            ErrorKind::Transient
        } else {
            ErrorKind::Permanent
        };
    }
    ErrorKind::Transient
}
