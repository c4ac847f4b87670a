//! Error types for job dispatch
//!
//! [`DispatchError`] is the terminal signal a caller receives for a job that
//! did not succeed. [`QueueError`] covers the transport underneath the
//! broker and the worker loop; it never reaches a caller directly but is
//! folded into [`DispatchError::Unavailable`].

use std::time::Duration;

use thiserror::Error;

/// Why a job did not produce a value
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Structurally invalid job; it never entered any queue
    #[error("job rejected at admission: {0}")]
    AdmissionRejected(String),

    /// The processor ran and reported an error (or panicked)
    #[error("job execution failed: {0}")]
    ExecutionFailed(String),

    /// No outcome within the allotted time; the real outcome is unknown
    #[error("job timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),

    /// Removed from a local queue by an administrative cancellation
    #[error("job cleared: {0}")]
    Cleared(String),

    /// No live broker link or no live remote worker
    #[error("remote execution unavailable: {0}")]
    Unavailable(String),
}

impl DispatchError {
    /// Short stable label, suitable for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AdmissionRejected(_) => "admission_rejected",
            Self::ExecutionFailed(_) => "execution_failed",
            Self::TimedOut(_) => "timed_out",
            Self::Cleared(_) => "cleared",
            Self::Unavailable(_) => "unavailable",
        }
    }

    /// Whether submitting the same job again could reasonably succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TimedOut(_) | Self::Unavailable(_))
    }

    /// Get a severity level for logging
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::ExecutionFailed(_) => ErrorSeverity::Error,
            Self::TimedOut(_) | Self::Unavailable(_) => ErrorSeverity::Warning,
            Self::AdmissionRejected(_) | Self::Cleared(_) => ErrorSeverity::Info,
        }
    }

    /// Log the error with appropriate severity
    pub fn log(&self, job_id: &str) {
        match self.severity() {
            ErrorSeverity::Error => {
                tracing::error!(job_id, kind = self.kind(), error = %self, "Job failed");
            }
            ErrorSeverity::Warning => {
                tracing::warn!(job_id, kind = self.kind(), error = %self, "Job did not complete");
            }
            ErrorSeverity::Info => {
                tracing::info!(job_id, kind = self.kind(), error = %self, "Job not run");
            }
        }
    }

    /// Build an execution failure from a processor error, keeping its cause chain
    pub fn execution(err: &anyhow::Error) -> Self {
        Self::ExecutionFailed(format!("{:#}", err))
    }
}

/// Error severity levels for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Error,
    Warning,
    Info,
}

/// Result type alias for dispatch operations
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Durable queue transport errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("timed out after {}ms waiting for {what}", .after.as_millis())]
    Timeout { what: &'static str, after: Duration },

    /// The queue was closed with [`crate::DurableQueue::close`]
    #[error("queue connection closed")]
    Closed,
}

pub type QueueResult<T> = Result<T, QueueError>;

impl From<QueueError> for DispatchError {
    fn from(err: QueueError) -> Self {
        Self::Unavailable(err.to_string())
    }
}
