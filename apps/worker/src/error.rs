//! Error handling for the trackrelay worker
//!
//! Failures of the job command and of scratch maintenance. A job error ends
//! up as the `errorMessage` of the published result, so its display text is
//! what the requesting side sees.

use thiserror::Error;

/// Main worker error type
#[derive(Error, Debug)]
pub enum WorkerError {
    // ========== Job Command Errors ==========
    /// The job command could not be started
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The job command exited unsuccessfully
    #[error("{}", command_failure(.code, .stderr))]
    CommandFailed { code: Option<i32>, stderr: String },

    /// The job command printed something that is not JSON
    #[error("job command returned invalid output: {0}")]
    InvalidOutput(#[from] serde_json::Error),

    // ========== File System Errors ==========
    /// File system access error
    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    /// Walking the scratch directory failed
    #[error("scratch directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),

    // ========== Configuration Errors ==========
    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),
}

fn command_failure(code: &Option<i32>, stderr: &str) -> String {
    let status = match code {
        Some(code) => format!("job command exited with status {}", code),
        None => "job command was killed by a signal".to_string(),
    };
    match stderr.trim() {
        "" => status,
        detail => format!("{}: {}", status, detail),
    }
}

impl WorkerError {
    /// Check if running the same job again could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Filesystem(_) | Self::CommandFailed { code: None, .. }
        )
    }

    /// Get a severity level for logging
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            // The worker cannot do any job until an operator steps in
            Self::Configuration(_) | Self::Spawn { .. } => ErrorSeverity::Critical,

            Self::Filesystem(_) | Self::Walk(_) => ErrorSeverity::Error,

            Self::CommandFailed { .. } | Self::InvalidOutput(_) => ErrorSeverity::Warning,
        }
    }

    /// Log the error with appropriate severity
    pub fn log(&self) {
        match self.severity() {
            ErrorSeverity::Critical => {
                tracing::error!(
                    error = %self,
                    retryable = self.is_retryable(),
                    "Critical worker error"
                );
            }
            ErrorSeverity::Error => {
                tracing::error!(
                    error = %self,
                    retryable = self.is_retryable(),
                    "Worker error"
                );
            }
            ErrorSeverity::Warning => {
                tracing::warn!(
                    error = %self,
                    retryable = self.is_retryable(),
                    "Worker warning"
                );
            }
        }
    }
}

/// Error severity levels for logging and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that should trigger alerts
    Critical,
    /// Standard errors
    Error,
    /// Warnings for expected failures
    Warning,
}

/// Result type alias for worker operations
pub type WorkerResult<T> = Result<T, WorkerError>;
