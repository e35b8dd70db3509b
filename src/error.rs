//! Error types for courier operations.
//!
//! Every call outcome that is not a success is one variant of [`CourierError`].
//! The retry executor only looks at [`CourierError::is_retryable`] and
//! [`CourierError::retry_after`], so a limiter rejection, a remote 429 and a
//! dropped connection are all handled the same way.

use std::time::Duration;
use thiserror::Error;

use crate::ratelimit::Scope;

/// Main error type for courier operations.
#[derive(Error, Debug)]
pub enum CourierError {
    /// A local limiter refused the call
    #[error("Admission rejected by {scope} limiter, retry after {retry_after:?}")]
    AdmissionRejected { scope: Scope, retry_after: Duration },

    /// Connection reset, timeout or gateway failure
    #[error("Transient transport failure: {0}")]
    TransientTransport(String),

    /// The remote API answered 429
    #[error("Throttled by remote API (retry after {retry_after:?})")]
    Throttled { retry_after: Option<Duration> },

    /// Well-formed error response from the remote API
    #[error("Application error{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Application { status: Option<u16>, message: String },

    /// Retry budget used up; wraps the last retryable cause
    #[error("Retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<CourierError>,
    },

    /// The remote system reported the job as failed
    #[error("Job {job_id} failed on the remote side")]
    JobFailed { job_id: String },

    /// The job was still running when the poll budget ran out
    #[error("Job {job_id} still running after {attempts} polls")]
    PollingTimedOut { job_id: String, attempts: u32 },

    /// The cancellation token fired
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Response body could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CourierError {
    /// Whether the retry executor may try the call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CourierError::AdmissionRejected { .. }
                | CourierError::TransientTransport(_)
                | CourierError::Throttled { .. }
        )
    }

    /// Hint from the rejecting side on when capacity frees up.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CourierError::AdmissionRejected { retry_after, .. } => Some(*retry_after),
            CourierError::Throttled { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Whether this error is, or wraps, a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            CourierError::Cancelled => true,
            CourierError::RetriesExhausted { last, .. } => last.is_cancelled(),
            _ => false,
        }
    }
}

/// Result type alias for courier operations.
pub type Result<T> = std::result::Result<T, CourierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let rejected = CourierError::AdmissionRejected {
            scope: Scope::Global,
            retry_after: Duration::from_secs(3),
        };
        assert!(rejected.is_retryable());
        assert_eq!(rejected.retry_after(), Some(Duration::from_secs(3)));

        assert!(CourierError::TransientTransport("reset".into()).is_retryable());
        assert!(CourierError::Throttled { retry_after: None }.is_retryable());

        let app = CourierError::Application {
            status: Some(400),
            message: "bad filter".into(),
        };
        assert!(!app.is_retryable());
        assert!(!CourierError::Cancelled.is_retryable());
    }

    #[test]
    fn test_retries_exhausted_keeps_cause() {
        use std::error::Error as _;

        let err = CourierError::RetriesExhausted {
            attempts: 4,
            last: Box::new(CourierError::Throttled {
                retry_after: Some(Duration::from_secs(1)),
            }),
        };
        assert!(!err.is_retryable());
        let source = err.source().map(|s| s.to_string()).unwrap_or_default();
        assert!(source.contains("Throttled"));
    }

    #[test]
    fn test_application_error_display() {
        let err = CourierError::Application {
            status: Some(404),
            message: "unknown survey".into(),
        };
        assert_eq!(err.to_string(), "Application error (HTTP 404): unknown survey");
    }
}
