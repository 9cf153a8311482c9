//! Error types for the request optimizer.
//!
//! A cache miss is not an error - it is the normal trigger for submitting
//! a request. Everything a result handle can resolve to, other than a
//! value, lives here.

use thiserror::Error;

/// Errors surfaced to callers through `submit` or a result handle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    /// The queue was full (reject mode), or stayed full past the submit
    /// timeout (block mode).
    #[error("request queue capacity exceeded")]
    CapacityExceeded,

    /// Retries were exhausted, or the operation failed permanently.
    /// Carries the attempt count and the last underlying error.
    #[error("request failed after {attempts} attempt(s): {last_error}")]
    Failed {
        /// Total attempts made, including the first.
        attempts: u32,
        /// Message of the last underlying failure.
        last_error: String,
    },

    /// The request was cancelled before or between attempts.
    #[error("request cancelled")]
    Cancelled,

    /// The per-request deadline elapsed before an attempt could start.
    #[error("request deadline exceeded")]
    DeadlineExceeded,

    /// The optimizer shut down before the request resolved.
    #[error("optimizer shut down")]
    Shutdown,
}

/// A failure reported by a caller-supplied fetch operation.
///
/// `retryable` decides whether the optimizer retries with backoff or
/// fails the request immediately.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct FetchError {
    /// Human-readable failure description.
    pub message: String,
    /// Whether the failure is transient and worth retrying.
    pub retryable: bool,
}

impl FetchError {
    /// A transient failure - the optimizer will retry with backoff.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A permanent failure - the request fails without further attempts.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}
