//! Common error types for fieldsync.

use thiserror::Error;

/// Top-level error type for fieldsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level failure (connection refused, reset, DNS).
    #[error("Network error: {0}")]
    Network(String),

    /// A remote call did not complete in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The remote API answered with a non-success status.
    #[error("Remote error ({status}): {message}")]
    Remote { status: u16, message: String },

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// No connectivity; nothing was attempted.
    #[error("Network unavailable")]
    Offline,

    /// Durable store failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Scheduler is not running or dropped a request.
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl Error {
    /// Whether a later attempt of the same call may succeed.
    ///
    /// Transport failures, timeouts and 5xx/408/429 responses are transient.
    /// Everything else, including `NotFound`, is terminal for that attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) | Error::Timeout(_) | Error::Io(_) | Error::Offline => true,
            Error::Remote { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }

    /// Whether this error means the remote entity does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::Remote { status: 404, .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(Error::Timeout("15s".into()).is_retryable());
        assert!(Error::Remote { status: 503, message: String::new() }.is_retryable());
        assert!(Error::Remote { status: 429, message: String::new() }.is_retryable());

        assert!(!Error::Remote { status: 400, message: String::new() }.is_retryable());
        assert!(!Error::Remote { status: 422, message: String::new() }.is_retryable());
        assert!(!Error::NotFound("tasks/T1".into()).is_retryable());
        assert!(!Error::InvalidInput("bad".into()).is_retryable());
    }

    #[test]
    fn test_not_found_detection() {
        assert!(Error::NotFound("x".into()).is_not_found());
        assert!(Error::Remote { status: 404, message: "gone".into() }.is_not_found());
        assert!(!Error::Remote { status: 410, message: "gone".into() }.is_not_found());
    }

    proptest::proptest! {
        #[test]
        fn prop_server_errors_are_retryable(status in 500u16..600) {
            let err = Error::Remote { status, message: String::new() };
            proptest::prop_assert!(err.is_retryable());
        }

        #[test]
        fn prop_client_errors_are_terminal(status in 400u16..500) {
            proptest::prop_assume!(status != 408 && status != 429);
            let err = Error::Remote { status, message: String::new() };
            proptest::prop_assert!(!err.is_retryable());
        }
    }
}
