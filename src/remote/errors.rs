//! Object Store Error Types
//!
//! Structured error handling for remote object store operations.
//! Maps HTTP status codes to specific error variants for retry decisions.

/// Remote object store error types
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Throttled by object store")]
    Throttled,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({0}): {1}")]
    Server(u16, String),

    #[error("Request timeout")]
    Timeout,

    #[error("Request error: {0}")]
    Request(String),

    #[error("Local I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Throttled
                | StoreError::Timeout
                | StoreError::Network(_)
                | StoreError::Server(_, _)
        )
    }

    /// Whether the remote reported the object or bucket as absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Create a StoreError from an HTTP status code and response body
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 => StoreError::AuthFailed(body.to_string()),
            403 => StoreError::Forbidden(body.to_string()),
            404 => StoreError::NotFound(body.to_string()),
            408 => StoreError::Timeout,
            429 | 503 => StoreError::Throttled,
            500..=599 => StoreError::Server(status, body.to_string()),
            _ => StoreError::Request(format!("HTTP {}: {}", status, body)),
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            StoreError::Timeout
        } else if e.is_connect() || e.is_request() || e.is_body() {
            StoreError::Network(e.to_string())
        } else {
            StoreError::Request(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(StoreError::from_status(404, "NoSuchKey").is_not_found());
        assert!(matches!(
            StoreError::from_status(403, "denied"),
            StoreError::Forbidden(_)
        ));
        assert!(matches!(
            StoreError::from_status(401, ""),
            StoreError::AuthFailed(_)
        ));
        assert!(matches!(
            StoreError::from_status(500, "boom"),
            StoreError::Server(500, _)
        ));
        assert!(matches!(
            StoreError::from_status(418, "teapot"),
            StoreError::Request(_)
        ));
    }

    #[test]
    fn test_retryable() {
        assert!(StoreError::from_status(503, "slow down").is_retryable());
        assert!(StoreError::from_status(502, "").is_retryable());
        assert!(StoreError::Network("reset".into()).is_retryable());
        assert!(!StoreError::from_status(404, "").is_retryable());
        assert!(!StoreError::from_status(403, "").is_retryable());
    }
}
