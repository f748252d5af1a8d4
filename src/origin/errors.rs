//! Origin Fetch Error Types
//!
//! Structured error handling for requests sent to the origin server.
//! Maps HTTP status codes to specific error variants so callers can decide
//! whether a failure is worth counting or falling back from.

/// Origin fetch error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limited by origin")]
    RateLimited,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({0}): {1}")]
    Server(u16, String),

    #[error("Request timeout")]
    Timeout,

    #[error("Request error: {0}")]
    Request(String),
}

impl FetchError {
    /// Whether this error means the origin could not be reached at all
    ///
    /// Network-level failures are the ones that trigger the network-first
    /// fallback; an origin that answered with an error status was reachable.
    pub fn is_network(&self) -> bool {
        matches!(self, FetchError::Network(_) | FetchError::Timeout)
    }

    /// Create a FetchError from an HTTP status code and response body
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            403 => FetchError::Forbidden(body.to_string()),
            404 => FetchError::NotFound(body.to_string()),
            408 => FetchError::Timeout,
            429 => FetchError::RateLimited,
            500..=599 => FetchError::Server(status, body.to_string()),
            _ => FetchError::Request(format!("HTTP {}: {}", status, body)),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if err.is_connect() || err.is_request() || err.is_body() {
            FetchError::Network(err.to_string())
        } else {
            FetchError::Request(err.to_string())
        }
    }
}
