//! regcache error types

use std::time::Duration;

/// regcache error types
///
/// `Clone` so that one cold fetch result can be handed to every caller
/// waiting on the same key.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    // Durable store errors (never surfaced to callers of `request`)
    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupt cache record: {0}")]
    Parse(String),

    // Origin errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("origin fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Origin answered 304 but there is no prior payload to re-use.
    #[error("origin returned 304 for {url} but no cached payload exists")]
    NotModifiedWithoutPayload { url: String },

    // Background refresh errors
    #[error("refresh admission error: {0}")]
    Admission(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl CacheError {
    /// Whether retrying the same request could succeed.
    ///
    /// Network failures, timeouts and HTTP 5xx/429 are transient. Everything
    /// else (storage, parse, admission, 4xx) is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            CacheError::Http(_) | CacheError::Timeout(_) => true,
            CacheError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            CacheError::Api {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            CacheError::Http(err.to_string())
        }
    }
}

/// Result type alias for regcache operations
pub type Result<T> = std::result::Result<T, CacheError>;
