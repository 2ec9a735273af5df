use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CatalogError>;

/// Raw backend failure as reported by a catalog implementation.
///
/// Classification into user-facing failure kinds happens in the engine; this
/// type only records what the backend said.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("backend returned status {status}: {message}")]
    Status {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("backend request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("empty result: {0}")]
    EmptyResult(String),

    #[error("batch of {size} items exceeds max batch size {max} for {operation}")]
    BatchTooLarge {
        operation: String,
        size: usize,
        max: usize,
    },
}

impl CatalogError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(retry_after: Duration) -> Self {
        Self::Status {
            status: 429,
            message: "rate limit exceeded".to_string(),
            retry_after: Some(retry_after),
        }
    }
}

impl From<reqwest::Error> for CatalogError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout;
        }
        if let Some(status) = e.status() {
            return Self::status(status.as_u16(), e.to_string());
        }
        Self::Network(e.to_string())
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(e: serde_json::Error) -> Self {
        Self::Network(format!("unexpected response format: {e}"))
    }
}
