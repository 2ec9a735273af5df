//! Failure taxonomy and retry policy for catalog calls.

use crate::config::RetryConfig;
use crate::intent::DetectError;
use crate::store::StoreError;
use courier_catalog::CatalogError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailureKind {
    AuthExpired,
    PermissionDenied,
    RateLimited {
        #[serde(default)]
        retry_after_ms: Option<u64>,
    },
    NotFound,
    InvalidParameters,
    TransientServerError,
    NetworkTimeout,
    EmptyResult,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::TransientServerError | Self::NetworkTimeout
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_ms } => retry_after_ms.map(Duration::from_millis),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthExpired => "auth_expired",
            Self::PermissionDenied => "permission_denied",
            Self::RateLimited { .. } => "rate_limited",
            Self::NotFound => "not_found",
            Self::InvalidParameters => "invalid_parameters",
            Self::TransientServerError => "transient_server_error",
            Self::NetworkTimeout => "network_timeout",
            Self::EmptyResult => "empty_result",
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::AuthExpired => "Your mail account session has expired.",
            Self::PermissionDenied => "The mail account does not allow that action.",
            Self::RateLimited { .. } => "The mail service is rate limiting requests.",
            Self::NotFound => "I couldn't find that item. It may have been moved or deleted.",
            Self::InvalidParameters => "The mail service rejected the request details.",
            Self::TransientServerError => "The mail service is having trouble right now.",
            Self::NetworkTimeout => "The mail service did not respond in time.",
            Self::EmptyResult => "Nothing matched that request.",
        }
    }

    pub fn next_action(&self) -> &'static str {
        match self {
            Self::AuthExpired => "Reconnect your mail account, then try again.",
            Self::PermissionDenied => "Grant the missing permission or pick a different action.",
            Self::RateLimited { .. } | Self::TransientServerError | Self::NetworkTimeout => {
                "Wait a minute and try again."
            }
            Self::NotFound => "Search again to pick another item.",
            Self::InvalidParameters => "Check the details and rephrase the request.",
            Self::EmptyResult => "Refine the search and try again.",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn classify(error: &CatalogError) -> FailureKind {
    match error {
        CatalogError::Status {
            status,
            retry_after,
            ..
        } => match *status {
            401 => FailureKind::AuthExpired,
            403 => FailureKind::PermissionDenied,
            404 | 410 => FailureKind::NotFound,
            408 => FailureKind::NetworkTimeout,
            429 => FailureKind::RateLimited {
                retry_after_ms: retry_after.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            },
            s if s >= 500 => FailureKind::TransientServerError,
            _ => FailureKind::InvalidParameters,
        },
        CatalogError::Timeout | CatalogError::Network(_) => FailureKind::NetworkTimeout,
        CatalogError::InvalidParameters(_)
        | CatalogError::UnknownOperation(_)
        | CatalogError::BatchTooLarge { .. } => FailureKind::InvalidParameters,
        CatalogError::NotFound(_) => FailureKind::NotFound,
        CatalogError::EmptyResult(_) => FailureKind::EmptyResult,
    }
}

/// A catalog call that failed after the retry policy gave up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed after {attempts} attempt(s) ({kind}): {source}")]
pub struct Failure {
    pub kind: FailureKind,
    pub operation: String,
    pub attempts: u32,
    pub source: CatalogError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }

    /// Delay before retry number `retry` (0-based): `base * 2^retry`, raised to
    /// the server's retry-after hint when that is longer.
    pub fn delay(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry.min(16)));
        match retry_after {
            Some(hint) => backoff.max(hint),
            None => backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session store: {0}")]
    Store(#[from] StoreError),

    #[error("intent detection: {0}")]
    Detect(#[from] DetectError),

    #[error("catalog: {0}")]
    Catalog(#[from] Failure),

    #[error("workflow invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_http_statuses() {
        assert_eq!(classify(&CatalogError::status(401, "x")), FailureKind::AuthExpired);
        assert_eq!(
            classify(&CatalogError::status(403, "x")),
            FailureKind::PermissionDenied
        );
        assert_eq!(classify(&CatalogError::status(404, "x")), FailureKind::NotFound);
        assert_eq!(
            classify(&CatalogError::status(422, "x")),
            FailureKind::InvalidParameters
        );
        assert_eq!(
            classify(&CatalogError::status(503, "x")),
            FailureKind::TransientServerError
        );
        assert_eq!(
            classify(&CatalogError::rate_limited(Duration::from_secs(5))),
            FailureKind::RateLimited {
                retry_after_ms: Some(5_000)
            }
        );
        assert_eq!(classify(&CatalogError::Timeout), FailureKind::NetworkTimeout);
    }

    #[test]
    fn only_transient_kinds_retry() {
        assert!(FailureKind::TransientServerError.is_retryable());
        assert!(FailureKind::NetworkTimeout.is_retryable());
        assert!(FailureKind::RateLimited { retry_after_ms: None }.is_retryable());
        assert!(!FailureKind::AuthExpired.is_retryable());
        assert!(!FailureKind::NotFound.is_retryable());
        assert!(!FailureKind::EmptyResult.is_retryable());
    }

    #[test]
    fn delay_doubles_and_honors_retry_after() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0, None), Duration::from_secs(1));
        assert_eq!(policy.delay(1, None), Duration::from_secs(2));
        assert_eq!(policy.delay(2, None), Duration::from_secs(4));
        assert_eq!(
            policy.delay(0, Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(
            policy.delay(2, Some(Duration::from_secs(3))),
            Duration::from_secs(4)
        );
    }

    #[test]
    fn every_kind_suggests_a_next_action() {
        let kinds = [
            FailureKind::AuthExpired,
            FailureKind::PermissionDenied,
            FailureKind::RateLimited { retry_after_ms: None },
            FailureKind::NotFound,
            FailureKind::InvalidParameters,
            FailureKind::TransientServerError,
            FailureKind::NetworkTimeout,
            FailureKind::EmptyResult,
        ];
        for kind in kinds {
            assert!(!kind.next_action().is_empty(), "{kind} lacks next action");
        }
    }
}
