//! Mapper error taxonomy and retryability.

use std::time::Duration;
use thiserror::Error;

/// HTTP statuses worth retrying.
pub const RETRYABLE_STATUS: [u16; 5] = [429, 500, 502, 503, 504];

/// Error returned by a chunk mapper.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MapError {
    /// Connection reset, refused or dropped
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Authentication failed")]
    Auth,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Other(String),
}

impl MapError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            MapError::Transient(_) | MapError::Timeout(_) | MapError::RateLimited { .. } => true,
            MapError::Http { status, .. } => RETRYABLE_STATUS.contains(status),
            MapError::InvalidInput(_)
            | MapError::Auth
            | MapError::InvalidResponse(_)
            | MapError::Other(_) => false,
        }
    }

    /// Server-suggested wait, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            MapError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Classify a free-form error message.
    ///
    /// Meant for mappers wrapping clients that only surface strings.
    /// Unrecognized messages are not retryable.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if lower.contains("rate limit") || lower.contains("too many requests") {
            return MapError::RateLimited { retry_after: None };
        }

        if let Some(status) = status_code(&lower) {
            return MapError::Http { status, message };
        }

        if lower.contains("econnreset")
            || lower.contains("econnrefused")
            || lower.contains("connection")
            || lower.contains("socket hang up")
            || lower.contains("network")
            || lower.contains("unreachable")
        {
            return MapError::Transient(message);
        }

        if lower.contains("etimedout") || lower.contains("timeout") || lower.contains("timed out") {
            return MapError::Transient(message);
        }

        MapError::Other(message)
    }
}

/// First three-digit token that looks like an HTTP error status.
fn status_code(lower: &str) -> Option<u16> {
    lower
        .split(|c: char| !c.is_ascii_digit())
        .filter(|t| t.len() == 3)
        .filter_map(|t| t.parse::<u16>().ok())
        .find(|s| (400..600).contains(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_variants() {
        assert!(MapError::Transient("reset".into()).is_retryable());
        assert!(MapError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(MapError::RateLimited { retry_after: None }.is_retryable());
        assert!(!MapError::Auth.is_retryable());
        assert!(!MapError::InvalidInput("bad".into()).is_retryable());
        assert!(!MapError::Other("boom".into()).is_retryable());
    }

    #[test]
    fn test_http_status_classification() {
        for status in RETRYABLE_STATUS {
            let err = MapError::Http { status, message: String::new() };
            assert!(err.is_retryable(), "{} should be retryable", status);
        }
        for status in [400, 401, 403, 404, 422, 501] {
            let err = MapError::Http { status, message: String::new() };
            assert!(!err.is_retryable(), "{} should not be retryable", status);
        }
    }

    #[test]
    fn test_from_message() {
        assert!(matches!(
            MapError::from_message("read ECONNRESET"),
            MapError::Transient(_)
        ));
        assert!(matches!(
            MapError::from_message("Request timed out"),
            MapError::Transient(_)
        ));
        assert!(matches!(
            MapError::from_message("429 Too Many Requests"),
            MapError::RateLimited { .. }
        ));
        assert!(matches!(
            MapError::from_message("upstream returned 503"),
            MapError::Http { status: 503, .. }
        ));
        assert!(!MapError::from_message("HTTP 400 bad request").is_retryable());
        assert!(matches!(
            MapError::from_message("schema mismatch"),
            MapError::Other(_)
        ));
    }

    #[test]
    fn test_retry_after() {
        let err = MapError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(MapError::Auth.retry_after(), None);
    }
}
