//! Sync error taxonomy.
//!
//! Every failure surfaced per queue item is classified into one of five
//! closed kinds. Network, timeout, and unknown failures retry with backoff;
//! auth failures halt draining until re-authentication; conflicts are
//! resolved by the engine and never counted as failures.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Closed classification of per-item sync failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncErrorKind {
    #[serde(rename = "NETWORK_ERROR")]
    Network,
    #[serde(rename = "AUTH_ERROR")]
    Auth,
    #[serde(rename = "CONFLICT_ERROR")]
    Conflict,
    #[serde(rename = "TIMEOUT_ERROR")]
    Timeout,
    #[serde(rename = "UNKNOWN_ERROR")]
    Unknown,
}

impl SyncErrorKind {
    /// Stable code recorded in `last_error` and shown to the UI.
    pub fn code(&self) -> &'static str {
        match self {
            SyncErrorKind::Network => "NETWORK_ERROR",
            SyncErrorKind::Auth => "AUTH_ERROR",
            SyncErrorKind::Conflict => "CONFLICT_ERROR",
            SyncErrorKind::Timeout => "TIMEOUT_ERROR",
            SyncErrorKind::Unknown => "UNKNOWN_ERROR",
        }
    }

    /// Whether a failure of this kind consumes a retry and reschedules the
    /// item with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncErrorKind::Network | SyncErrorKind::Timeout | SyncErrorKind::Unknown
        )
    }
}

impl std::fmt::Display for SyncErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Error returned by the remote API client.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("NETWORK_ERROR: {0}")]
    Network(String),

    #[error("AUTH_ERROR: {0}")]
    Auth(String),

    /// The submitted version does not match the server's current value.
    /// Carries the authoritative server state when the response included it.
    #[error("CONFLICT_ERROR: version mismatch")]
    Conflict { current: Option<Value> },

    #[error("TIMEOUT_ERROR: {0}")]
    Timeout(String),

    #[error("UNKNOWN_ERROR: {0}")]
    Unknown(String),
}

impl ApiError {
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            ApiError::Network(_) => SyncErrorKind::Network,
            ApiError::Auth(_) => SyncErrorKind::Auth,
            ApiError::Conflict { .. } => SyncErrorKind::Conflict,
            ApiError::Timeout(_) => SyncErrorKind::Timeout,
            ApiError::Unknown(_) => SyncErrorKind::Unknown,
        }
    }
}

// ---------------------------------------------------------------------------
// Error-text helpers
// ---------------------------------------------------------------------------

/// Whether an error message is a server backpressure response (the queue row
/// is deferred without consuming a retry).
pub fn is_backpressure_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    lower.contains("http 429")
        || lower.contains("too many requests")
        || lower.contains("retry later")
}

/// Extract the first integer following `key` in `haystack`, tolerating
/// JSON-ish formatting (`"retry_after_seconds": 30`).
fn extract_first_numeric_after(haystack: &str, key: &str) -> Option<i64> {
    let start = haystack.find(key)? + key.len();
    let rest = &haystack[start..];
    let digits: String = rest
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Server-requested retry delay, if the error body carried one.
pub fn extract_retry_after_seconds(error: &str) -> Option<i64> {
    extract_first_numeric_after(error, "retry_after_seconds")
        .or_else(|| extract_first_numeric_after(error, "retryAfterSeconds"))
        .or_else(|| extract_first_numeric_after(error, "Retry-After"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_and_retryability() {
        assert_eq!(SyncErrorKind::Network.code(), "NETWORK_ERROR");
        assert_eq!(SyncErrorKind::Auth.code(), "AUTH_ERROR");
        assert_eq!(SyncErrorKind::Conflict.code(), "CONFLICT_ERROR");
        assert_eq!(SyncErrorKind::Timeout.code(), "TIMEOUT_ERROR");
        assert_eq!(SyncErrorKind::Unknown.code(), "UNKNOWN_ERROR");

        assert!(SyncErrorKind::Network.is_retryable());
        assert!(SyncErrorKind::Timeout.is_retryable());
        assert!(SyncErrorKind::Unknown.is_retryable());
        assert!(!SyncErrorKind::Auth.is_retryable());
        assert!(!SyncErrorKind::Conflict.is_retryable());
    }

    #[test]
    fn test_api_error_display_carries_kind_code() {
        let err = ApiError::Network("connection refused".into());
        assert!(err.to_string().starts_with("NETWORK_ERROR"));
        assert_eq!(err.kind(), SyncErrorKind::Network);

        let conflict = ApiError::Conflict { current: None };
        assert_eq!(conflict.kind(), SyncErrorKind::Conflict);
    }

    #[test]
    fn test_backpressure_detection_and_retry_after_extraction() {
        let backpressure =
            "Queue is backed up. Please retry later. (HTTP 429): {\"retry_after_seconds\": 30}";
        assert!(is_backpressure_error(backpressure));
        assert_eq!(extract_retry_after_seconds(backpressure), Some(30));

        let plain = "Remote server error (HTTP 503)";
        assert!(!is_backpressure_error(plain));
        assert_eq!(extract_retry_after_seconds(plain), None);
    }
}
