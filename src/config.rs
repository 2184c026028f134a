//! Engine configuration.
//!
//! All tunables live in one explicit struct so callers construct the engine
//! with named, typed fields instead of scattered constants or string-keyed
//! dictionaries.

use std::time::Duration;

/// Base delay before a failed queue item becomes eligible again (doubled on
/// every subsequent failure).
pub const DEFAULT_RETRY_DELAY_MS: i64 = 5_000;
/// Ceiling for the exponential backoff delay.
pub const MAX_RETRY_DELAY_MS: i64 = 300_000;

/// Configuration for the sync engine and queue.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum queue items processed per drain batch.
    pub batch_size: usize,
    /// Timeout for a single remote request.
    pub request_timeout: Duration,
    /// Overall deadline for one drain cycle. In-flight items still
    /// unacknowledged when it expires are treated as failed.
    pub cycle_timeout: Duration,
    /// Failed attempts a queue item may accumulate before it is abandoned
    /// and the owning entity is marked `error`.
    pub max_retries: i64,
    /// Base retry delay in milliseconds.
    pub retry_delay_ms: i64,
    /// Backoff ceiling in milliseconds.
    pub max_retry_delay_ms: i64,
    /// Interval between periodic drain attempts while online.
    pub sync_interval: Duration,
    /// Request bodies larger than this many bytes are zstd-compressed.
    pub compression_threshold: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            request_timeout: Duration::from_secs(10),
            cycle_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            max_retry_delay_ms: MAX_RETRY_DELAY_MS,
            sync_interval: Duration::from_secs(30),
            compression_threshold: 8 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_limits() {
        let config = SyncConfig::default();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.cycle_timeout, Duration::from_secs(30));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay_ms, 5_000);
        assert_eq!(config.max_retry_delay_ms, 300_000);
    }
}
