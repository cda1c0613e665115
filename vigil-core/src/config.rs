//! Sync layer configuration
//!
//! All tunables of the cache, the connection registry, the throttle gate and
//! the range query service live in one [`SyncConfig`]. Values come from
//! [`Default`], from `VIGIL_*` environment variables via
//! [`SyncConfig::from_env`], or from the `with_*` builders, and must pass
//! [`SyncConfig::validate`] before a sync context is built.

use crate::error::{ConfigError, VigilError, VigilResult};
use std::time::Duration;

pub const DEFAULT_CACHE_CAPACITY: usize = 100;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;
pub const DEFAULT_MAX_LISTENERS: usize = 10;
pub const DEFAULT_THROTTLE_MS: u64 = 3000;
pub const DEFAULT_RANGE_LIMIT: usize = 200;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 30;

// ============================================================================
// USAGE THRESHOLDS
// ============================================================================

/// Levels above which the usage monitor emits warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageThresholds {
    /// Total backend reads since the counters were last reset.
    pub reads: u64,
    /// Listeners currently open.
    pub listeners: u64,
    /// Average backend reads per minute since the counters were last reset.
    pub reads_per_minute: u64,
}

impl Default for UsageThresholds {
    fn default() -> Self {
        Self {
            reads: 1000,
            listeners: 10,
            reads_per_minute: 100,
        }
    }
}

// ============================================================================
// SYNC CONFIG
// ============================================================================

/// Configuration for a sync context.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Maximum number of cache entries before capacity eviction (default: 100)
    pub cache_capacity: usize,

    /// How long a cached value stays fresh (default: 5 minutes)
    pub cache_ttl: Duration,

    /// Maximum simultaneously open live listeners (default: 10)
    pub max_concurrent_listeners: usize,

    /// Minimum spacing between deliveries of one live feed (default: 3 seconds)
    pub throttle_interval: Duration,

    /// Record limit used when a range request does not name one (default: 200)
    pub default_range_limit: usize,

    /// Maximum lifetime of a one-shot backend read before waiters are
    /// rejected with a timeout (default: 5 seconds)
    pub request_timeout: Duration,

    /// Period of the background usage monitor (default: 30 seconds)
    pub monitor_interval: Duration,

    /// Warning thresholds for the usage monitor
    pub usage_thresholds: UsageThresholds,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            max_concurrent_listeners: DEFAULT_MAX_LISTENERS,
            throttle_interval: Duration::from_millis(DEFAULT_THROTTLE_MS),
            default_range_limit: DEFAULT_RANGE_LIMIT,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            monitor_interval: Duration::from_secs(DEFAULT_MONITOR_INTERVAL_SECS),
            usage_thresholds: UsageThresholds::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

impl SyncConfig {
    /// Create SyncConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `VIGIL_CACHE_CAPACITY`: Maximum cache entries (default: 100)
    /// - `VIGIL_CACHE_TTL_SECS`: Cache freshness window (default: 300)
    /// - `VIGIL_MAX_LISTENERS`: Maximum open live listeners (default: 10)
    /// - `VIGIL_THROTTLE_MS`: Live delivery spacing (default: 3000)
    /// - `VIGIL_RANGE_LIMIT`: Default range record limit (default: 200)
    /// - `VIGIL_REQUEST_TIMEOUT_MS`: One-shot read lifetime (default: 5000)
    /// - `VIGIL_MONITOR_INTERVAL_SECS`: Usage monitor period (default: 30)
    /// - `VIGIL_WARN_READS`, `VIGIL_WARN_LISTENERS`, `VIGIL_WARN_READS_PER_MIN`:
    ///   usage warning thresholds (defaults: 1000, 10, 100)
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = UsageThresholds::default();
        Self {
            cache_capacity: env_parse("VIGIL_CACHE_CAPACITY").unwrap_or(DEFAULT_CACHE_CAPACITY),
            cache_ttl: Duration::from_secs(
                env_parse("VIGIL_CACHE_TTL_SECS").unwrap_or(DEFAULT_CACHE_TTL_SECS),
            ),
            max_concurrent_listeners: env_parse("VIGIL_MAX_LISTENERS")
                .unwrap_or(DEFAULT_MAX_LISTENERS),
            throttle_interval: Duration::from_millis(
                env_parse("VIGIL_THROTTLE_MS").unwrap_or(DEFAULT_THROTTLE_MS),
            ),
            default_range_limit: env_parse("VIGIL_RANGE_LIMIT").unwrap_or(DEFAULT_RANGE_LIMIT),
            request_timeout: Duration::from_millis(
                env_parse("VIGIL_REQUEST_TIMEOUT_MS").unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
            ),
            monitor_interval: Duration::from_secs(
                env_parse("VIGIL_MONITOR_INTERVAL_SECS").unwrap_or(DEFAULT_MONITOR_INTERVAL_SECS),
            ),
            usage_thresholds: UsageThresholds {
                reads: env_parse("VIGIL_WARN_READS").unwrap_or(defaults.reads),
                listeners: env_parse("VIGIL_WARN_LISTENERS").unwrap_or(defaults.listeners),
                reads_per_minute: env_parse("VIGIL_WARN_READS_PER_MIN")
                    .unwrap_or(defaults.reads_per_minute),
            },
        }
    }

    /// Create a configuration for development/testing with short windows.
    pub fn development() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30),
            throttle_interval: Duration::from_millis(200),
            monitor_interval: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Validate the configuration.
    ///
    /// A `max_concurrent_listeners` of zero is accepted: every live
    /// subscription is then refused with `CapacityExceeded`.
    pub fn validate(&self) -> VigilResult<()> {
        if self.cache_capacity == 0 {
            return Err(invalid(
                "cache_capacity",
                self.cache_capacity.to_string(),
                "cache_capacity must be greater than 0",
            ));
        }

        if self.cache_ttl.is_zero() {
            return Err(invalid(
                "cache_ttl",
                format!("{:?}", self.cache_ttl),
                "cache_ttl must be positive",
            ));
        }

        if self.throttle_interval.is_zero() {
            return Err(invalid(
                "throttle_interval",
                format!("{:?}", self.throttle_interval),
                "throttle_interval must be positive",
            ));
        }

        if self.default_range_limit == 0 {
            return Err(invalid(
                "default_range_limit",
                self.default_range_limit.to_string(),
                "default_range_limit must be greater than 0",
            ));
        }

        if self.request_timeout.is_zero() {
            return Err(invalid(
                "request_timeout",
                format!("{:?}", self.request_timeout),
                "request_timeout must be positive",
            ));
        }

        if self.monitor_interval.is_zero() {
            return Err(invalid(
                "monitor_interval",
                format!("{:?}", self.monitor_interval),
                "monitor_interval must be positive",
            ));
        }

        Ok(())
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_max_concurrent_listeners(mut self, max: usize) -> Self {
        self.max_concurrent_listeners = max;
        self
    }

    pub fn with_throttle_interval(mut self, interval: Duration) -> Self {
        self.throttle_interval = interval;
        self
    }

    pub fn with_default_range_limit(mut self, limit: usize) -> Self {
        self.default_range_limit = limit;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_usage_thresholds(mut self, thresholds: UsageThresholds) -> Self {
        self.usage_thresholds = thresholds;
        self
    }
}

fn invalid(field: &str, value: String, reason: &str) -> VigilError {
    VigilError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value,
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    struct EnvVarGuard {
        key: &'static str,
        original: Option<String>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: Option<&str>) -> Self {
            let original = std::env::var(key).ok();
            match value {
                Some(v) => std::env::set_var(key, v),
                None => std::env::remove_var(key),
            }
            Self { key, original }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            match self.original.as_deref() {
                Some(v) => std::env::set_var(self.key, v),
                None => std::env::remove_var(self.key),
            }
        }
    }

    #[test]
    fn test_default_is_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_capacity, 100);
        assert_eq!(config.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.max_concurrent_listeners, 10);
        assert_eq!(config.throttle_interval, Duration::from_millis(3000));
        assert_eq!(config.default_range_limit, 200);
        assert_eq!(config.request_timeout, Duration::from_millis(5000));
    }

    #[test]
    fn test_development_is_valid() {
        assert!(SyncConfig::development().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let cases = [
            SyncConfig::default().with_cache_capacity(0),
            SyncConfig::default().with_cache_ttl(Duration::ZERO),
            SyncConfig::default().with_throttle_interval(Duration::ZERO),
            SyncConfig::default().with_default_range_limit(0),
            SyncConfig::default().with_request_timeout(Duration::ZERO),
            SyncConfig::default().with_monitor_interval(Duration::ZERO),
        ];
        for config in cases {
            let err = config.validate().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Config);
        }
    }

    #[test]
    fn test_zero_listeners_is_accepted() {
        let config = SyncConfig::default().with_max_concurrent_listeners(0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_value_names_field() {
        let err = SyncConfig::default()
            .with_cache_capacity(0)
            .validate()
            .unwrap_err();
        match err {
            VigilError::Config(ConfigError::InvalidValue { field, .. }) => {
                assert_eq!(field, "cache_capacity")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_from_env_reads_overrides_and_ignores_garbage() {
        let _capacity = EnvVarGuard::set("VIGIL_CACHE_CAPACITY", Some("42"));
        let _throttle = EnvVarGuard::set("VIGIL_THROTTLE_MS", Some("250"));
        let _listeners = EnvVarGuard::set("VIGIL_MAX_LISTENERS", Some("not-a-number"));
        let _reads = EnvVarGuard::set("VIGIL_WARN_READS", Some("5"));

        let config = SyncConfig::from_env();
        assert_eq!(config.cache_capacity, 42);
        assert_eq!(config.throttle_interval, Duration::from_millis(250));
        assert_eq!(config.max_concurrent_listeners, DEFAULT_MAX_LISTENERS);
        assert_eq!(config.usage_thresholds.reads, 5);
    }
}
