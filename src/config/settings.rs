//! Settings structs for all CacheFlow components.
//!
//! These are pure data types with builder-style `with_*` methods. Every
//! struct has a `validate()` that rejects nonsensical values up front -
//! components call it in their constructors, so a misconfigured instance
//! can never be built.

use crate::cache::EvictionPolicy;
use std::time::Duration;
use thiserror::Error;

/// Default maximum number of entries per cache store.
pub const DEFAULT_MAX_CACHE_ENTRIES: usize = 1000;

/// Default time-to-live for cache entries in seconds (5 minutes).
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Default interval between expiry sweeps in seconds.
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;

/// Default number of worker tasks consuming the request queue.
pub const DEFAULT_MAX_WORKERS: usize = 5;

/// Default request queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Default maximum number of requests coalesced into one batch.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default batching window in milliseconds.
pub const DEFAULT_BATCH_WINDOW_MS: u64 = 50;

/// Default maximum retry attempts after the initial attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay in milliseconds for exponential retry backoff.
/// Actual delay = base * 2^attempt, plus a small random jitter.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 100;

/// Default maximum number of pooled connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

/// Default timeout in seconds for acquiring a pooled connection.
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Default threshold in seconds above which an operation is reported slow.
pub const DEFAULT_SLOW_THRESHOLD_SECS: f64 = 1.0;

/// Configuration validation error.
///
/// Raised at construction time; an invalid option is never silently
/// replaced with a default.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid configuration: {key}: {reason}")]
pub struct ConfigError {
    /// The offending option, e.g. `"optimizer.max_workers"`.
    pub key: String,
    /// Why the value was rejected.
    pub reason: String,
}

impl ConfigError {
    pub(crate) fn new(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Behavior when the request queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressureMode {
    /// `submit` blocks until space frees, or until the optional submit
    /// timeout elapses (then fails with a capacity error).
    #[default]
    Block,
    /// `submit` fails immediately with a capacity error.
    Reject,
}

impl std::str::FromStr for BackpressureMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "reject" => Ok(Self::Reject),
            other => Err(ConfigError::new(
                "optimizer.backpressure",
                format!("unknown mode '{other}' (expected 'block' or 'reject')"),
            )),
        }
    }
}

impl std::fmt::Display for BackpressureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Block => write!(f, "block"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

/// Configuration for a single cache store.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries before eviction kicks in.
    pub max_size: usize,
    /// Default TTL applied by `set` (`None` = entries never expire).
    pub default_ttl: Option<Duration>,
    /// Eviction policy used when the store is full.
    pub eviction_policy: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_CACHE_ENTRIES,
            default_ttl: Some(Duration::from_secs(DEFAULT_CACHE_TTL_SECS)),
            eviction_policy: EvictionPolicy::Lru,
        }
    }
}

impl CacheConfig {
    /// Create a cache configuration with the given capacity and defaults
    /// for everything else.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            ..Self::default()
        }
    }

    /// Set the default TTL (`None` disables expiry).
    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the eviction policy.
    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::new("cache.max_size", "must be > 0"));
        }
        if let Some(ttl) = self.default_ttl {
            if ttl.is_zero() {
                return Err(ConfigError::new(
                    "cache.default_ttl",
                    "must be > 0 (use None for no expiry)",
                ));
            }
        }
        Ok(())
    }
}

/// Configuration for the request optimizer.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Number of worker tasks consuming the queue. At most this many
    /// requests execute concurrently.
    pub max_workers: usize,
    /// Maximum number of queued (not yet executing) units of work.
    pub queue_capacity: usize,
    /// Behavior when the queue is full.
    pub backpressure: BackpressureMode,
    /// In block mode, how long `submit` may wait for queue space before
    /// failing (`None` = wait indefinitely). Ignored in reject mode.
    pub submit_timeout: Option<Duration>,
    /// Maximum requests coalesced into a single batched call.
    pub batch_size: usize,
    /// Window after the first request of a batch during which later
    /// requests with the same batch key may join.
    pub batch_window: Duration,
    /// Maximum retries after the initial attempt of a transient failure.
    pub max_retries: u32,
    /// Base delay for exponential retry backoff.
    pub backoff_base: Duration,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            backpressure: BackpressureMode::Block,
            submit_timeout: None,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_window: Duration::from_millis(DEFAULT_BATCH_WINDOW_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
        }
    }
}

impl OptimizerConfig {
    /// Set the worker count.
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    /// Set the queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the backpressure mode.
    pub fn with_backpressure(mut self, mode: BackpressureMode) -> Self {
        self.backpressure = mode;
        self
    }

    /// Set the block-mode submit timeout.
    pub fn with_submit_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.submit_timeout = timeout;
        self
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the batching window.
    pub fn with_batch_window(mut self, window: Duration) -> Self {
        self.batch_window = window;
        self
    }

    /// Set the maximum retry count.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the backoff base delay.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::new("optimizer.max_workers", "must be > 0"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::new("optimizer.queue_capacity", "must be > 0"));
        }
        if self.batch_size < 2 {
            return Err(ConfigError::new(
                "optimizer.batch_size",
                "must be >= 2 (a batch of one is just a request)",
            ));
        }
        if self.batch_window.is_zero() {
            return Err(ConfigError::new("optimizer.batch_window", "must be > 0"));
        }
        if self.backoff_base.is_zero() {
            return Err(ConfigError::new("optimizer.backoff_base", "must be > 0"));
        }
        if let Some(timeout) = self.submit_timeout {
            if timeout.is_zero() {
                return Err(ConfigError::new(
                    "optimizer.submit_timeout",
                    "must be > 0 (use None to wait indefinitely)",
                ));
            }
        }
        Ok(())
    }
}

/// Configuration for the connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections alive at once (leased + idle).
    pub max_connections: usize,
    /// Default timeout for `acquire` when the pool is exhausted.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

impl PoolConfig {
    /// Create a pool configuration with the given connection limit.
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            ..Self::default()
        }
    }

    /// Set the acquire timeout.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::new("pool.max_connections", "must be > 0"));
        }
        if self.acquire_timeout.is_zero() {
            return Err(ConfigError::new("pool.acquire_timeout", "must be > 0"));
        }
        Ok(())
    }
}

/// Configuration for the performance monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Duration above which an operation raises a slow-operation alert.
    pub slow_threshold: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            slow_threshold: Duration::from_secs_f64(DEFAULT_SLOW_THRESHOLD_SECS),
        }
    }
}

impl MonitorConfig {
    /// Create a monitor configuration with the given slow threshold.
    pub fn new(slow_threshold: Duration) -> Self {
        Self { slow_threshold }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slow_threshold.is_zero() {
            return Err(ConfigError::new("monitor.slow_threshold", "must be > 0"));
        }
        Ok(())
    }
}

/// Complete configuration for the service facade.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Configuration for the request cache store.
    pub cache: CacheConfig,
    /// Interval between expiry sweeps across all registered stores.
    pub cleanup_interval: Duration,
    /// Optimizer configuration.
    pub optimizer: OptimizerConfig,
    /// Monitor configuration.
    pub monitor: MonitorConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
            optimizer: OptimizerConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Set the cache configuration.
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Set the sweep interval.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Set the optimizer configuration.
    pub fn with_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Set the monitor configuration.
    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;
        self.optimizer.validate()?;
        self.monitor.validate()?;
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::new("core.cleanup_interval", "must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.max_size, DEFAULT_MAX_CACHE_ENTRIES);
        assert_eq!(
            config.default_ttl,
            Some(Duration::from_secs(DEFAULT_CACHE_TTL_SECS))
        );
        assert_eq!(config.eviction_policy, EvictionPolicy::Lru);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cache_config_builder() {
        let config = CacheConfig::new(50)
            .with_default_ttl(None)
            .with_eviction_policy(EvictionPolicy::Fifo);

        assert_eq!(config.max_size, 50);
        assert_eq!(config.default_ttl, None);
        assert_eq!(config.eviction_policy, EvictionPolicy::Fifo);
    }

    #[test]
    fn test_cache_config_rejects_zero_size() {
        let config = CacheConfig::new(0);
        let err = config.validate().unwrap_err();
        assert_eq!(err.key, "cache.max_size");
    }

    #[test]
    fn test_cache_config_rejects_zero_ttl() {
        let config = CacheConfig::new(10).with_default_ttl(Some(Duration::ZERO));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_optimizer_config_defaults_valid() {
        assert!(OptimizerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_optimizer_config_rejects_zero_workers() {
        let config = OptimizerConfig::default().with_max_workers(0);
        let err = config.validate().unwrap_err();
        assert_eq!(err.key, "optimizer.max_workers");
    }

    #[test]
    fn test_optimizer_config_rejects_batch_of_one() {
        let config = OptimizerConfig::default().with_batch_size(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_optimizer_config_rejects_zero_queue() {
        let config = OptimizerConfig::default().with_queue_capacity(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backpressure_mode_parse() {
        assert_eq!(
            "block".parse::<BackpressureMode>().unwrap(),
            BackpressureMode::Block
        );
        assert_eq!(
            "Reject".parse::<BackpressureMode>().unwrap(),
            BackpressureMode::Reject
        );
        assert!("drop".parse::<BackpressureMode>().is_err());
    }

    #[test]
    fn test_backpressure_mode_display() {
        assert_eq!(format!("{}", BackpressureMode::Block), "block");
        assert_eq!(format!("{}", BackpressureMode::Reject), "reject");
    }

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pool_config_rejects_zero_connections() {
        let config = PoolConfig::new(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_monitor_config_rejects_zero_threshold() {
        let config = MonitorConfig::new(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_core_config_default_sweep_interval() {
        let config = CoreConfig::default();
        assert_eq!(
            config.cleanup_interval,
            Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_core_config_propagates_section_errors() {
        let config = CoreConfig::default().with_cache(CacheConfig::new(0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::new("cache.max_size", "must be > 0");
        assert_eq!(
            format!("{}", err),
            "invalid configuration: cache.max_size: must be > 0"
        );
    }
}
