//! Configuration types for CacheFlow components.
//!
//! This module provides structured configuration objects that group related
//! parameters together. Each struct covers one component, carries documented
//! defaults, and is validated at construction time - an invalid value fails
//! fast with a [`ConfigError`] instead of being silently replaced.
//!
//! # Example
//!
//! ```
//! use cacheflow::config::{CacheConfig, OptimizerConfig};
//! use cacheflow::cache::EvictionPolicy;
//! use std::time::Duration;
//!
//! let cache_config = CacheConfig::new(500)
//!     .with_default_ttl(Some(Duration::from_secs(600)))
//!     .with_eviction_policy(EvictionPolicy::Lfu);
//!
//! let optimizer_config = OptimizerConfig::default();
//! ```

mod settings;

pub use settings::{
    BackpressureMode, CacheConfig, ConfigError, CoreConfig, MonitorConfig, OptimizerConfig,
    PoolConfig, DEFAULT_ACQUIRE_TIMEOUT_SECS, DEFAULT_BACKOFF_BASE_MS, DEFAULT_BATCH_SIZE,
    DEFAULT_BATCH_WINDOW_MS, DEFAULT_CACHE_TTL_SECS, DEFAULT_CLEANUP_INTERVAL_SECS,
    DEFAULT_MAX_CACHE_ENTRIES, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_RETRIES, DEFAULT_MAX_WORKERS,
    DEFAULT_QUEUE_CAPACITY, DEFAULT_SLOW_THRESHOLD_SECS,
};
