//! High-level facade wiring the caching and request-optimization core.
//!
//! [`CacheFlowService`] builds the whole stack from one [`CoreConfig`]: a
//! cache manager with its expiry sweeper, a request optimizer bound to a
//! named request store, a prefetcher, and a performance monitor. One
//! constructed instance is passed to consumers - there is no ambient
//! global lookup - and an explicit [`shutdown`](CacheFlowService::shutdown)
//! tears down workers and timers.
//!
//! # Data flow
//!
//! ```text
//! get_or_fetch ──► cache get ──hit──► value
//!                      │miss
//!                      ▼
//!                   submit ──► worker ──► operation ──► cache fill ──► value
//! ```

use crate::cache::{CacheManager, CacheStore};
use crate::config::{ConfigError, CoreConfig};
use crate::monitor::PerformanceMonitor;
use crate::optimizer::{
    FetchOperation, FetchRequest, RequestError, RequestOptimizer, PRIORITY_ON_DEMAND,
};
use crate::prefetch::{PrefetchOutcome, Prefetcher};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Name of the store the optimizer writes fetched results into.
pub const REQUEST_CACHE_NAME: &str = "requests";

/// One-stop facade over the caching + request-optimization core.
pub struct CacheFlowService<V> {
    config: CoreConfig,
    caches: Arc<CacheManager<V>>,
    request_cache: Arc<CacheStore<V>>,
    optimizer: Arc<RequestOptimizer<V>>,
    prefetcher: Prefetcher<V>,
    monitor: Arc<PerformanceMonitor>,
}

impl<V: Clone + Send + Sync + 'static> CacheFlowService<V> {
    /// Build and start the service.
    ///
    /// Validates the whole configuration up front, creates the request
    /// store, spawns the optimizer workers and the expiry sweeper. Must
    /// be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for any invalid option; nothing is
    /// started in that case.
    pub fn new(config: CoreConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let caches = Arc::new(CacheManager::new(config.cleanup_interval));
        let request_cache = caches.create_cache(REQUEST_CACHE_NAME, config.cache.clone())?;
        caches.start_sweeper();

        let optimizer = Arc::new(RequestOptimizer::new(
            config.optimizer.clone(),
            Some(Arc::clone(&request_cache)),
        )?);
        let prefetcher = Prefetcher::new(Arc::clone(&optimizer), Arc::clone(&request_cache));
        let monitor = Arc::new(PerformanceMonitor::new(config.monitor.clone()));

        info!("cacheflow service started");
        Ok(Self {
            config,
            caches,
            request_cache,
            optimizer,
            prefetcher,
            monitor,
        })
    }

    /// Look up `key`, fetching through the worker pool on a miss.
    ///
    /// The complete round trip is timed by the monitor under the
    /// operation name `"get_or_fetch"`.
    pub async fn get_or_fetch(
        &self,
        key: impl Into<String>,
        operation: Arc<dyn FetchOperation<V>>,
    ) -> Result<V, RequestError> {
        let key = key.into();
        self.monitor
            .observe("get_or_fetch", async {
                if let Some(value) = self.request_cache.get(&key) {
                    return Ok(value);
                }
                let handle = self
                    .optimizer
                    .submit(
                        FetchRequest::new(key, operation).with_priority(PRIORITY_ON_DEMAND),
                    )
                    .await?;
                handle.wait().await
            })
            .await
    }

    /// Speculatively warm the cache for the given keys.
    pub async fn prefetch(
        &self,
        keys: Vec<String>,
        operation: Arc<dyn FetchOperation<V>>,
    ) -> PrefetchOutcome {
        self.prefetcher.prefetch(keys, operation).await
    }

    /// The cache registry (for creating additional named stores).
    pub fn caches(&self) -> &Arc<CacheManager<V>> {
        &self.caches
    }

    /// The store fetched results are written to.
    pub fn request_cache(&self) -> &Arc<CacheStore<V>> {
        &self.request_cache
    }

    /// The request optimizer.
    pub fn optimizer(&self) -> &Arc<RequestOptimizer<V>> {
        &self.optimizer
    }

    /// The prefetcher.
    pub fn prefetcher(&self) -> &Prefetcher<V> {
        &self.prefetcher
    }

    /// The performance monitor.
    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    /// The configuration the service was built with.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// The sweep interval in effect.
    pub fn cleanup_interval(&self) -> Duration {
        self.config.cleanup_interval
    }

    /// Stop workers and timers.
    ///
    /// In-flight requests run to completion; queued ones resolve with a
    /// shutdown error. Idempotent.
    pub async fn shutdown(&self) {
        info!("cacheflow service shutting down");
        self.optimizer.shutdown().await;
        self.caches.shutdown().await;
    }
}
