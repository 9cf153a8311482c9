//! Speculative cache population ahead of demand.
//!
//! The prefetcher submits anticipated keys through the same optimizer as
//! foreground traffic, at [`PRIORITY_PREFETCH`] - strictly less urgent
//! than anything a caller can submit - so foreground requests are never
//! starved. Fetched values land in the shared cache store; no per-key
//! result is returned to the prefetch caller.

use crate::cache::CacheStore;
use crate::optimizer::{
    FetchOperation, FetchRequest, RequestOptimizer, PRIORITY_PREFETCH,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Prefetcher statistics for monitoring.
#[derive(Debug, Default)]
pub struct PrefetchStats {
    /// Keys handed to `prefetch`.
    keys_requested: AtomicU64,
    /// Requests actually submitted.
    submitted: AtomicU64,
    /// Keys skipped because the cache already held them.
    already_cached: AtomicU64,
    /// Submissions rejected by queue backpressure.
    rejected: AtomicU64,
    /// Prefetch requests that resolved successfully.
    completed: AtomicU64,
    /// Prefetch requests that resolved with a failure.
    failed: AtomicU64,
}

impl PrefetchStats {
    /// Take a snapshot of the current statistics.
    pub fn snapshot(&self) -> PrefetchStatsSnapshot {
        PrefetchStatsSnapshot {
            keys_requested: self.keys_requested.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            already_cached: self.already_cached.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of prefetch statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchStatsSnapshot {
    pub keys_requested: u64,
    pub submitted: u64,
    pub already_cached: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
}

/// What one `prefetch` call did with its keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchOutcome {
    /// Keys passed in.
    pub requested: usize,
    /// Requests submitted to the optimizer.
    pub submitted: usize,
    /// Keys skipped because they were already cached.
    pub already_cached: usize,
    /// Submissions refused by queue backpressure.
    pub rejected: usize,
}

/// Submits speculative low-priority requests through a shared optimizer.
pub struct Prefetcher<V> {
    optimizer: Arc<RequestOptimizer<V>>,
    cache: Arc<CacheStore<V>>,
    stats: Arc<PrefetchStats>,
}

impl<V: Clone + Send + Sync + 'static> Prefetcher<V> {
    /// Create a prefetcher over the given optimizer and cache store.
    ///
    /// The store should be the one the optimizer writes results to, so
    /// prefetched values are visible to foreground lookups.
    pub fn new(optimizer: Arc<RequestOptimizer<V>>, cache: Arc<CacheStore<V>>) -> Self {
        Self {
            optimizer,
            cache,
            stats: Arc::new(PrefetchStats::default()),
        }
    }

    /// Prefetch the given keys through `operation`.
    ///
    /// Keys already cached are skipped. Each remaining key is submitted
    /// at prefetch priority; completion is tracked in the statistics and
    /// the values land in the shared store. Submissions refused by
    /// backpressure are dropped - prefetch traffic never blocks.
    pub async fn prefetch(
        &self,
        keys: Vec<String>,
        operation: Arc<dyn FetchOperation<V>>,
    ) -> PrefetchOutcome {
        let mut outcome = PrefetchOutcome {
            requested: keys.len(),
            ..PrefetchOutcome::default()
        };
        self.stats
            .keys_requested
            .fetch_add(keys.len() as u64, Ordering::Relaxed);

        for key in keys {
            if self.cache.contains(&key) {
                trace!(key = %key, "prefetch skipped, already cached");
                outcome.already_cached += 1;
                self.stats.already_cached.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let mut request = FetchRequest::new(key.clone(), Arc::clone(&operation));
            request.priority = PRIORITY_PREFETCH;

            match self.optimizer.submit(request).await {
                Ok(handle) => {
                    outcome.submitted += 1;
                    self.stats.submitted.fetch_add(1, Ordering::Relaxed);

                    let stats = Arc::clone(&self.stats);
                    tokio::spawn(async move {
                        match handle.wait().await {
                            Ok(_) => stats.completed.fetch_add(1, Ordering::Relaxed),
                            Err(_) => stats.failed.fetch_add(1, Ordering::Relaxed),
                        };
                    });
                }
                Err(err) => {
                    trace!(key = %key, %err, "prefetch submission refused");
                    outcome.rejected += 1;
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        debug!(
            requested = outcome.requested,
            submitted = outcome.submitted,
            already_cached = outcome.already_cached,
            rejected = outcome.rejected,
            "prefetch cycle"
        );
        outcome
    }

    /// Access the prefetch statistics.
    pub fn stats(&self) -> PrefetchStatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EvictionPolicy;
    use crate::config::{BackpressureMode, CacheConfig, OptimizerConfig};
    use crate::optimizer::FetchError;
    use futures::future::BoxFuture;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct CountingOperation {
        calls: AtomicU32,
    }

    impl CountingOperation {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
            })
        }
    }

    impl FetchOperation<String> for CountingOperation {
        fn fetch<'a>(
            &'a self,
            keys: &'a [String],
        ) -> BoxFuture<'a, Result<Vec<(String, String)>, FetchError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(keys
                    .iter()
                    .map(|k| (k.clone(), format!("value-{k}")))
                    .collect())
            })
        }
    }

    fn setup() -> (Arc<RequestOptimizer<String>>, Arc<CacheStore<String>>) {
        let cache = Arc::new(CacheStore::new(
            "prefetch-test",
            CacheConfig::new(100)
                .with_default_ttl(None)
                .with_eviction_policy(EvictionPolicy::Lru),
        ));
        let optimizer = Arc::new(
            RequestOptimizer::new(OptimizerConfig::default(), Some(Arc::clone(&cache))).unwrap(),
        );
        (optimizer, cache)
    }

    async fn settle(cache: &CacheStore<String>, keys: &[&str]) {
        for _ in 0..100 {
            if keys.iter().all(|k| cache.contains(k)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("prefetched keys never landed in the cache");
    }

    #[tokio::test]
    async fn test_prefetch_populates_cache() {
        let (optimizer, cache) = setup();
        let prefetcher = Prefetcher::new(Arc::clone(&optimizer), Arc::clone(&cache));

        let outcome = prefetcher
            .prefetch(
                vec!["a".into(), "b".into(), "c".into()],
                CountingOperation::new(),
            )
            .await;
        assert_eq!(outcome.submitted, 3);

        settle(&cache, &["a", "b", "c"]).await;
        assert_eq!(cache.get("b"), Some("value-b".to_string()));
        optimizer.shutdown().await;
    }

    #[tokio::test]
    async fn test_prefetch_skips_cached_keys() {
        let (optimizer, cache) = setup();
        cache.set("hot", "already-here".to_string());
        let prefetcher = Prefetcher::new(Arc::clone(&optimizer), Arc::clone(&cache));
        let operation = CountingOperation::new();

        let outcome = prefetcher
            .prefetch(vec!["hot".into(), "cold".into()], operation.clone())
            .await;

        assert_eq!(outcome.requested, 2);
        assert_eq!(outcome.already_cached, 1);
        assert_eq!(outcome.submitted, 1);

        settle(&cache, &["cold"]).await;
        assert_eq!(cache.get("hot"), Some("already-here".to_string()));

        let stats = prefetcher.stats();
        assert_eq!(stats.already_cached, 1);
        assert_eq!(stats.submitted, 1);
        optimizer.shutdown().await;
    }

    #[tokio::test]
    async fn test_prefetch_completion_tracked() {
        let (optimizer, cache) = setup();
        let prefetcher = Prefetcher::new(Arc::clone(&optimizer), Arc::clone(&cache));

        prefetcher
            .prefetch(vec!["x".into()], CountingOperation::new())
            .await;
        settle(&cache, &["x"]).await;

        // The completion task runs after the handle resolves
        for _ in 0..100 {
            if prefetcher.stats().completed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(prefetcher.stats().completed, 1);
        assert_eq!(prefetcher.stats().failed, 0);
        optimizer.shutdown().await;
    }

    #[tokio::test]
    async fn test_prefetch_rejected_by_backpressure() {
        let cache = Arc::new(CacheStore::new(
            "tiny",
            CacheConfig::new(100).with_default_ttl(None),
        ));
        let config = OptimizerConfig::default()
            .with_max_workers(1)
            .with_queue_capacity(1)
            .with_backpressure(BackpressureMode::Reject);
        let optimizer =
            Arc::new(RequestOptimizer::new(config, Some(Arc::clone(&cache))).unwrap());
        let prefetcher = Prefetcher::new(Arc::clone(&optimizer), Arc::clone(&cache));

        // Stall the lone worker so the queue backs up
        struct StallOperation;
        impl FetchOperation<String> for StallOperation {
            fn fetch<'a>(
                &'a self,
                keys: &'a [String],
            ) -> BoxFuture<'a, Result<Vec<(String, String)>, FetchError>> {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(keys.iter().map(|k| (k.clone(), String::new())).collect())
                })
            }
        }

        let operation: Arc<dyn FetchOperation<String>> = Arc::new(StallOperation);
        let outcome = prefetcher
            .prefetch(
                vec!["a".into(), "b".into(), "c".into(), "d".into()],
                operation,
            )
            .await;

        assert!(outcome.rejected > 0, "backpressure must drop, not block");
        assert_eq!(
            outcome.submitted + outcome.rejected,
            4,
            "every key either submitted or dropped"
        );
        optimizer.shutdown().await;
    }
}
