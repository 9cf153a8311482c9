//! The request optimizer: a bounded worker pool over a priority queue.
//!
//! `submit` enqueues a [`FetchRequest`] and returns a handle that resolves
//! once a worker has executed the caller-supplied operation (or served the
//! value from cache). Requests sharing a batch key are coalesced into one
//! underlying call. Transient failures retry with exponential backoff;
//! successful values land in the attached cache store.
//!
//! # Architecture
//!
//! ```text
//! submit ──► batch gatherer ──► priority queue ──► worker pool ──► operation
//!                │                                    │                │
//!                └── window/size flush                └── cache ◄──────┘
//! ```

use crate::cache::CacheStore;
use crate::config::{ConfigError, OptimizerConfig};
use crate::optimizer::batch::{BatchGatherer, OpenOutcome, TryJoin};
use crate::optimizer::error::RequestError;
use crate::optimizer::queue::{BatchMember, PendingRequest, QueuedWork, RequestQueue};
use crate::optimizer::request::{FetchRequest, RequestHandle, RequestId};
use crate::optimizer::stats::{OptimizerStats, OptimizerStatsSnapshot};
use crate::optimizer::worker::{worker_loop, WorkerContext};
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bounded worker pool consuming a shared priority queue of requests.
///
/// Dropping the optimizer signals the workers to stop; prefer an explicit
/// [`shutdown`](RequestOptimizer::shutdown) so queued requests resolve
/// with a shutdown error instead of dangling.
pub struct RequestOptimizer<V> {
    config: OptimizerConfig,
    ctx: Arc<WorkerContext<V>>,
    batcher: Arc<BatchGatherer<V>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<V: Clone + Send + Sync + 'static> RequestOptimizer<V> {
    /// Create an optimizer and spawn its workers.
    ///
    /// Successful results are written to `cache` when one is given.
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the configuration is invalid.
    pub fn new(
        config: OptimizerConfig,
        cache: Option<Arc<CacheStore<V>>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let queue = Arc::new(RequestQueue::new(config.queue_capacity));
        let ctx = Arc::new(WorkerContext {
            queue: Arc::clone(&queue),
            cache,
            stats: Arc::new(OptimizerStats::new()),
            registry: Arc::new(DashMap::new()),
            max_retries: config.max_retries,
            backoff_base: config.backoff_base,
        });
        let batcher = Arc::new(BatchGatherer::new(
            queue,
            config.batch_size,
            config.batch_window,
        ));

        let shutdown = CancellationToken::new();
        let workers = (0..config.max_workers)
            .map(|worker_id| {
                tokio::spawn(worker_loop(Arc::clone(&ctx), worker_id, shutdown.clone()))
            })
            .collect();

        info!(
            workers = config.max_workers,
            queue_capacity = config.queue_capacity,
            backpressure = %config.backpressure,
            "request optimizer started"
        );

        Ok(Self {
            config,
            ctx,
            batcher,
            shutdown,
            workers: Mutex::new(workers),
        })
    }

    /// Submit a request.
    ///
    /// Returns a handle that resolves to the fetched value or a typed
    /// failure. When the queue is full this blocks or fails according to
    /// the configured backpressure mode.
    pub async fn submit(
        &self,
        request: FetchRequest<V>,
    ) -> Result<RequestHandle<V>, RequestError> {
        let id = RequestId::new();
        let (result_tx, result_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        self.ctx.registry.insert(id, cancel.clone());

        match self.enqueue(id, request, cancel, result_tx).await {
            Ok(()) => {
                self.ctx.stats.record_submitted();
                Ok(RequestHandle::new(id, result_rx))
            }
            Err(err) => {
                self.ctx.registry.remove(&id);
                Err(err)
            }
        }
    }

    async fn enqueue(
        &self,
        id: RequestId,
        request: FetchRequest<V>,
        cancel: CancellationToken,
        result_tx: oneshot::Sender<Result<V, RequestError>>,
    ) -> Result<(), RequestError> {
        let now = Instant::now();
        let deadline = request.deadline.map(|d| now + d);
        let priority = request.priority;

        let Some(batch_key) = request.batch_key else {
            let slot = self
                .ctx
                .queue
                .reserve(self.config.backpressure, self.config.submit_timeout)
                .await?;
            self.ctx.queue.push(
                slot,
                priority,
                QueuedWork::Single(PendingRequest {
                    id,
                    key: request.key,
                    enqueued_at: now,
                    deadline,
                    cancel,
                    operation: request.operation,
                    result_tx,
                }),
            );
            return Ok(());
        };

        let member = BatchMember {
            id,
            key: request.key,
            enqueued_at: now,
            deadline,
            cancel,
            result_tx,
        };

        // Fast path: an open batch absorbs the member without consuming
        // another queue slot.
        let member = match self.batcher.try_join(&batch_key, priority, member) {
            TryJoin::Joined | TryJoin::FlushedFull => return Ok(()),
            TryJoin::NotOpen(member) => member,
        };

        let slot = self
            .ctx
            .queue
            .reserve(self.config.backpressure, self.config.submit_timeout)
            .await?;
        match self
            .batcher
            .open(batch_key.clone(), priority, request.operation, member, slot)
        {
            OpenOutcome::Opened { generation } => {
                let batcher = Arc::clone(&self.batcher);
                let window = batcher.window();
                tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    batcher.flush_window(&batch_key, generation);
                });
            }
            OpenOutcome::JoinedExisting | OpenOutcome::FlushedFull => {}
        }
        Ok(())
    }

    /// Cancel a request by ID.
    ///
    /// Effective while the request is queued (it resolves as cancelled
    /// instead of executing) and between retry attempts of an executing
    /// request; an in-progress underlying call is never interrupted.
    ///
    /// Returns true if the request was still known to the optimizer.
    pub fn cancel(&self, id: RequestId) -> bool {
        match self.ctx.registry.get(&id) {
            Some(entry) => {
                debug!(%id, "request cancelled");
                entry.value().cancel();
                true
            }
            None => false,
        }
    }

    /// Snapshot of the optimizer counters.
    pub fn stats(&self) -> OptimizerStatsSnapshot {
        self.ctx.stats.snapshot()
    }

    /// Number of units of work currently queued (executing work excluded).
    pub fn queue_len(&self) -> usize {
        self.ctx.queue.len()
    }

    /// The configuration this optimizer runs with.
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Stop the workers and drain the queue.
    ///
    /// In-flight work runs to completion; everything still queued or
    /// gathering in a batch resolves with [`RequestError::Shutdown`].
    pub async fn shutdown(&self) {
        info!(
            queued = self.ctx.queue.len(),
            gathering = self.batcher.open_count(),
            "request optimizer shutting down"
        );
        self.shutdown.cancel();

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("optimizer worker panicked: {e}");
            }
        }

        let mut orphaned = 0usize;
        for work in self.ctx.queue.close_and_drain() {
            match work {
                QueuedWork::Single(request) => {
                    self.ctx.registry.remove(&request.id);
                    let _ = request.result_tx.send(Err(RequestError::Shutdown));
                    orphaned += 1;
                }
                QueuedWork::Batch { members, .. } => {
                    for member in members {
                        self.ctx.registry.remove(&member.id);
                        let _ = member.result_tx.send(Err(RequestError::Shutdown));
                        orphaned += 1;
                    }
                }
            }
        }
        for member in self.batcher.drain() {
            self.ctx.registry.remove(&member.id);
            let _ = member.result_tx.send(Err(RequestError::Shutdown));
            orphaned += 1;
        }
        if orphaned > 0 {
            debug!(orphaned, "queued requests resolved as shut down");
        }
    }
}

impl<V> Drop for RequestOptimizer<V> {
    fn drop(&mut self) {
        // Best effort: workers observe the token at their next pop.
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EvictionPolicy;
    use crate::config::{BackpressureMode, CacheConfig};
    use crate::optimizer::error::FetchError;
    use crate::optimizer::request::FetchOperation;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Operation that answers every key with its length.
    struct KeyLenOperation {
        calls: AtomicU32,
    }

    impl KeyLenOperation {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
            })
        }
    }

    impl FetchOperation<usize> for KeyLenOperation {
        fn fetch<'a>(
            &'a self,
            keys: &'a [String],
        ) -> BoxFuture<'a, Result<Vec<(String, usize)>, FetchError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(keys.iter().map(|k| (k.clone(), k.len())).collect())
            })
        }
    }

    /// Operation that blocks until released, tracking peak concurrency.
    struct GatedOperation {
        gate: Semaphore,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl GatedOperation {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }

        fn release(&self, n: usize) {
            self.gate.add_permits(n);
        }
    }

    impl FetchOperation<usize> for GatedOperation {
        fn fetch<'a>(
            &'a self,
            keys: &'a [String],
        ) -> BoxFuture<'a, Result<Vec<(String, usize)>, FetchError>> {
            Box::pin(async move {
                let current = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(current, Ordering::SeqCst);

                let permit = self.gate.acquire().await.expect("gate closed");
                permit.forget();

                self.running.fetch_sub(1, Ordering::SeqCst);
                Ok(keys.iter().map(|k| (k.clone(), 0)).collect())
            })
        }
    }

    fn cache() -> Arc<CacheStore<usize>> {
        Arc::new(CacheStore::new(
            "test",
            CacheConfig::new(100)
                .with_default_ttl(None)
                .with_eviction_policy(EvictionPolicy::Lru),
        ))
    }

    #[tokio::test]
    async fn test_submit_and_wait() {
        let optimizer = RequestOptimizer::new(OptimizerConfig::default(), Some(cache())).unwrap();
        let op = KeyLenOperation::new();

        let handle = optimizer
            .submit(FetchRequest::new("hello", op.clone()))
            .await
            .unwrap();
        assert_eq!(handle.wait().await, Ok(5));

        let snap = optimizer.stats();
        assert_eq!(snap.submitted, 1);
        assert_eq!(snap.succeeded, 1);
        optimizer.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_fails_fast() {
        let result: Result<RequestOptimizer<usize>, _> =
            RequestOptimizer::new(OptimizerConfig::default().with_max_workers(0), None);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_result_populates_cache() {
        let store = cache();
        let optimizer =
            RequestOptimizer::new(OptimizerConfig::default(), Some(Arc::clone(&store))).unwrap();

        let handle = optimizer
            .submit(FetchRequest::new("abc", KeyLenOperation::new()))
            .await
            .unwrap();
        handle.wait().await.unwrap();

        assert_eq!(store.get("abc"), Some(3));
        optimizer.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_worker_count() {
        let config = OptimizerConfig::default()
            .with_max_workers(2)
            .with_queue_capacity(32);
        let optimizer = RequestOptimizer::new(config, None).unwrap();
        let op = GatedOperation::new();

        let mut handles = Vec::new();
        for i in 0..8 {
            handles.push(
                optimizer
                    .submit(FetchRequest::new(format!("k{i}"), op.clone()))
                    .await
                    .unwrap(),
            );
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(op.running.load(Ordering::SeqCst), 2, "only two executing");

        op.release(64);
        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert!(op.peak.load(Ordering::SeqCst) <= 2);
        optimizer.shutdown().await;
    }

    #[tokio::test]
    async fn test_reject_mode_capacity_exceeded() {
        // Two workers busy, one slot queued: the fourth submit must fail.
        let config = OptimizerConfig::default()
            .with_max_workers(2)
            .with_queue_capacity(1)
            .with_backpressure(BackpressureMode::Reject);
        let optimizer = RequestOptimizer::new(config, None).unwrap();
        let op = GatedOperation::new();

        let h1 = optimizer
            .submit(FetchRequest::new("a", op.clone()))
            .await
            .unwrap();
        let h2 = optimizer
            .submit(FetchRequest::new("b", op.clone()))
            .await
            .unwrap();
        // Wait until both workers have picked their requests up
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(op.running.load(Ordering::SeqCst), 2);

        let h3 = optimizer
            .submit(FetchRequest::new("c", op.clone()))
            .await
            .unwrap();

        let overflow = optimizer.submit(FetchRequest::new("d", op.clone())).await;
        assert!(matches!(overflow, Err(RequestError::CapacityExceeded)));

        op.release(64);
        for handle in [h1, h2, h3] {
            handle.wait().await.unwrap();
        }
        optimizer.shutdown().await;
    }

    #[tokio::test]
    async fn test_block_mode_submit_timeout() {
        let config = OptimizerConfig::default()
            .with_max_workers(1)
            .with_queue_capacity(1)
            .with_backpressure(BackpressureMode::Block)
            .with_submit_timeout(Some(Duration::from_millis(30)));
        let optimizer = RequestOptimizer::new(config, None).unwrap();
        let op = GatedOperation::new();

        let h1 = optimizer
            .submit(FetchRequest::new("a", op.clone()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let h2 = optimizer
            .submit(FetchRequest::new("b", op.clone()))
            .await
            .unwrap();

        let overflow = optimizer.submit(FetchRequest::new("c", op.clone())).await;
        assert!(matches!(overflow, Err(RequestError::CapacityExceeded)));

        op.release(64);
        h1.wait().await.unwrap();
        h2.wait().await.unwrap();
        optimizer.shutdown().await;
    }

    #[tokio::test]
    async fn test_priority_order_with_single_worker() {
        let config = OptimizerConfig::default()
            .with_max_workers(1)
            .with_queue_capacity(16);
        let optimizer = RequestOptimizer::new(config, None).unwrap();
        let gate = GatedOperation::new();
        let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        struct RecordingOperation {
            order: Arc<Mutex<Vec<String>>>,
        }
        impl FetchOperation<usize> for RecordingOperation {
            fn fetch<'a>(
                &'a self,
                keys: &'a [String],
            ) -> BoxFuture<'a, Result<Vec<(String, usize)>, FetchError>> {
                Box::pin(async move {
                    self.order.lock().unwrap().push(keys[0].clone());
                    Ok(keys.iter().map(|k| (k.clone(), 0)).collect())
                })
            }
        }

        // Occupy the lone worker so later submissions queue up
        let blocker = optimizer
            .submit(FetchRequest::new("blocker", gate.clone()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let recorder = Arc::new(RecordingOperation {
            order: Arc::clone(&order),
        });
        let low = optimizer
            .submit(FetchRequest::new("low", recorder.clone()).with_priority(9))
            .await
            .unwrap();
        let high = optimizer
            .submit(FetchRequest::new("high", recorder.clone()).with_priority(0))
            .await
            .unwrap();
        let mid = optimizer
            .submit(FetchRequest::new("mid", recorder.clone()).with_priority(5))
            .await
            .unwrap();

        gate.release(64);
        blocker.wait().await.unwrap();
        low.wait().await.unwrap();
        high.wait().await.unwrap();
        mid.wait().await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
        optimizer.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_queued_request() {
        let config = OptimizerConfig::default()
            .with_max_workers(1)
            .with_queue_capacity(8);
        let optimizer = RequestOptimizer::new(config, None).unwrap();
        let gate = GatedOperation::new();
        let op = KeyLenOperation::new();

        let blocker = optimizer
            .submit(FetchRequest::new("blocker", gate.clone()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let queued = optimizer
            .submit(FetchRequest::new("victim", op.clone()))
            .await
            .unwrap();
        let id = queued.id();
        assert!(optimizer.cancel(id));

        gate.release(64);
        blocker.wait().await.unwrap();
        assert_eq!(queued.wait().await, Err(RequestError::Cancelled));
        assert_eq!(op.calls.load(Ordering::SeqCst), 0, "victim never executed");

        assert!(!optimizer.cancel(id), "resolved request is unknown");
        optimizer.shutdown().await;
    }

    #[tokio::test]
    async fn test_batched_requests_share_one_call() {
        let config = OptimizerConfig::default()
            .with_max_workers(2)
            .with_batch_size(8)
            .with_batch_window(Duration::from_millis(40));
        let optimizer = RequestOptimizer::new(config, None).unwrap();
        let op = KeyLenOperation::new();

        let mut handles = Vec::new();
        for key in ["aa", "bbb", "cccc"] {
            handles.push(
                optimizer
                    .submit(FetchRequest::new(key, op.clone()).with_batch_key("lens"))
                    .await
                    .unwrap(),
            );
        }

        let results: Vec<usize> = [2, 3, 4].into();
        for (handle, expected) in handles.into_iter().zip(results) {
            assert_eq!(handle.wait().await, Ok(expected));
        }
        assert_eq!(op.calls.load(Ordering::SeqCst), 1, "one coalesced call");
        optimizer.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_batch_flushes_before_window() {
        let config = OptimizerConfig::default()
            .with_max_workers(1)
            .with_batch_size(2)
            .with_batch_window(Duration::from_secs(5));
        let optimizer = RequestOptimizer::new(config, None).unwrap();
        let op = KeyLenOperation::new();

        let h1 = optimizer
            .submit(FetchRequest::new("a", op.clone()).with_batch_key("b"))
            .await
            .unwrap();
        let h2 = optimizer
            .submit(FetchRequest::new("bb", op.clone()).with_batch_key("b"))
            .await
            .unwrap();

        // Resolves promptly despite the long window because size was hit
        let value = tokio::time::timeout(Duration::from_secs(1), h1.wait())
            .await
            .expect("batch flushed on size");
        assert_eq!(value, Ok(1));
        assert_eq!(h2.wait().await, Ok(2));
        optimizer.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_resolves_queued_requests() {
        let config = OptimizerConfig::default()
            .with_max_workers(1)
            .with_queue_capacity(8);
        let optimizer = Arc::new(RequestOptimizer::new(config, None).unwrap());
        let gate = GatedOperation::new();

        let blocker = optimizer
            .submit(FetchRequest::new("blocker", gate.clone()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let queued = optimizer
            .submit(FetchRequest::new("stuck", KeyLenOperation::new()))
            .await
            .unwrap();

        // Start shutdown while the worker is mid-request; the in-flight
        // call runs to completion, the queued one must not execute.
        let shutdown_task = {
            let optimizer = Arc::clone(&optimizer);
            tokio::spawn(async move { optimizer.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        gate.release(1);

        blocker.wait().await.unwrap();
        shutdown_task.await.unwrap();

        assert_eq!(queued.wait().await, Err(RequestError::Shutdown));

        let late = optimizer
            .submit(FetchRequest::new("late", KeyLenOperation::new()))
            .await;
        assert!(matches!(late, Err(RequestError::Shutdown)));
    }
}
