//! Lock-free optimizer statistics.
//!
//! Counters use relaxed atomics - they are independent measurements and
//! need no ordering between one another.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Atomic counters updated by the workers.
#[derive(Debug, Default)]
pub struct OptimizerStats {
    /// Requests accepted by `submit`.
    submitted: AtomicU64,
    /// Requests resolved with a value.
    succeeded: AtomicU64,
    /// Requests resolved with a failure (retries exhausted, permanent
    /// error, or deadline exceeded).
    failed: AtomicU64,
    /// Requests resolved as cancelled.
    cancelled: AtomicU64,
    /// Requests served straight from the cache by a worker.
    cache_hits_served: AtomicU64,
    /// Retry attempts performed.
    retries: AtomicU64,
    /// Sum of queue-to-resolution latencies, in microseconds.
    total_latency_us: AtomicU64,
}

impl OptimizerStats {
    /// Create a zeroed statistics block.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_succeeded(&self, latency: Duration) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self, latency: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_hit_served(&self) {
        self.cache_hits_served.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of the current counters.
    pub fn snapshot(&self) -> OptimizerStatsSnapshot {
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let total_latency_us = self.total_latency_us.load(Ordering::Relaxed);
        let resolved = succeeded + failed;

        OptimizerStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            succeeded,
            failed,
            cancelled: self.cancelled.load(Ordering::Relaxed),
            cache_hits_served: self.cache_hits_served.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            average_latency: if resolved == 0 {
                Duration::ZERO
            } else {
                Duration::from_micros(total_latency_us / resolved)
            },
        }
    }
}

/// Point-in-time view of the optimizer counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizerStatsSnapshot {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub cache_hits_served: u64,
    pub retries: u64,
    /// Mean queue-to-resolution latency over resolved requests.
    pub average_latency: Duration,
}
