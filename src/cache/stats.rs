//! Cache statistics tracking and reporting.

/// Statistics for a single cache store.
///
/// Counters are updated under the store's lock and cloned out by
/// `CacheStore::stats`. Capacity evictions and TTL expirations are kept
/// as separate counters.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Lookups that returned an unexpired entry.
    pub hits: u64,
    /// Lookups that found nothing usable (missing or expired).
    pub misses: u64,
    /// Entries removed to make room for an insert.
    pub evictions: u64,
    /// Entries removed because their TTL elapsed.
    pub expirations: u64,
    /// Current number of entries.
    pub size: usize,
    /// Configured capacity.
    pub max_size: usize,
}

impl CacheStats {
    /// Create a new statistics tracker for a store of the given capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            ..Self::default()
        }
    }

    /// Hit rate in `[0.0, 1.0]`, defined as 0.0 before any access.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Total number of lookups.
    pub fn total_accesses(&self) -> u64 {
        self.hits + self.misses
    }

    pub(crate) fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub(crate) fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub(crate) fn record_eviction(&mut self) {
        self.evictions += 1;
    }

    pub(crate) fn record_expiration(&mut self) {
        self.expirations += 1;
    }

    /// Reset all counters (size and capacity are left alone).
    pub(crate) fn reset(&mut self) {
        self.hits = 0;
        self.misses = 0;
        self.evictions = 0;
        self.expirations = 0;
    }
}
