//! Thread-safe named cache store with TTL and policy-driven eviction.

use crate::cache::entry::CacheEntry;
use crate::cache::policy::EvictionPolicy;
use crate::cache::stats::CacheStats;
use crate::config::CacheConfig;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// A single named key/value store with TTL expiry and bounded capacity.
///
/// All entries and counters live behind one mutex, so a `set` is visible
/// to every `get` issued after it. Values are cloned out on hit; wrap
/// large values in `Arc` to keep that cheap.
///
/// Expired entries are removed lazily on lookup and eagerly by the
/// [`CacheManager`](crate::cache::CacheManager) sweep, whichever comes
/// first. An expired entry found on lookup counts as a miss.
pub struct CacheStore<V> {
    name: String,
    config: CacheConfig,
    inner: Mutex<StoreInner<V>>,
}

struct StoreInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    stats: CacheStats,
}

impl<V: Clone> CacheStore<V> {
    /// Create a new store.
    ///
    /// The configuration must already be validated; `CacheManager` and the
    /// service facade do so before constructing stores.
    pub fn new(name: impl Into<String>, config: CacheConfig) -> Self {
        let stats = CacheStats::new(config.max_size);
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(StoreInner {
                entries: HashMap::new(),
                stats,
            }),
        }
    }

    /// Returns the store's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the eviction policy in effect.
    pub fn eviction_policy(&self) -> EvictionPolicy {
        self.config.eviction_policy
    }

    /// Returns the configured capacity.
    pub fn max_size(&self) -> usize {
        self.config.max_size
    }

    /// Look up a value.
    ///
    /// Returns `Some(value)` and updates access metadata if an unexpired
    /// entry exists. An expired entry is removed, recorded as an
    /// expiration, and counted as a miss. A missing key has no side
    /// effects beyond the miss counter.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let now = Instant::now();

        match inner.entries.get(key).map(|e| e.is_expired(now)) {
            Some(true) => {
                inner.entries.remove(key);
                inner.stats.record_expiration();
                inner.stats.record_miss();
                inner.stats.size = inner.entries.len();
                debug!(store = %self.name, key, "expired entry removed on lookup");
                None
            }
            Some(false) => {
                let entry = inner
                    .entries
                    .get_mut(key)
                    .expect("entry present under lock");
                entry.touch();
                let value = entry.value().clone();
                inner.stats.record_hit();
                Some(value)
            }
            None => {
                inner.stats.record_miss();
                None
            }
        }
    }

    /// Look up a value, falling back to `default` on a miss.
    pub fn get_or(&self, key: &str, default: V) -> V {
        self.get(key).unwrap_or(default)
    }

    /// Returns true if an unexpired entry exists for `key`.
    ///
    /// Does not update access metadata or hit/miss counters.
    pub fn contains(&self, key: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .get(key)
            .map(|e| !e.is_expired(Instant::now()))
            .unwrap_or(false)
    }

    /// Insert or overwrite a value using the store's default TTL.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.config.default_ttl);
    }

    /// Insert or overwrite a value with an explicit TTL (`None` = never
    /// expires).
    ///
    /// If inserting a *new* key would push the store above its capacity,
    /// exactly one existing entry - chosen by the eviction policy - is
    /// removed first. Overwriting an existing key never evicts.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let key = key.into();
        let mut inner = self.inner.lock().unwrap();

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.config.max_size {
            self.evict_one(&mut inner);
        }

        inner.entries.insert(key, CacheEntry::new(value, ttl));
        inner.stats.size = inner.entries.len();
    }

    /// Remove an entry. Returns true if it existed.
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.entries.remove(key).is_some();
        inner.stats.size = inner.entries.len();
        removed
    }

    /// Remove all entries and reset the counters.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.stats.reset();
        inner.stats.size = 0;
        debug!(store = %self.name, "cache cleared");
    }

    /// Current number of entries (expired-but-unswept entries included).
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Returns true if the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the store's statistics.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        let mut stats = inner.stats.clone();
        stats.size = inner.entries.len();
        stats
    }

    /// Remove every expired entry. Returns how many were removed.
    ///
    /// Invoked by the `CacheManager` sweep timer; callable directly too.
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();

        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            inner.entries.remove(key);
            inner.stats.record_expiration();
        }
        inner.stats.size = inner.entries.len();

        if !expired.is_empty() {
            debug!(store = %self.name, removed = expired.len(), "expiry sweep");
        }
        expired.len()
    }

    /// Evict exactly one entry chosen by the configured policy.
    fn evict_one(&self, inner: &mut StoreInner<V>) {
        let victim = match self.config.eviction_policy {
            EvictionPolicy::Lru => inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed())
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Lfu => inner
                .entries
                .iter()
                .min_by_key(|(_, e)| (e.access_count(), e.last_accessed()))
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Fifo => inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.created_at())
                .map(|(k, _)| k.clone()),
        };

        if let Some(key) = victim {
            inner.entries.remove(&key);
            inner.stats.record_eviction();
            inner.stats.size = inner.entries.len();
            debug!(
                store = %self.name,
                key = %key,
                policy = %self.config.eviction_policy,
                "evicted entry"
            );
        }
    }
}
