//! Eviction policies for full cache stores.

use crate::config::ConfigError;

/// Strategy for choosing which entry to evict when a store is full.
///
/// Ties are broken by the oldest timestamp: two LFU candidates with the
/// same access count are decided by the older `last_accessed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Evict the least recently used entry (smallest `last_accessed`).
    #[default]
    Lru,
    /// Evict the least frequently used entry (smallest `access_count`,
    /// ties broken by oldest `last_accessed`).
    Lfu,
    /// Evict the oldest entry (smallest `created_at`).
    Fifo,
}

impl std::str::FromStr for EvictionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(Self::Lru),
            "lfu" => Ok(Self::Lfu),
            "fifo" => Ok(Self::Fifo),
            other => Err(ConfigError::new(
                "cache.eviction_policy",
                format!("unknown policy '{other}' (expected 'lru', 'lfu' or 'fifo')"),
            )),
        }
    }
}

impl std::fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lru => write!(f, "lru"),
            Self::Lfu => write!(f, "lfu"),
            Self::Fifo => write!(f, "fifo"),
        }
    }
}
