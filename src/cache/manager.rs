//! Registry of named cache stores and the shared expiry sweep.
//!
//! The manager owns a single background task that periodically invokes
//! every registered store's expiry sweep. The task is started explicitly
//! (it needs a Tokio runtime), respects a cancellation token, and is
//! joined by `shutdown()` for clean teardown.

use crate::cache::store::CacheStore;
use crate::config::{CacheConfig, ConfigError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Process-wide registry of named [`CacheStore`] instances.
///
/// Stores are created at most once per name: `create_cache` is idempotent
/// and returns the existing store when the name is already registered.
pub struct CacheManager<V> {
    stores: Mutex<HashMap<String, Arc<CacheStore<V>>>>,
    sweep_interval: Duration,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<V: Clone + Send + Sync + 'static> CacheManager<V> {
    /// Create a new manager.
    ///
    /// The sweeper is not running yet; call [`start_sweeper`] from within
    /// a Tokio runtime.
    ///
    /// [`start_sweeper`]: CacheManager::start_sweeper
    pub fn new(sweep_interval: Duration) -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
            sweep_interval,
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// Create a named store, or return the existing one.
    ///
    /// A second call with the same name ignores `config` and hands back
    /// the already-registered store.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if `config` is invalid.
    pub fn create_cache(
        &self,
        name: impl Into<String>,
        config: CacheConfig,
    ) -> Result<Arc<CacheStore<V>>, ConfigError> {
        config.validate()?;
        let name = name.into();
        let mut stores = self.stores.lock().unwrap();

        if let Some(existing) = stores.get(&name) {
            debug!(cache = %name, "cache already exists, returning existing store");
            return Ok(Arc::clone(existing));
        }

        let store = Arc::new(CacheStore::new(name.clone(), config));
        stores.insert(name.clone(), Arc::clone(&store));
        info!(cache = %name, max_size = store.max_size(), "cache created");
        Ok(store)
    }

    /// Look up a store by name.
    pub fn get_cache(&self, name: &str) -> Option<Arc<CacheStore<V>>> {
        self.stores.lock().unwrap().get(name).cloned()
    }

    /// Names of all registered stores.
    pub fn list_caches(&self) -> Vec<String> {
        self.stores.lock().unwrap().keys().cloned().collect()
    }

    /// Remove a store from the registry. Returns true if it existed.
    ///
    /// Existing `Arc` handles to the store stay valid; it simply stops
    /// being swept and discoverable.
    pub fn remove_cache(&self, name: &str) -> bool {
        let removed = self.stores.lock().unwrap().remove(name).is_some();
        if removed {
            info!(cache = %name, "cache removed from registry");
        }
        removed
    }

    /// Run one expiry sweep over every registered store.
    ///
    /// Returns the total number of entries removed.
    pub fn sweep_all(&self) -> usize {
        let stores: Vec<Arc<CacheStore<V>>> =
            self.stores.lock().unwrap().values().cloned().collect();

        stores.iter().map(|store| store.purge_expired()).sum()
    }

    /// Start the background sweep task.
    ///
    /// Idempotent: a second call while the task is alive does nothing.
    /// Must be called from within a Tokio runtime.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock().unwrap();
        if sweeper.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        let manager = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let interval = self.sweep_interval;

        *sweeper = Some(tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "expiry sweeper started");
            let mut ticker = tokio::time::interval(interval);
            // Skip the immediate first tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => {
                        debug!("expiry sweeper shutting down");
                        break;
                    }

                    _ = ticker.tick() => {
                        let removed = manager.sweep_all();
                        if removed > 0 {
                            debug!(removed, "expiry sweep removed entries");
                        }
                    }
                }
            }
        }));
    }

    /// Returns true if the sweep task is currently running.
    pub fn sweeper_running(&self) -> bool {
        self.sweeper
            .lock()
            .unwrap()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Stop the sweep task and wait for it to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.sweeper.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("expiry sweeper task panicked: {e}");
            }
        }
    }
}

impl<V> Drop for CacheManager<V> {
    fn drop(&mut self) {
        // Best effort: the task observes the token at its next tick.
        self.shutdown.cancel();
    }
}
