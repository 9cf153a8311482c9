//! Bounded connection pool with scoped leases.

use crate::config::{ConfigError, PoolConfig};
use crate::pool::manager::ConnectionManager;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Errors surfaced by [`ConnectionPool::acquire`].
///
/// A failed liveness probe is not among them: invalid idle connections
/// are discarded and replaced transparently.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// Every connection stayed leased past the acquire timeout.
    #[error("timed out after {0:?} waiting for a connection")]
    AcquireTimeout(Duration),

    /// The pool has been closed.
    #[error("connection pool is closed")]
    Closed,

    /// Establishing a fresh connection failed.
    #[error("failed to establish connection: {0}")]
    Connect(String),
}

/// Bounded pool of reusable connections.
///
/// At most `max_connections` connections exist at once, leased or idle; a
/// permit is required per lease, so `leased <= max_connections` always
/// holds and a connection is never leased to two operations concurrently
/// (the lease owns it).
pub struct ConnectionPool<M: ConnectionManager> {
    inner: Arc<PoolInner<M>>,
    config: PoolConfig,
}

struct PoolInner<M: ConnectionManager> {
    manager: M,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<M::Connection>>,
    stats: PoolStats,
}

#[derive(Debug, Default)]
struct PoolStats {
    created: AtomicU64,
    discarded: AtomicU64,
    validation_failures: AtomicU64,
    timeouts: AtomicU64,
    leased: AtomicUsize,
}

/// Point-in-time view of pool activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    /// Connections established over the pool's lifetime.
    pub created: u64,
    /// Connections dropped (failed probe, invalidated, or closed).
    pub discarded: u64,
    /// Idle connections that failed the liveness probe.
    pub validation_failures: u64,
    /// Acquire calls that timed out.
    pub timeouts: u64,
    /// Currently leased connections.
    pub leased: usize,
    /// Currently idle connections.
    pub idle: usize,
    /// Configured maximum.
    pub max_connections: usize,
}

impl<M: ConnectionManager> ConnectionPool<M> {
    /// Create a pool over the given connection manager.
    ///
    /// Connections are established lazily on first acquire.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the configuration is invalid.
    pub fn new(manager: M, config: PoolConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        info!(
            max_connections = config.max_connections,
            acquire_timeout_ms = config.acquire_timeout.as_millis() as u64,
            "connection pool created"
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                manager,
                permits: Arc::new(Semaphore::new(config.max_connections)),
                idle: Mutex::new(Vec::new()),
                stats: PoolStats::default(),
            }),
            config,
        })
    }

    /// Acquire a validated connection, waiting up to the configured
    /// acquire timeout when the pool is exhausted.
    pub async fn acquire(&self) -> Result<PooledConnection<M>, PoolError> {
        self.acquire_timeout(self.config.acquire_timeout).await
    }

    /// Acquire a validated connection with an explicit timeout.
    ///
    /// Idle connections are probed before reuse; one that fails the probe
    /// is discarded and a fresh connection is established in its place.
    /// The lease returns the connection to the idle set when dropped, on
    /// every exit path, unless it was marked invalid.
    pub async fn acquire_timeout(
        &self,
        timeout: Duration,
    ) -> Result<PooledConnection<M>, PoolError> {
        let permit =
            match tokio::time::timeout(timeout, self.inner.permits.clone().acquire_owned()).await {
                Err(_) => {
                    self.inner.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    warn!(?timeout, "connection acquire timed out");
                    return Err(PoolError::AcquireTimeout(timeout));
                }
                Ok(Err(_)) => return Err(PoolError::Closed),
                Ok(Ok(permit)) => permit,
            };

        // Reuse an idle connection if a live one is available.
        loop {
            let candidate = self.inner.idle.lock().unwrap().pop();
            let Some(mut conn) = candidate else { break };

            if self.inner.manager.is_valid(&mut conn).await {
                return Ok(self.lease(conn, permit));
            }
            self.inner
                .stats
                .validation_failures
                .fetch_add(1, Ordering::Relaxed);
            self.inner.stats.discarded.fetch_add(1, Ordering::Relaxed);
            debug!("idle connection failed liveness probe, discarded");
        }

        // Nothing idle: establish a fresh connection under the permit.
        match self.inner.manager.connect().await {
            Ok(conn) => {
                self.inner.stats.created.fetch_add(1, Ordering::Relaxed);
                Ok(self.lease(conn, permit))
            }
            Err(e) => Err(PoolError::Connect(e.message)),
        }
    }

    fn lease(&self, conn: M::Connection, permit: OwnedSemaphorePermit) -> PooledConnection<M> {
        self.inner.stats.leased.fetch_add(1, Ordering::Relaxed);
        PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
            invalid: false,
        }
    }

    /// Number of currently leased connections.
    pub fn leased(&self) -> usize {
        self.inner.stats.leased.load(Ordering::Relaxed)
    }

    /// Number of currently idle connections.
    pub fn idle(&self) -> usize {
        self.inner.idle.lock().unwrap().len()
    }

    /// Configured connection limit.
    pub fn max_connections(&self) -> usize {
        self.config.max_connections
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            created: self.inner.stats.created.load(Ordering::Relaxed),
            discarded: self.inner.stats.discarded.load(Ordering::Relaxed),
            validation_failures: self.inner.stats.validation_failures.load(Ordering::Relaxed),
            timeouts: self.inner.stats.timeouts.load(Ordering::Relaxed),
            leased: self.leased(),
            idle: self.idle(),
            max_connections: self.config.max_connections,
        }
    }

    /// Close the pool: drop idle connections and fail pending and future
    /// acquires with [`PoolError::Closed`]. Leased connections are
    /// discarded as they are released.
    pub fn close(&self) {
        self.inner.permits.close();
        let drained: Vec<M::Connection> = self.inner.idle.lock().unwrap().drain(..).collect();
        self.inner
            .stats
            .discarded
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        info!(dropped_idle = drained.len(), "connection pool closed");
    }

    /// Returns true if the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }
}

/// An exclusive, scoped lease on a pooled connection.
///
/// Dereferences to the underlying connection. On drop the connection goes
/// back to the idle set - or is discarded if [`invalidate`] was called or
/// the pool has closed - and the capacity permit is released.
///
/// [`invalidate`]: PooledConnection::invalidate
pub struct PooledConnection<M: ConnectionManager> {
    conn: Option<M::Connection>,
    pool: Arc<PoolInner<M>>,
    _permit: OwnedSemaphorePermit,
    invalid: bool,
}

impl<M: ConnectionManager> PooledConnection<M> {
    /// Mark the connection as broken; it is discarded instead of being
    /// returned to the pool.
    pub fn invalidate(&mut self) {
        self.invalid = true;
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection taken before drop")
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection taken before drop")
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        self.pool.stats.leased.fetch_sub(1, Ordering::Relaxed);
        let Some(conn) = self.conn.take() else { return };

        if self.invalid || self.pool.permits.is_closed() {
            self.pool.stats.discarded.fetch_add(1, Ordering::Relaxed);
            debug!("connection discarded on release");
        } else {
            self.pool.idle.lock().unwrap().push(conn);
        }
        // The permit drops after this, freeing the slot.
    }
}
