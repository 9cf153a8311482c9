//! Pooled, validated leases over expensive external connections.
//!
//! The pool hands out exclusive [`PooledConnection`] leases bounded by a
//! semaphore, validates idle connections with a cheap liveness probe
//! before reuse (replacing dead ones transparently), and returns every
//! lease to the idle set on drop - including error paths.

mod manager;
#[allow(clippy::module_inception)]
mod pool;

pub use manager::{ConnectError, ConnectionManager};
pub use pool::{ConnectionPool, PoolError, PoolStatsSnapshot, PooledConnection};
