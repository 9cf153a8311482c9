//! Connection factory trait.
//!
//! The backing resource (database handle, API session, socket) is an
//! external collaborator; the pool only needs to know how to create one
//! and how to probe it for liveness.

use futures::future::BoxFuture;
use thiserror::Error;

/// Failure to establish a connection.
#[derive(Debug, Clone, Error)]
#[error("connection failed: {message}")]
pub struct ConnectError {
    /// Human-readable failure description.
    pub message: String,
}

impl ConnectError {
    /// Create a connect error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Creates and validates connections for a [`ConnectionPool`].
///
/// `is_valid` should be a cheap probe (the classic `SELECT 1`); the pool
/// runs it before handing out a previously idle connection and discards
/// connections that fail it.
///
/// [`ConnectionPool`]: crate::pool::ConnectionPool
pub trait ConnectionManager: Send + Sync + 'static {
    /// The connection type managed by this factory.
    type Connection: Send + 'static;

    /// Establish a new connection.
    fn connect(&self) -> BoxFuture<'_, Result<Self::Connection, ConnectError>>;

    /// Probe a connection for liveness.
    fn is_valid<'a>(&'a self, conn: &'a mut Self::Connection) -> BoxFuture<'a, bool>;
}
