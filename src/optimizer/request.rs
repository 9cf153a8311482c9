//! Request model for the optimizer.
//!
//! A request asks for one key to be fetched through a caller-supplied
//! operation. Requests carry a priority (lower value serviced first), an
//! optional batch key for coalescing, and an optional deadline. Submitting
//! one yields a [`RequestHandle`] that eventually resolves to the fetched
//! value or a typed failure.

use crate::optimizer::error::{FetchError, RequestError};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Global counter for generating unique request IDs.
static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Priority of foreground, caller-facing requests.
pub const PRIORITY_ON_DEMAND: u8 = 0;

/// Priority for background work that should yield to foreground traffic.
pub const PRIORITY_BACKGROUND: u8 = 100;

/// Highest priority value a foreground submission may use.
///
/// [`FetchRequest::with_priority`] clamps to this, which keeps prefetch
/// traffic strictly less urgent than anything submitted by callers.
pub const MAX_FOREGROUND_PRIORITY: u8 = 254;

/// Priority used by the prefetcher. Lower values are serviced first, so
/// prefetch requests never starve foreground ones.
pub const PRIORITY_PREFETCH: u8 = 255;

/// Unique identifier for a submitted request.
///
/// IDs are monotonically increasing and unique within a process lifetime;
/// they are used for cancellation and log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    /// Creates a new unique request ID.
    pub fn new() -> Self {
        Self(REQUEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric value of this ID.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// A caller-supplied fetch operation.
///
/// The optimizer is protocol-agnostic: implementations typically acquire
/// a pooled connection and hit a database or remote API. The operation
/// receives every key of a coalesced batch at once (a lone request is a
/// one-element slice) and returns per-key results; a key absent from the
/// returned vector fails that key's request.
pub trait FetchOperation<V>: Send + Sync {
    /// Fetch values for the given keys.
    fn fetch<'a>(&'a self, keys: &'a [String])
        -> BoxFuture<'a, Result<Vec<(String, V)>, FetchError>>;
}

/// A request ready for submission, built with the builder methods.
///
/// # Example
///
/// ```ignore
/// let request = FetchRequest::new("quote:AAPL", operation)
///     .with_priority(PRIORITY_ON_DEMAND)
///     .with_batch_key("quotes")
///     .with_deadline(Duration::from_secs(5));
/// let handle = optimizer.submit(request).await?;
/// let value = handle.wait().await?;
/// ```
pub struct FetchRequest<V> {
    pub(crate) key: String,
    pub(crate) priority: u8,
    pub(crate) batch_key: Option<String>,
    pub(crate) deadline: Option<Duration>,
    pub(crate) operation: Arc<dyn FetchOperation<V>>,
}

impl<V> FetchRequest<V> {
    /// Create a request for `key` at on-demand priority.
    pub fn new(key: impl Into<String>, operation: Arc<dyn FetchOperation<V>>) -> Self {
        Self {
            key: key.into(),
            priority: PRIORITY_ON_DEMAND,
            batch_key: None,
            deadline: None,
            operation,
        }
    }

    /// Set the priority (lower value serviced first).
    ///
    /// Clamped to [`MAX_FOREGROUND_PRIORITY`]; only the prefetcher runs
    /// below foreground urgency.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(MAX_FOREGROUND_PRIORITY);
        self
    }

    /// Set the batch key. Requests sharing a batch key that arrive within
    /// the batching window are coalesced into one underlying call.
    pub fn with_batch_key(mut self, batch_key: impl Into<String>) -> Self {
        self.batch_key = Some(batch_key.into());
        self
    }

    /// Set a deadline relative to submission. Checked before each attempt;
    /// once exceeded the request fails without further retries.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// The key this request fetches.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The effective priority.
    pub fn priority(&self) -> u8 {
        self.priority
    }
}

impl<V> std::fmt::Debug for FetchRequest<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchRequest")
            .field("key", &self.key)
            .field("priority", &self.priority)
            .field("batch_key", &self.batch_key)
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Handle to a submitted request.
///
/// Resolves exactly once, to the fetched value or a [`RequestError`].
pub struct RequestHandle<V> {
    id: RequestId,
    rx: oneshot::Receiver<Result<V, RequestError>>,
}

impl<V> RequestHandle<V> {
    pub(crate) fn new(id: RequestId, rx: oneshot::Receiver<Result<V, RequestError>>) -> Self {
        Self { id, rx }
    }

    /// The submitted request's ID, usable with `cancel`.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the request to resolve.
    ///
    /// If the optimizer is torn down before the request completes, this
    /// resolves to [`RequestError::Shutdown`].
    pub async fn wait(self) -> Result<V, RequestError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(RequestError::Shutdown),
        }
    }
}

impl<V> std::fmt::Debug for RequestHandle<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle").field("id", &self.id).finish()
    }
}
