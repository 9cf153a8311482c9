//! Bounded priority queue feeding the worker pool.
//!
//! Ordering is by (priority, enqueue sequence): lower priority values are
//! serviced first, and within one priority level requests leave in FIFO
//! order. Capacity is enforced with a semaphore so `submit` can either
//! block for a slot or fail fast, per the configured backpressure mode.
//!
//! A slot is reserved *before* an entry is pushed ([`RequestQueue::reserve`])
//! so that batch coalescing can hold a slot open while its window runs.

use crate::config::BackpressureMode;
use crate::optimizer::error::RequestError;
use crate::optimizer::request::{FetchOperation, RequestId};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// A single queued request awaiting execution.
pub(crate) struct PendingRequest<V> {
    pub id: RequestId,
    pub key: String,
    pub enqueued_at: Instant,
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
    pub operation: Arc<dyn FetchOperation<V>>,
    pub result_tx: oneshot::Sender<Result<V, RequestError>>,
}

/// One member of a coalesced batch.
pub(crate) struct BatchMember<V> {
    pub id: RequestId,
    pub key: String,
    pub enqueued_at: Instant,
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
    pub result_tx: oneshot::Sender<Result<V, RequestError>>,
}

/// A unit of work popped by a worker: either one request or a flushed
/// batch executed as a single underlying call.
pub(crate) enum QueuedWork<V> {
    Single(PendingRequest<V>),
    Batch {
        batch_key: String,
        operation: Arc<dyn FetchOperation<V>>,
        members: Vec<BatchMember<V>>,
    },
}

/// Heap entry; `Ord` is inverted so the `BinaryHeap` max-element is the
/// most urgent (smallest priority, then smallest sequence).
struct QueueEntry<V> {
    priority: u8,
    seq: u64,
    work: QueuedWork<V>,
}

impl<V> PartialEq for QueueEntry<V> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<V> Eq for QueueEntry<V> {}

impl<V> PartialOrd for QueueEntry<V> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<V> Ord for QueueEntry<V> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A reserved queue slot, obtained from [`RequestQueue::reserve`].
///
/// Dropping it unused releases the slot.
pub(crate) struct QueueSlot {
    permit: OwnedSemaphorePermit,
}

/// The shared bounded priority queue.
pub(crate) struct RequestQueue<V> {
    heap: Mutex<BinaryHeap<QueueEntry<V>>>,
    /// Free slots; `reserve` consumes one, `pop` returns it.
    capacity_sem: Arc<Semaphore>,
    /// Queued item count; `pop` waits on this.
    items_sem: Arc<Semaphore>,
    seq: AtomicU64,
}

impl<V> RequestQueue<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            capacity_sem: Arc::new(Semaphore::new(capacity)),
            items_sem: Arc::new(Semaphore::new(0)),
            seq: AtomicU64::new(0),
        }
    }

    /// Reserve a slot according to the backpressure mode.
    ///
    /// Reject mode fails immediately when the queue is full; block mode
    /// waits for space, bounded by `submit_timeout` when set. A closed
    /// queue yields [`RequestError::Shutdown`].
    pub async fn reserve(
        &self,
        mode: BackpressureMode,
        submit_timeout: Option<Duration>,
    ) -> Result<QueueSlot, RequestError> {
        let permit = match mode {
            BackpressureMode::Reject => self
                .capacity_sem
                .clone()
                .try_acquire_owned()
                .map_err(|e| match e {
                    tokio::sync::TryAcquireError::Closed => RequestError::Shutdown,
                    tokio::sync::TryAcquireError::NoPermits => RequestError::CapacityExceeded,
                })?,
            BackpressureMode::Block => match submit_timeout {
                None => self
                    .capacity_sem
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| RequestError::Shutdown)?,
                Some(timeout) => tokio::time::timeout(
                    timeout,
                    self.capacity_sem.clone().acquire_owned(),
                )
                .await
                .map_err(|_| RequestError::CapacityExceeded)?
                .map_err(|_| RequestError::Shutdown)?,
            },
        };
        Ok(QueueSlot { permit })
    }

    /// Push a unit of work into its reserved slot.
    pub fn push(&self, slot: QueueSlot, priority: u8, work: QueuedWork<V>) {
        slot.permit.forget();
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap.lock().unwrap().push(QueueEntry {
            priority,
            seq,
            work,
        });
        self.items_sem.add_permits(1);
    }

    /// Pop the most urgent unit of work, waiting if the queue is empty.
    ///
    /// Returns `None` once the queue has been closed.
    pub async fn pop(&self) -> Option<QueuedWork<V>> {
        let permit = self.items_sem.acquire().await.ok()?;
        // A concurrent close_and_drain may have emptied the heap between
        // the permit grant and this pop.
        let entry = self.heap.lock().unwrap().pop()?;
        permit.forget();
        self.capacity_sem.add_permits(1);
        Some(entry.work)
    }

    /// Close the queue and drain everything still queued.
    ///
    /// Blocked `reserve` calls fail with shutdown, blocked `pop` calls
    /// return `None`, and the drained work is handed back so pending
    /// handles can be resolved.
    pub fn close_and_drain(&self) -> Vec<QueuedWork<V>> {
        self.capacity_sem.close();
        self.items_sem.close();
        let mut heap = self.heap.lock().unwrap();
        let mut drained = Vec::with_capacity(heap.len());
        while let Some(entry) = heap.pop() {
            drained.push(entry.work);
        }
        drained
    }

    /// Number of queued units of work.
    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::error::FetchError;
    use futures::future::BoxFuture;

    struct NoopOperation;

    impl FetchOperation<i32> for NoopOperation {
        fn fetch<'a>(
            &'a self,
            keys: &'a [String],
        ) -> BoxFuture<'a, Result<Vec<(String, i32)>, FetchError>> {
            Box::pin(async move { Ok(keys.iter().map(|k| (k.clone(), 0)).collect()) })
        }
    }

    fn single(key: &str) -> QueuedWork<i32> {
        let (tx, _rx) = oneshot::channel();
        QueuedWork::Single(PendingRequest {
            id: RequestId::new(),
            key: key.to_string(),
            enqueued_at: Instant::now(),
            deadline: None,
            cancel: CancellationToken::new(),
            operation: Arc::new(NoopOperation),
            result_tx: tx,
        })
    }

    fn key_of(work: &QueuedWork<i32>) -> String {
        match work {
            QueuedWork::Single(req) => req.key.clone(),
            QueuedWork::Batch { batch_key, .. } => batch_key.clone(),
        }
    }

    async fn push_now(queue: &RequestQueue<i32>, priority: u8, key: &str) {
        let slot = queue
            .reserve(BackpressureMode::Reject, None)
            .await
            .expect("slot available");
        queue.push(slot, priority, single(key));
    }

    #[tokio::test]
    async fn test_pop_orders_by_priority() {
        let queue: RequestQueue<i32> = RequestQueue::new(10);
        push_now(&queue, 5, "low").await;
        push_now(&queue, 0, "urgent").await;
        push_now(&queue, 3, "mid").await;

        assert_eq!(key_of(&queue.pop().await.unwrap()), "urgent");
        assert_eq!(key_of(&queue.pop().await.unwrap()), "mid");
        assert_eq!(key_of(&queue.pop().await.unwrap()), "low");
    }

    #[tokio::test]
    async fn test_fifo_within_priority_level() {
        let queue: RequestQueue<i32> = RequestQueue::new(10);
        push_now(&queue, 1, "first").await;
        push_now(&queue, 1, "second").await;
        push_now(&queue, 1, "third").await;

        assert_eq!(key_of(&queue.pop().await.unwrap()), "first");
        assert_eq!(key_of(&queue.pop().await.unwrap()), "second");
        assert_eq!(key_of(&queue.pop().await.unwrap()), "third");
    }

    #[tokio::test]
    async fn test_reject_mode_fails_when_full() {
        let queue: RequestQueue<i32> = RequestQueue::new(1);
        push_now(&queue, 0, "only").await;

        let result = queue.reserve(BackpressureMode::Reject, None).await;
        assert!(matches!(result, Err(RequestError::CapacityExceeded)));
    }

    #[tokio::test]
    async fn test_block_mode_times_out() {
        let queue: RequestQueue<i32> = RequestQueue::new(1);
        push_now(&queue, 0, "only").await;

        let result = queue
            .reserve(
                BackpressureMode::Block,
                Some(Duration::from_millis(20)),
            )
            .await;
        assert!(matches!(result, Err(RequestError::CapacityExceeded)));
    }

    #[tokio::test]
    async fn test_block_mode_unblocks_after_pop() {
        let queue: Arc<RequestQueue<i32>> = Arc::new(RequestQueue::new(1));
        push_now(&queue, 0, "first").await;

        let blocked = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let slot = queue
                    .reserve(BackpressureMode::Block, Some(Duration::from_secs(5)))
                    .await
                    .expect("slot frees after pop");
                queue.push(slot, 0, single("second"));
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(key_of(&queue.pop().await.unwrap()), "first");

        blocked.await.unwrap();
        assert_eq!(key_of(&queue.pop().await.unwrap()), "second");
    }

    #[tokio::test]
    async fn test_dropping_unused_slot_frees_capacity() {
        let queue: RequestQueue<i32> = RequestQueue::new(1);
        let slot = queue.reserve(BackpressureMode::Reject, None).await.unwrap();
        drop(slot);

        assert!(queue.reserve(BackpressureMode::Reject, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue: Arc<RequestQueue<i32>> = Arc::new(RequestQueue::new(4));

        let popper = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { key_of(&queue.pop().await.unwrap()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        push_now(&queue, 0, "late").await;

        assert_eq!(popper.await.unwrap(), "late");
    }

    #[tokio::test]
    async fn test_close_and_drain() {
        let queue: RequestQueue<i32> = RequestQueue::new(4);
        push_now(&queue, 0, "a").await;
        push_now(&queue, 1, "b").await;

        let drained = queue.close_and_drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(queue.len(), 0);

        assert!(queue.pop().await.is_none());
        assert!(matches!(
            queue.reserve(BackpressureMode::Reject, None).await,
            Err(RequestError::Shutdown)
        ));
    }

}
