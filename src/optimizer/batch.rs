//! Request coalescing by batch key.
//!
//! Requests sharing a batch key that arrive within the batching window are
//! gathered into a single unit of work and executed as one underlying
//! call, with per-key results distributed back to every member.
//!
//! The first request for a key opens the batch and donates its reserved
//! queue slot, so a flushed batch occupies exactly one slot regardless of
//! how many requests joined. A batch flushes when the window elapses or
//! when it reaches the configured size, whichever comes first.

use crate::optimizer::queue::{BatchMember, QueueSlot, QueuedWork, RequestQueue};
use crate::optimizer::request::FetchOperation;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace};

/// Outcome of trying to join an already-open batch.
pub(crate) enum TryJoin<V> {
    /// Joined; the batch keeps gathering.
    Joined,
    /// Joining filled the batch; it was flushed to the queue.
    FlushedFull,
    /// No open batch for this key; the member is handed back so the
    /// caller can reserve a slot and open one.
    NotOpen(BatchMember<V>),
}

/// Outcome of opening a batch.
pub(crate) enum OpenOutcome {
    /// A new batch was opened; the caller must arm the window timer for
    /// this generation.
    Opened { generation: u64 },
    /// Another submitter opened the batch first; this member joined it
    /// and the redundant slot was released.
    JoinedExisting,
    /// The join filled the batch and it was flushed.
    FlushedFull,
}

struct OpenBatch<V> {
    generation: u64,
    /// Most urgent member priority; the flushed batch is queued at this.
    priority: u8,
    operation: Arc<dyn FetchOperation<V>>,
    members: Vec<BatchMember<V>>,
    /// Queue slot reserved by the opening member, spent at flush.
    slot: QueueSlot,
}

/// Gathers same-key requests into batches and flushes them to the queue.
pub(crate) struct BatchGatherer<V> {
    queue: Arc<RequestQueue<V>>,
    open: Mutex<HashMap<String, OpenBatch<V>>>,
    batch_size: usize,
    window: Duration,
    generation: AtomicU64,
}

impl<V> BatchGatherer<V> {
    pub fn new(queue: Arc<RequestQueue<V>>, batch_size: usize, window: Duration) -> Self {
        Self {
            queue,
            open: Mutex::new(HashMap::new()),
            batch_size,
            window,
            generation: AtomicU64::new(0),
        }
    }

    /// The batching window; the optimizer arms a timer of this length for
    /// every opened batch.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Try to join an open batch for `batch_key`.
    pub fn try_join(&self, batch_key: &str, priority: u8, member: BatchMember<V>) -> TryJoin<V> {
        let mut open = self.open.lock().unwrap();
        let Some(batch) = open.get_mut(batch_key) else {
            return TryJoin::NotOpen(member);
        };

        batch.members.push(member);
        batch.priority = batch.priority.min(priority);
        trace!(batch_key, size = batch.members.len(), "joined open batch");

        if batch.members.len() >= self.batch_size {
            let batch = open.remove(batch_key).expect("batch present under lock");
            drop(open);
            self.flush(batch_key, batch);
            TryJoin::FlushedFull
        } else {
            TryJoin::Joined
        }
    }

    /// Open a batch with its first member and a reserved queue slot.
    ///
    /// If another submitter raced us and opened one in the meantime, the
    /// member joins that batch instead and `slot` is dropped (releasing
    /// the reserved capacity).
    pub fn open(
        &self,
        batch_key: String,
        priority: u8,
        operation: Arc<dyn FetchOperation<V>>,
        member: BatchMember<V>,
        slot: QueueSlot,
    ) -> OpenOutcome {
        let mut open = self.open.lock().unwrap();

        if open.contains_key(&batch_key) {
            drop(open);
            match self.try_join(&batch_key, priority, member) {
                TryJoin::Joined => return OpenOutcome::JoinedExisting,
                TryJoin::FlushedFull => return OpenOutcome::FlushedFull,
                TryJoin::NotOpen(member) => {
                    // The racing batch flushed between our check and the
                    // join; open a fresh one with our slot.
                    return self.open(batch_key, priority, operation, member, slot);
                }
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        open.insert(
            batch_key.clone(),
            OpenBatch {
                generation,
                priority,
                operation,
                members: vec![member],
                slot,
            },
        );
        debug!(batch_key = %batch_key, generation, "opened batch");
        OpenOutcome::Opened { generation }
    }

    /// Flush the batch for `batch_key` if it is still the one opened as
    /// `generation`. Called by the window timer; a batch already flushed
    /// for being full (or superseded by a newer one) is left alone.
    pub fn flush_window(&self, batch_key: &str, generation: u64) {
        let batch = {
            let mut open = self.open.lock().unwrap();
            match open.get(batch_key) {
                Some(b) if b.generation == generation => open.remove(batch_key),
                _ => None,
            }
        };
        if let Some(batch) = batch {
            self.flush(batch_key, batch);
        }
    }

    /// Number of currently open (gathering) batches.
    pub fn open_count(&self) -> usize {
        self.open.lock().unwrap().len()
    }

    /// Drain every open batch without executing it, for shutdown.
    pub fn drain(&self) -> Vec<BatchMember<V>> {
        let mut open = self.open.lock().unwrap();
        open.drain()
            .flat_map(|(_, batch)| batch.members)
            .collect()
    }

    fn flush(&self, batch_key: &str, batch: OpenBatch<V>) {
        debug!(
            batch_key,
            members = batch.members.len(),
            priority = batch.priority,
            "flushing batch to queue"
        );
        self.queue.push(
            batch.slot,
            batch.priority,
            QueuedWork::Batch {
                batch_key: batch_key.to_string(),
                operation: batch.operation,
                members: batch.members,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackpressureMode;
    use crate::optimizer::error::FetchError;
    use crate::optimizer::request::RequestId;
    use futures::future::BoxFuture;
    use std::time::Instant;
    use tokio::sync::oneshot;
    use tokio_util::sync::CancellationToken;

    struct NoopOperation;

    impl FetchOperation<i32> for NoopOperation {
        fn fetch<'a>(
            &'a self,
            keys: &'a [String],
        ) -> BoxFuture<'a, Result<Vec<(String, i32)>, FetchError>> {
            Box::pin(async move { Ok(keys.iter().map(|k| (k.clone(), 0)).collect()) })
        }
    }

    fn member(key: &str) -> BatchMember<i32> {
        let (tx, _rx) = oneshot::channel();
        BatchMember {
            id: RequestId::new(),
            key: key.to_string(),
            enqueued_at: Instant::now(),
            deadline: None,
            cancel: CancellationToken::new(),
            result_tx: tx,
        }
    }

    fn gatherer(
        capacity: usize,
        batch_size: usize,
    ) -> (Arc<RequestQueue<i32>>, BatchGatherer<i32>) {
        let queue = Arc::new(RequestQueue::new(capacity));
        let gatherer = BatchGatherer::new(Arc::clone(&queue), batch_size, Duration::from_millis(50));
        (queue, gatherer)
    }

    async fn slot(queue: &Arc<RequestQueue<i32>>) -> QueueSlot {
        queue
            .reserve(BackpressureMode::Reject, None)
            .await
            .expect("slot")
    }

    #[tokio::test]
    async fn test_join_without_open_batch_returns_member() {
        let (_queue, gatherer) = gatherer(4, 3);
        match gatherer.try_join("b", 0, member("k1")) {
            TryJoin::NotOpen(m) => assert_eq!(m.key, "k1"),
            _ => panic!("expected NotOpen"),
        }
    }

    #[tokio::test]
    async fn test_open_then_join() {
        let (queue, gatherer) = gatherer(4, 3);
        let outcome = gatherer.open(
            "b".into(),
            5,
            Arc::new(NoopOperation),
            member("k1"),
            slot(&queue).await,
        );
        assert!(matches!(outcome, OpenOutcome::Opened { .. }));
        assert_eq!(gatherer.open_count(), 1);

        assert!(matches!(gatherer.try_join("b", 5, member("k2")), TryJoin::Joined));
        assert_eq!(queue.len(), 0, "batch still gathering");
    }

    #[tokio::test]
    async fn test_full_batch_flushes_immediately() {
        let (queue, gatherer) = gatherer(4, 2);
        gatherer.open(
            "b".into(),
            5,
            Arc::new(NoopOperation),
            member("k1"),
            slot(&queue).await,
        );

        assert!(matches!(
            gatherer.try_join("b", 3, member("k2")),
            TryJoin::FlushedFull
        ));
        assert_eq!(gatherer.open_count(), 0);
        assert_eq!(queue.len(), 1);

        match queue.pop().await.unwrap() {
            QueuedWork::Batch {
                batch_key, members, ..
            } => {
                assert_eq!(batch_key, "b");
                assert_eq!(members.len(), 2);
            }
            _ => panic!("expected batch work"),
        }
    }

    #[tokio::test]
    async fn test_window_flush_by_generation() {
        let (queue, gatherer) = gatherer(4, 10);
        let generation = match gatherer.open(
            "b".into(),
            2,
            Arc::new(NoopOperation),
            member("k1"),
            slot(&queue).await,
        ) {
            OpenOutcome::Opened { generation } => generation,
            _ => panic!("expected Opened"),
        };

        gatherer.flush_window("b", generation);
        assert_eq!(gatherer.open_count(), 0);
        assert_eq!(queue.len(), 1);

        // A stale timer firing again is a no-op
        gatherer.flush_window("b", generation);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_generation_does_not_flush_new_batch() {
        let (queue, gatherer) = gatherer(4, 10);
        let first_gen = match gatherer.open(
            "b".into(),
            2,
            Arc::new(NoopOperation),
            member("k1"),
            slot(&queue).await,
        ) {
            OpenOutcome::Opened { generation } => generation,
            _ => panic!("expected Opened"),
        };
        gatherer.flush_window("b", first_gen);

        // Re-open under the same key; the old timer generation must not
        // flush the new batch.
        gatherer.open(
            "b".into(),
            2,
            Arc::new(NoopOperation),
            member("k2"),
            slot(&queue).await,
        );
        gatherer.flush_window("b", first_gen);
        assert_eq!(gatherer.open_count(), 1);
    }

    #[tokio::test]
    async fn test_batch_priority_is_most_urgent_member() {
        let (queue, gatherer) = gatherer(4, 10);
        let generation = match gatherer.open(
            "b".into(),
            9,
            Arc::new(NoopOperation),
            member("k1"),
            slot(&queue).await,
        ) {
            OpenOutcome::Opened { generation } => generation,
            _ => panic!("expected Opened"),
        };
        gatherer.try_join("b", 2, member("k2"));

        // Push a priority-5 single; the flushed batch (priority 2) must
        // come out first.
        let s = slot(&queue).await;
        let (tx, _rx) = oneshot::channel();
        queue.push(
            s,
            5,
            QueuedWork::Single(crate::optimizer::queue::PendingRequest {
                id: RequestId::new(),
                key: "single".into(),
                enqueued_at: Instant::now(),
                deadline: None,
                cancel: CancellationToken::new(),
                operation: Arc::new(NoopOperation),
                result_tx: tx,
            }),
        );
        gatherer.flush_window("b", generation);

        match queue.pop().await.unwrap() {
            QueuedWork::Batch { batch_key, .. } => assert_eq!(batch_key, "b"),
            _ => panic!("batch should outrank the single request"),
        }
    }

    #[tokio::test]
    async fn test_drain_returns_open_members() {
        let (queue, gatherer) = gatherer(4, 10);
        gatherer.open(
            "b".into(),
            1,
            Arc::new(NoopOperation),
            member("k1"),
            slot(&queue).await,
        );
        gatherer.try_join("b", 1, member("k2"));

        let members = gatherer.drain();
        assert_eq!(members.len(), 2);
        assert_eq!(gatherer.open_count(), 0);
    }
}
