//! Worker loop: pop, execute with retry, cache, resolve.
//!
//! A fixed pool of these loops consumes the shared priority queue, so at
//! most `max_workers` units of work execute concurrently. Each worker
//! first tries to serve a request straight from the cache (a prefetch or
//! a concurrent fetch may have landed since submission), then runs the
//! caller-supplied operation with exponential backoff on transient
//! failures. Successful values are written to the cache before the
//! caller's handle resolves; failed requests never touch the cache.

use crate::cache::CacheStore;
use crate::optimizer::error::RequestError;
use crate::optimizer::queue::{BatchMember, PendingRequest, QueuedWork, RequestQueue};
use crate::optimizer::request::{FetchOperation, RequestId};
use crate::optimizer::stats::OptimizerStats;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Shared state every worker operates on.
pub(crate) struct WorkerContext<V> {
    pub queue: Arc<RequestQueue<V>>,
    pub cache: Option<Arc<CacheStore<V>>>,
    pub stats: Arc<OptimizerStats>,
    /// Cancellation tokens of requests that are queued or executing.
    pub registry: Arc<DashMap<RequestId, CancellationToken>>,
    pub max_retries: u32,
    pub backoff_base: Duration,
}

/// Main loop for one worker task.
///
/// Exits when the shutdown token fires or the queue closes. Work already
/// popped runs to completion; shutdown is only observed between units.
pub(crate) async fn worker_loop<V: Clone + Send + Sync + 'static>(
    ctx: Arc<WorkerContext<V>>,
    worker_id: usize,
    shutdown: CancellationToken,
) {
    debug!(worker_id, "optimizer worker started");
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            work = ctx.queue.pop() => match work {
                Some(work) => process(&ctx, work).await,
                None => break,
            }
        }
    }
    debug!(worker_id, "optimizer worker stopped");
}

async fn process<V: Clone + Send + Sync + 'static>(ctx: &WorkerContext<V>, work: QueuedWork<V>) {
    match work {
        QueuedWork::Single(request) => process_single(ctx, request).await,
        QueuedWork::Batch {
            batch_key,
            operation,
            members,
        } => process_batch(ctx, &batch_key, operation, members).await,
    }
}

async fn process_single<V: Clone + Send + Sync + 'static>(
    ctx: &WorkerContext<V>,
    request: PendingRequest<V>,
) {
    let PendingRequest {
        id,
        key,
        enqueued_at,
        deadline,
        cancel,
        operation,
        result_tx,
    } = request;

    if cancel.is_cancelled() {
        ctx.stats.record_cancelled();
        ctx.registry.remove(&id);
        let _ = result_tx.send(Err(RequestError::Cancelled));
        return;
    }

    // The value may have arrived since submission (prefetch, concurrent
    // fetch); serve it without touching the operation.
    if let Some(cache) = &ctx.cache {
        if let Some(value) = cache.get(&key) {
            trace!(%id, key = %key, "request served from cache");
            ctx.stats.record_cache_hit_served();
            ctx.stats.record_succeeded(enqueued_at.elapsed());
            ctx.registry.remove(&id);
            let _ = result_tx.send(Ok(value));
            return;
        }
    }

    let keys = [key.clone()];
    let outcome = execute_with_retry(ctx, operation.as_ref(), &keys, deadline, &cancel).await;
    ctx.registry.remove(&id);

    match outcome {
        Ok((values, attempts)) => {
            let mut fetched = store_results(ctx, values);
            match fetched.remove(&key) {
                Some(value) => {
                    ctx.stats.record_succeeded(enqueued_at.elapsed());
                    let _ = result_tx.send(Ok(value));
                }
                None => {
                    warn!(%id, key = %key, "operation returned no value for requested key");
                    ctx.stats.record_failed(enqueued_at.elapsed());
                    let _ = result_tx.send(Err(RequestError::Failed {
                        attempts,
                        last_error: format!("operation returned no value for key '{key}'"),
                    }));
                }
            }
        }
        Err(err) => {
            resolve_failure(ctx, enqueued_at, err, result_tx);
        }
    }
}

async fn process_batch<V: Clone + Send + Sync + 'static>(
    ctx: &WorkerContext<V>,
    batch_key: &str,
    operation: Arc<dyn FetchOperation<V>>,
    members: Vec<BatchMember<V>>,
) {
    // Resolve members that were cancelled while the batch gathered or
    // queued, and members the cache can already satisfy.
    let mut remaining: Vec<BatchMember<V>> = Vec::with_capacity(members.len());
    for member in members {
        if member.cancel.is_cancelled() {
            ctx.stats.record_cancelled();
            ctx.registry.remove(&member.id);
            let _ = member.result_tx.send(Err(RequestError::Cancelled));
            continue;
        }
        if let Some(cache) = &ctx.cache {
            if let Some(value) = cache.get(&member.key) {
                ctx.stats.record_cache_hit_served();
                ctx.stats.record_succeeded(member.enqueued_at.elapsed());
                ctx.registry.remove(&member.id);
                let _ = member.result_tx.send(Ok(value));
                continue;
            }
        }
        remaining.push(member);
    }

    if remaining.is_empty() {
        trace!(batch_key, "batch fully served before execution");
        return;
    }

    // One underlying call covers every distinct key; the earliest member
    // deadline bounds the whole batch.
    let mut keys: Vec<String> = Vec::new();
    for member in &remaining {
        if !keys.contains(&member.key) {
            keys.push(member.key.clone());
        }
    }
    let deadline = remaining.iter().filter_map(|m| m.deadline).min();

    debug!(batch_key, members = remaining.len(), keys = keys.len(), "executing batch");
    let cancel = CancellationToken::new();
    let outcome = execute_with_retry(ctx, operation.as_ref(), &keys, deadline, &cancel).await;

    match outcome {
        Ok((values, attempts)) => {
            let fetched = store_results(ctx, values);
            for member in remaining {
                ctx.registry.remove(&member.id);
                if member.cancel.is_cancelled() {
                    ctx.stats.record_cancelled();
                    let _ = member.result_tx.send(Err(RequestError::Cancelled));
                    continue;
                }
                match fetched.get(&member.key) {
                    Some(value) => {
                        ctx.stats.record_succeeded(member.enqueued_at.elapsed());
                        let _ = member.result_tx.send(Ok(value.clone()));
                    }
                    None => {
                        ctx.stats.record_failed(member.enqueued_at.elapsed());
                        let _ = member.result_tx.send(Err(RequestError::Failed {
                            attempts,
                            last_error: format!(
                                "operation returned no value for key '{}'",
                                member.key
                            ),
                        }));
                    }
                }
            }
        }
        Err(err) => {
            for member in remaining {
                ctx.registry.remove(&member.id);
                resolve_failure(ctx, member.enqueued_at, err.clone(), member.result_tx);
            }
        }
    }
}

/// Write fetched pairs into the cache and index them by key.
///
/// Every returned pair is cached, including keys beyond the ones
/// requested - batch-oriented backends often return a superset.
fn store_results<V: Clone + Send + Sync + 'static>(
    ctx: &WorkerContext<V>,
    values: Vec<(String, V)>,
) -> HashMap<String, V> {
    let mut fetched = HashMap::with_capacity(values.len());
    for (key, value) in values {
        if let Some(cache) = &ctx.cache {
            cache.set(key.clone(), value.clone());
        }
        fetched.insert(key, value);
    }
    fetched
}

fn resolve_failure<V>(
    ctx: &WorkerContext<V>,
    enqueued_at: Instant,
    err: RequestError,
    result_tx: tokio::sync::oneshot::Sender<Result<V, RequestError>>,
) {
    match err {
        RequestError::Cancelled => ctx.stats.record_cancelled(),
        _ => ctx.stats.record_failed(enqueued_at.elapsed()),
    }
    let _ = result_tx.send(Err(err));
}

/// Run the operation, retrying transient failures with exponential
/// backoff plus a small random jitter.
///
/// The deadline and cancellation are checked before each attempt and
/// during backoff - an in-flight call is never interrupted. Returns the
/// fetched pairs and the number of attempts made.
async fn execute_with_retry<V>(
    ctx: &WorkerContext<V>,
    operation: &dyn FetchOperation<V>,
    keys: &[String],
    deadline: Option<Instant>,
    cancel: &CancellationToken,
) -> Result<(Vec<(String, V)>, u32), RequestError> {
    let max_attempts = ctx.max_retries + 1;
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        if cancel.is_cancelled() {
            return Err(RequestError::Cancelled);
        }
        if let Some(deadline) = deadline {
            if Instant::now() > deadline {
                return Err(RequestError::DeadlineExceeded);
            }
        }

        match operation.fetch(keys).await {
            Ok(values) => return Ok((values, attempt)),
            Err(err) => {
                last_error = err.message;
                if !err.retryable {
                    return Err(RequestError::Failed {
                        attempts: attempt,
                        last_error,
                    });
                }
                if attempt < max_attempts {
                    ctx.stats.record_retry();
                    let backoff = retry_backoff(ctx.backoff_base, attempt);
                    trace!(attempt, ?backoff, "transient failure, backing off");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(RequestError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    Err(RequestError::Failed {
        attempts: max_attempts,
        last_error,
    })
}

/// Exponential backoff with jitter: `base * 2^attempt` plus up to one
/// extra `base` of random spread, so synchronized retries fan out.
fn retry_backoff(base: Duration, attempt: u32) -> Duration {
    use rand::Rng;
    let exponential = base.saturating_mul(1u32 << attempt.min(16));
    let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis().max(1) as u64);
    exponential + Duration::from_millis(jitter_ms)
}
