//! Concurrent request optimization over slow external calls.
//!
//! A fixed pool of workers consumes one shared priority queue of
//! requests, each executed through a caller-supplied [`FetchOperation`]
//! (which typically checks out a pooled connection). The optimizer
//! retries transient failures with exponential backoff, coalesces
//! requests sharing a batch key into single underlying calls, serves
//! values from an attached cache store when possible, and writes every
//! successful result back into it.
//!
//! # Ordering
//!
//! Lower priority values are serviced first; within one priority level
//! requests leave the queue in submission order. Prefetch traffic runs at
//! [`PRIORITY_PREFETCH`], below anything a foreground caller can submit.
//!
//! # Example
//!
//! ```ignore
//! use cacheflow::optimizer::{FetchRequest, RequestOptimizer, PRIORITY_ON_DEMAND};
//!
//! let optimizer = RequestOptimizer::new(config, Some(store))?;
//!
//! let handle = optimizer
//!     .submit(FetchRequest::new("quote:AAPL", operation).with_priority(PRIORITY_ON_DEMAND))
//!     .await?;
//! let value = handle.wait().await?;
//! ```

mod batch;
mod core;
mod error;
mod queue;
mod request;
mod stats;
mod worker;

pub use self::core::RequestOptimizer;
pub use error::{FetchError, RequestError};
pub use request::{
    FetchOperation, FetchRequest, RequestHandle, RequestId, MAX_FOREGROUND_PRIORITY,
    PRIORITY_BACKGROUND, PRIORITY_ON_DEMAND, PRIORITY_PREFETCH,
};
pub use stats::{OptimizerStats, OptimizerStatsSnapshot};
