//! CacheFlow - in-process caching and request-optimization core
//!
//! This library front-ends slow external calls (APIs, database reads) with
//! named TTL caches, a bounded priority worker pool, and speculative
//! prefetching. Results flow from a caller-supplied fetch operation,
//! through retry and batching, into a shared cache.
//!
//! # High-Level API
//!
//! For most use cases, the [`service`] module provides a simplified facade:
//!
//! ```ignore
//! use cacheflow::service::{CacheFlowService, CoreConfig};
//!
//! let config = CoreConfig::default();
//! let service: CacheFlowService<String> = CacheFlowService::new(config)?;
//!
//! // Cache hit, or fetch through the worker pool on a miss
//! let value = service.get_or_fetch("quote:AAPL", operation).await?;
//!
//! service.shutdown().await;
//! ```
//!
//! The building blocks are also usable on their own:
//!
//! - [`cache`] - named TTL stores with LRU/LFU/FIFO eviction and statistics
//! - [`optimizer`] - bounded priority queue + worker pool with batching,
//!   retry, and cancellation
//! - [`pool`] - validated, scoped connection leases over an expensive
//!   external resource
//! - [`monitor`] - timing/counting wrapper with slow-operation alerts
//! - [`prefetch`] - speculative low-priority cache population

pub mod cache;
pub mod config;
pub mod logging;
pub mod monitor;
pub mod optimizer;
pub mod pool;
pub mod prefetch;
pub mod service;

/// Version of the CacheFlow library.
///
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
