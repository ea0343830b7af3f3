//! A hybrid-parallel distributed hash map and MapReduce engine.
//!
//! This crate targets HPC-style keyed aggregation across many processes on
//! a cluster, each process exploiting multiple CPU cores. A user submits a
//! *mapper* that emits key/value pairs and a *reducer* that combines values
//! sharing a key; the engine routes emissions to the process that owns each
//! key, merges them locally under shared-memory concurrency, and returns a
//! distributed map whose partitions collectively hold the final reduction.
//!
//! # Layering
//!
//! - [`bare_map::BareMap`] -- single-threaded, open-chaining hash table with
//!   prime-sized buckets. Not shareable.
//! - [`segmented_map::ConcurrentMap`] -- many `BareMap`s behind per-segment
//!   locks, plus per-thread staging caches that absorb writes under
//!   contention ([`segmented_map::ConcurrentMap::async_set`]).
//! - [`dist_map::DistMap`] -- a `ConcurrentMap` partitioned across processes
//!   by `hash(key) mod size()`, with a [`sync`](dist_map::DistMap::sync)
//!   collective that exchanges emissions between processes.
//! - [`dist_range::DistRange`] -- the lazy integer-range producer that
//!   drives a MapReduce job end to end.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use hpmap::context::{LocalContext, ParallelContext};
//! use hpmap::dist_range::DistRange;
//! use hpmap::reducer::Sum;
//!
//! let ctx: Arc<dyn ParallelContext> = Arc::new(LocalContext::with_threads(4));
//! let dst = DistRange::new(0, 1_000)
//!     .mapreduce::<i64, i64, _, _>(ctx, |i, emit| emit(i % 10, i), Sum, false)
//!     .unwrap();
//! assert_eq!(dst.n_keys().unwrap(), 10);
//! ```
#![warn(missing_docs, rust_2018_idioms, missing_debug_implementations)]

pub mod bare_map;
pub mod codec;
pub mod context;
pub mod dist_map;
pub mod dist_range;
pub mod error;
pub mod prime;
pub mod reducer;
pub mod segmented_map;

pub use bare_map::BareMap;
pub use codec::{BincodeCodec, Codec};
pub use context::{InProcessClusterContext, LocalContext, ParallelContext};
pub use dist_map::DistMap;
pub use dist_range::DistRange;
pub use error::{HpmapError, Result};
pub use segmented_map::{ConcurrentMap, ThreadToken};
