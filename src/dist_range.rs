//! Distributed range and the MapReduce driver built on top of it.
//!
//! A [`DistRange`] has no stored contents -- it is a lazy producer of
//! integer keys `[lo, hi)` that feeds a MapReduce. [`ConcurrentMap::mapreduce`]
//! runs the same fan-out-then-sync pattern over an existing map's contents
//! instead, partitioning by segment index rather than by integer value.

use std::hash::Hash;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{BincodeCodec, Codec};
use crate::context::ParallelContext;
use crate::dist_map::DistMap;
use crate::error::Result;
use crate::reducer::Reducer;
use crate::segmented_map::{ConcurrentMap, DefaultMapHasher};

/// Splits `n_items` into at most `threads` contiguous chunks, each thread's
/// chunk size differing by at most one item.
fn chunk_size(n_items: usize, threads: usize) -> usize {
    ((n_items + threads - 1) / threads.max(1)).max(1)
}

/// Doubling progress thresholds, as a fraction of total work, printed (as
/// `tracing` events) on rank 0 thread 0 only. Nothing is logged past 80%.
const PROGRESS_THRESHOLDS: [f64; 4] = [0.10, 0.20, 0.40, 0.80];

/// A half-open integer range `[lo, hi)` with no stored contents: the lazy
/// producer of synthetic keys fed into a MapReduce.
#[derive(Debug, Clone, Copy)]
pub struct DistRange {
    lo: i64,
    hi: i64,
}

impl DistRange {
    /// Creates the range `[lo, hi)`.
    pub fn new(lo: i64, hi: i64) -> Self {
        assert!(lo <= hi, "distributed range must be non-decreasing");
        DistRange { lo, hi }
    }

    /// The number of integers in the range.
    pub fn len(&self) -> usize {
        (self.hi - self.lo) as usize
    }

    /// Whether the range is empty.
    pub fn is_empty(&self) -> bool {
        self.hi <= self.lo
    }

    /// Runs a MapReduce over this range.
    ///
    /// Integer `i` is processed by rank `i mod size()`, statically scheduled
    /// in contiguous chunks across that process's threads. `mapper(i, emit)`
    /// is called once per integer this process owns; `emit(key, value)`
    /// routes through the destination map's `set` under the given reducer.
    ///
    /// When `verbose`, thread 0 on rank 0 logs doubling progress thresholds
    /// (10/20/40/80%) as it works through its own chunk -- the only thread
    /// whose progress is tracked, per the job's "rank 0, thread 0" reporting
    /// convention.
    pub fn mapreduce<KR, VR, M, R>(
        &self,
        ctx: Arc<dyn ParallelContext>,
        mapper: M,
        reducer: R,
        verbose: bool,
    ) -> Result<DistMap<KR, VR, DefaultMapHasher, BincodeCodec>>
    where
        KR: Eq + Hash + Clone + Send + Serialize + DeserializeOwned,
        VR: Clone + Send + Serialize + DeserializeOwned,
        M: Fn(i64, &mut dyn FnMut(KR, VR)) + Sync,
        R: Reducer<VR> + Sync,
    {
        let rank = ctx.rank();
        let size = ctx.size();
        let threads = ctx.threads();
        let mut dst = DistMap::new(Arc::clone(&ctx));

        let local_items: Vec<i64> = (self.lo..self.hi)
            .filter(|i| i.rem_euclid(size as i64) == rank as i64)
            .collect();
        let chunk = chunk_size(local_items.len(), threads);

        std::thread::scope(|scope| {
            for (t, items) in local_items.chunks(chunk).enumerate() {
                let dst = &dst;
                let mapper = &mapper;
                let reducer = &reducer;
                scope.spawn(move || {
                    let token = dst.register_thread();
                    let report = verbose && rank == 0 && t == 0;
                    let local_total = items.len().max(1);
                    let mut next_threshold = 0;
                    for (done, &i) in items.iter().enumerate() {
                        let mut emit = |key: KR, value: VR| {
                            let _ = dst.set(token, key, value, reducer);
                        };
                        mapper(i, &mut emit);

                        if report {
                            let completed = done + 1;
                            while next_threshold < PROGRESS_THRESHOLDS.len()
                                && (completed as f64 / local_total as f64)
                                    >= PROGRESS_THRESHOLDS[next_threshold]
                            {
                                tracing::info!(
                                    progress =
                                        format!("{:.0}%", PROGRESS_THRESHOLDS[next_threshold] * 100.0),
                                    "mapreduce progress"
                                );
                                next_threshold += 1;
                            }
                        }
                    }
                });
            }
        });

        dst.sync(&reducer, verbose)?;
        Ok(dst)
    }
}

impl<K, V, S> ConcurrentMap<K, V, S>
where
    K: Eq + Hash + Clone + Send + Serialize + DeserializeOwned,
    V: Clone + Send + Serialize + DeserializeOwned,
    S: std::hash::BuildHasher,
{
    /// A MapReduce whose source is this segmented map rather than an
    /// integer range: work is partitioned by segment index modulo the
    /// process count, those locally owned segments are further split across
    /// `ctx.threads()` worker threads, and `mapper` is invoked once per
    /// `(key, value)` pair in the segments a given thread was assigned.
    ///
    /// Callers should `sync` this map before calling `mapreduce`, since
    /// staged-but-unsynced writes are not visited.
    pub fn mapreduce<KR, VR, M, R>(
        &self,
        ctx: Arc<dyn ParallelContext>,
        mapper: M,
        reducer: R,
        verbose: bool,
    ) -> Result<DistMap<KR, VR, DefaultMapHasher, BincodeCodec>>
    where
        KR: Eq + Hash + Clone + Send + Serialize + DeserializeOwned,
        VR: Clone + Send + Serialize + DeserializeOwned,
        M: Fn(&K, &V, &mut dyn FnMut(KR, VR)) + Sync,
        R: Reducer<VR> + Sync,
    {
        let rank = ctx.rank();
        let size = ctx.size();
        let threads = ctx.threads();
        let mut dst = DistMap::new(Arc::clone(&ctx));

        let owned_segments: Vec<usize> = (0..self.n_segments()).filter(|idx| idx % size == rank).collect();
        let chunk = chunk_size(owned_segments.len(), threads);

        std::thread::scope(|scope| {
            for segments in owned_segments.chunks(chunk) {
                let dst = &dst;
                let mapper = &mapper;
                let reducer = &reducer;
                scope.spawn(move || {
                    let token = dst.register_thread();
                    for &segment_idx in segments {
                        self.for_each_in_segment(segment_idx, |k, v| {
                            let mut emit = |key: KR, value: VR| {
                                let _ = dst.set(token, key, value, reducer);
                            };
                            mapper(k, v, &mut emit);
                        });
                    }
                });
            }
        });

        if verbose {
            tracing::info!(rank, "segmented-map mapreduce: local emission complete");
        }

        dst.sync(&reducer, verbose)?;
        Ok(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LocalContext;
    use crate::reducer::{Keep, Sum};

    #[test]
    fn identity_mapreduce_over_a_thousand_keys() {
        let ctx: Arc<dyn ParallelContext> = Arc::new(LocalContext::with_threads(4));
        let range = DistRange::new(0, 1000);
        let dst = range
            .mapreduce::<i64, bool, _, _>(ctx, |i, emit| emit(i, false), Keep, false)
            .unwrap();
        assert_eq!(dst.n_keys().unwrap(), 1000);
        for i in 0..1000i64 {
            assert_eq!(dst.get(&i), Some(false));
        }
    }

    #[test]
    fn modulo_sum_over_a_large_range() {
        let ctx: Arc<dyn ParallelContext> = Arc::new(LocalContext::with_threads(4));
        let range = DistRange::new(0, 100_000);
        let dst = range
            .mapreduce::<i64, i64, _, _>(
                ctx,
                |i, emit| emit(i % 101, i),
                Sum,
                false,
            )
            .unwrap();
        assert_eq!(dst.n_keys().unwrap(), 101);
        for k in 0..101i64 {
            let expected: i64 = (0..100_000i64).filter(|i| i % 101 == k).sum();
            assert_eq!(dst.get(&k), Some(expected));
        }
    }

    #[test]
    fn segmented_map_mapreduce_fans_out_across_threads() {
        let ctx: Arc<dyn ParallelContext> = Arc::new(LocalContext::with_threads(4));
        let src: ConcurrentMap<u64, i64> = ConcurrentMap::new(4);
        for i in 0..20_000u64 {
            src.set(i, i as i64, &Keep).unwrap();
        }
        let dst = src
            .mapreduce::<u64, i64, _, _>(ctx, |k, v, emit| emit(k % 7, *v), Sum, false)
            .unwrap();
        assert_eq!(dst.n_keys().unwrap(), 7);
        for k in 0..7u64 {
            let expected: i64 = (0..20_000u64).filter(|i| i % 7 == k).map(|i| i as i64).sum();
            assert_eq!(dst.get(&k), Some(expected));
        }
    }
}
