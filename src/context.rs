//! Parallel context: process rank, process count, thread count, and the
//! collective primitives the distributed map and MapReduce driver consume.
//!
//! The engine only depends on the [`ParallelContext`] trait; the actual
//! message-passing substrate is an external collaborator per the system's
//! scope (it is assumed to provide all-to-all and broadcast-like
//! primitives). Two realizations are provided here: a trivial single-rank
//! context for shared-memory-only use, and an in-process multi-rank
//! simulation (standing in for a real cluster launcher, which remains out
//! of scope) used to exercise and test the distributed protocol.

use std::sync::{Arc, Barrier, Mutex};

use crate::error::{HpmapError, Result};

/// Process rank, process count, thread count, and the collectives the
/// distributed map and MapReduce driver need.
pub trait ParallelContext: Send + Sync {
    /// This process's rank, in `0..size()`.
    fn rank(&self) -> usize;

    /// The number of processes participating in the job.
    fn size(&self) -> usize;

    /// The shared-memory parallelism width this process should use.
    fn threads(&self) -> usize;

    /// Blocks until every process has called `barrier`.
    fn barrier(&self) -> Result<()>;

    /// Exchanges one buffer per destination rank with every other rank.
    /// `send[i]` is delivered to rank `i`; the returned vector's `i`-th
    /// entry is what rank `i` sent to this process.
    fn all_to_all(&self, send: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>>;

    /// Sums `value` across every rank and returns the total to all of them.
    fn all_reduce_sum(&self, value: u64) -> Result<u64>;
}

/// A single-process context: `size() == 1`, collectives are identities.
///
/// This is the context used whenever a job only needs the shared-memory
/// segmented map and doesn't actually span a cluster.
#[derive(Debug)]
pub struct LocalContext {
    threads: usize,
}

impl LocalContext {
    /// Uses the runtime-detected thread count (`num_cpus::get()`).
    pub fn detected() -> Self {
        LocalContext {
            threads: num_cpus::get().max(1),
        }
    }

    /// Uses an explicit thread count, overriding autodetection.
    pub fn with_threads(threads: usize) -> Self {
        LocalContext {
            threads: threads.max(1),
        }
    }
}

impl ParallelContext for LocalContext {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn threads(&self) -> usize {
        self.threads
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn all_to_all(&self, send: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
        // Only one rank exists, so "everyone else" is empty; loop back
        // whatever was addressed to ourselves.
        Ok(send)
    }

    fn all_reduce_sum(&self, value: u64) -> Result<u64> {
        Ok(value)
    }
}

struct ClusterShared {
    size: usize,
    barrier: Barrier,
    // inbox[dest][src] is what `src` sent to `dest` in the current exchange.
    inbox: Vec<Mutex<Vec<Vec<u8>>>>,
    reduce_slots: Vec<Mutex<u64>>,
}

/// One rank's handle into an in-process simulation of a `size`-process
/// cluster, standing in for a real message-passing transport.
///
/// Construct a full cluster with [`InProcessClusterContext::cluster`], then
/// hand one handle to each simulated rank (typically one OS thread per
/// rank). Every collective is a genuine rendezvous between all handles
/// sharing the same [`ClusterShared`] -- there is no shortcut for a rank
/// that never calls in.
pub struct InProcessClusterContext {
    rank: usize,
    threads: usize,
    shared: Arc<ClusterShared>,
}

impl std::fmt::Debug for InProcessClusterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessClusterContext")
            .field("rank", &self.rank)
            .field("size", &self.shared.size)
            .field("threads", &self.threads)
            .finish()
    }
}

impl InProcessClusterContext {
    /// Builds `size` linked contexts, one per simulated rank, each reporting
    /// `threads_per_rank` shared-memory threads.
    pub fn cluster(size: usize, threads_per_rank: usize) -> Vec<Self> {
        assert!(size > 0, "a cluster needs at least one rank");
        let shared = Arc::new(ClusterShared {
            size,
            barrier: Barrier::new(size),
            inbox: (0..size).map(|_| Mutex::new(vec![Vec::new(); size])).collect(),
            reduce_slots: (0..size).map(|_| Mutex::new(0)).collect(),
        });
        (0..size)
            .map(|rank| InProcessClusterContext {
                rank,
                threads: threads_per_rank.max(1),
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl ParallelContext for InProcessClusterContext {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn threads(&self) -> usize {
        self.threads
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait();
        Ok(())
    }

    fn all_to_all(&self, mut send: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
        if send.len() != self.shared.size {
            return Err(HpmapError::Collective(format!(
                "all_to_all expected {} send buffers, got {}",
                self.shared.size,
                send.len()
            )));
        }
        // Phase 1: deposit our outgoing buffers into every destination's inbox.
        for dest in 0..self.shared.size {
            let buf = std::mem::take(&mut send[dest]);
            self.shared.inbox[dest].lock().unwrap()[self.rank] = buf;
        }
        self.shared.barrier.wait();

        // Phase 2: collect what was addressed to us.
        let recv = self.shared.inbox[self.rank].lock().unwrap().clone();
        self.shared.barrier.wait();
        Ok(recv)
    }

    fn all_reduce_sum(&self, value: u64) -> Result<u64> {
        *self.shared.reduce_slots[self.rank].lock().unwrap() = value;
        self.shared.barrier.wait();
        let total = self.shared.reduce_slots.iter().map(|s| *s.lock().unwrap()).sum();
        self.shared.barrier.wait();
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_context_is_a_singleton_rank() {
        let ctx = LocalContext::with_threads(4);
        assert_eq!(ctx.rank(), 0);
        assert_eq!(ctx.size(), 1);
        assert_eq!(ctx.threads(), 4);
        assert_eq!(ctx.all_reduce_sum(42).unwrap(), 42);
    }

    #[test]
    fn cluster_all_reduce_sum_matches_across_ranks() {
        let ranks = InProcessClusterContext::cluster(4, 2);
        std::thread::scope(|scope| {
            for (i, ctx) in ranks.iter().enumerate() {
                scope.spawn(move || {
                    let total = ctx.all_reduce_sum((i as u64) + 1).unwrap();
                    assert_eq!(total, 1 + 2 + 3 + 4);
                });
            }
        });
    }

    #[test]
    fn cluster_all_to_all_delivers_addressed_buffers() {
        let ranks = InProcessClusterContext::cluster(3, 1);
        std::thread::scope(|scope| {
            for (i, ctx) in ranks.iter().enumerate() {
                scope.spawn(move || {
                    let send: Vec<Vec<u8>> = (0..3).map(|d| vec![i as u8, d as u8]).collect();
                    let recv = ctx.all_to_all(send).unwrap();
                    for (src, buf) in recv.iter().enumerate() {
                        assert_eq!(buf, &vec![src as u8, i as u8]);
                    }
                });
            }
        });
    }
}
