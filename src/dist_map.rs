//! Distributed map: a process-partitioned view over [`ConcurrentMap`]s,
//! exchanging emissions between processes with an all-to-all collective.

use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{BincodeCodec, Codec};
use crate::context::ParallelContext;
use crate::error::Result;
use crate::reducer::Reducer;
use crate::segmented_map::{ConcurrentMap, DefaultMapHasher, ThreadToken};

/// A hash map partitioned across processes by `owner(key) = hash(key) mod
/// size()`, backed locally by a [`ConcurrentMap`].
///
/// `set`/`async_set` route an emission either straight into the local
/// segmented map (if this process owns the key) or into a per-thread,
/// per-destination outbox; [`sync`](Self::sync) drains both, exchanges
/// outboxes with every other process, and applies what comes back.
pub struct DistMap<K, V, S = DefaultMapHasher, C = BincodeCodec> {
    local: ConcurrentMap<K, V, S>,
    ctx: Arc<dyn ParallelContext>,
    // outboxes[thread][dest]
    outboxes: Vec<Vec<Mutex<Vec<(K, V)>>>>,
    codec: C,
}

impl<K, V, S, C> std::fmt::Debug for DistMap<K, V, S, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistMap")
            .field("rank", &self.ctx.rank())
            .field("size", &self.ctx.size())
            .finish()
    }
}

impl<K, V> DistMap<K, V, DefaultMapHasher, BincodeCodec>
where
    K: Eq + Hash,
{
    /// Creates an empty distributed map over the given parallel context,
    /// using the default deterministic hasher and the default bincode codec.
    pub fn new(ctx: Arc<dyn ParallelContext>) -> Self {
        let threads = ctx.threads();
        let size = ctx.size();
        DistMap {
            local: ConcurrentMap::new(threads),
            outboxes: (0..threads)
                .map(|_| (0..size).map(|_| Mutex::new(Vec::new())).collect())
                .collect(),
            ctx,
            codec: BincodeCodec,
        }
    }
}

impl<K, V, S, C> DistMap<K, V, S, C>
where
    K: Eq + Hash,
    S: std::hash::BuildHasher + Default,
    C: Codec<K> + Codec<V> + Default,
{
    /// Creates an empty distributed map with an explicit hasher and codec,
    /// for callers that need something other than the crate defaults (e.g.
    /// a custom key type's codec).
    pub fn with_hasher_and_codec(ctx: Arc<dyn ParallelContext>) -> Self {
        let threads = ctx.threads();
        let size = ctx.size();
        DistMap {
            local: ConcurrentMap::with_hasher(threads, S::default()),
            outboxes: (0..threads)
                .map(|_| (0..size).map(|_| Mutex::new(Vec::new())).collect())
                .collect(),
            ctx,
            codec: C::default(),
        }
    }
}

impl<K, V, S, C> DistMap<K, V, S, C>
where
    K: Eq + Hash + Clone + Send + Serialize + DeserializeOwned,
    V: Clone + Send + Serialize + DeserializeOwned,
    S: std::hash::BuildHasher,
    C: Codec<K> + Codec<V>,
{
    /// This process's rank.
    pub fn rank(&self) -> usize {
        self.ctx.rank()
    }

    /// The number of processes in the job.
    pub fn size(&self) -> usize {
        self.ctx.size()
    }

    /// Hands out a fresh [`ThreadToken`] identifying the calling thread to
    /// this map's outboxes and its local segmented map's staging caches. Call
    /// once per thread and reuse the result for every `set`/`async_set` that
    /// thread makes afterward.
    pub fn register_thread(&self) -> ThreadToken {
        self.local.register_thread()
    }

    fn owner_and_local_hash(&self, key: &K) -> (usize, u64) {
        let hash = self.local.hash_of(key);
        let size = self.ctx.size() as u64;
        ((hash % size) as usize, hash / size)
    }

    /// Routes an emission: straight into the local segmented map if this
    /// process owns `key`, otherwise into `token`'s outbox for the owning
    /// rank.
    pub fn set<R>(&self, token: ThreadToken, key: K, value: V, reducer: &R) -> Result<()>
    where
        R: Reducer<V>,
    {
        let (owner, local_hash) = self.owner_and_local_hash(&key);
        if owner == self.rank() {
            self.local.set_with_hash(key, local_hash, value, reducer)
        } else {
            self.outboxes[token.outbox_slot(self.outboxes.len())][owner]
                .lock()
                .push((key, value));
            Ok(())
        }
    }

    /// As [`set`](Self::set), but uses the local segmented map's lock-free
    /// fast path when the key is locally owned.
    pub fn async_set<R>(&self, token: ThreadToken, key: K, value: V, reducer: &R) -> Result<()>
    where
        R: Reducer<V>,
    {
        let (owner, local_hash) = self.owner_and_local_hash(&key);
        if owner == self.rank() {
            self.local
                .async_set_with_hash(token, key, local_hash, value, reducer)
        } else {
            self.outboxes[token.outbox_slot(self.outboxes.len())][owner]
                .lock()
                .push((key, value));
            Ok(())
        }
    }

    /// Local-only lookup: reflects this process's committed state, which is
    /// only guaranteed complete for owned keys after a `sync`.
    pub fn get(&self, key: &K) -> Option<V> {
        let (_, local_hash) = self.owner_and_local_hash(key);
        self.local.get_with_hash(key, local_hash)
    }

    /// Local-only membership test; see [`get`](Self::get)'s caveat.
    pub fn has(&self, key: &K) -> bool {
        let (_, local_hash) = self.owner_and_local_hash(key);
        self.local.has_with_hash(key, local_hash)
    }

    /// Local-only removal; see [`get`](Self::get)'s caveat.
    pub fn unset(&self, key: &K) -> Option<V> {
        let (_, local_hash) = self.owner_and_local_hash(key);
        self.local.unset_with_hash(key, local_hash)
    }

    /// This process's locally committed key count.
    pub fn local_n_keys(&self) -> usize {
        self.local.n_keys()
    }

    /// The total key count across every process, via an all-reduce.
    pub fn n_keys(&self) -> Result<usize> {
        let local = self.local.n_keys() as u64;
        Ok(self.ctx.all_reduce_sum(local)? as usize)
    }

    /// Visits every locally committed `(key, value)` pair. Order is
    /// unspecified and only meaningful for locally owned entries.
    pub fn for_each_local<F>(&self, visitor: F)
    where
        F: FnMut(&K, &V),
    {
        self.local.for_each(visitor);
    }

    fn encode_outbox(&self, buf: &[(K, V)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(buf.len() as u64).to_le_bytes());
        for (k, v) in buf {
            Codec::<K>::encode(&self.codec, k, &mut out);
            Codec::<V>::encode(&self.codec, v, &mut out);
        }
        out
    }

    /// The collective protocol described in the distributed map design: flush
    /// local staging, exchange outboxes, and apply what comes back.
    ///
    /// After this returns, every emitted key resides exactly on its owner
    /// process, folded under `reducer` across every emission for that key
    /// in the job so far.
    pub fn sync<R>(&mut self, reducer: &R, verbose: bool) -> Result<()>
    where
        R: Reducer<V> + Sync,
    {
        self.local.sync(reducer)?;
        if verbose {
            tracing::debug!(rank = self.rank(), "flushed local staging caches");
        }

        let size = self.ctx.size();
        let mut send = vec![Vec::new(); size];
        for dest in 0..size {
            if dest == self.rank() {
                continue;
            }
            let mut combined: Vec<(K, V)> = Vec::new();
            for per_thread in &self.outboxes {
                let mut outgoing = per_thread[dest].lock();
                combined.append(&mut outgoing);
            }
            send[dest] = self.encode_outbox(&combined);
        }

        if verbose {
            tracing::debug!(rank = self.rank(), "entering all-to-all exchange");
        }
        let recv = self.ctx.all_to_all(send)?;
        if verbose {
            tracing::debug!(rank = self.rank(), "all-to-all exchange complete");
        }

        // A buffer that fails to decode aborts only the rest of *that*
        // buffer -- we've lost the pair framing and can't locate the next
        // pair's start. Every other peer's buffer still applies, outboxes
        // still get cleared below either way, and the first error (if any)
        // is surfaced to the caller once cleanup is done.
        let mut first_err = None;
        for buf in recv {
            if let Err(e) = self.apply_incoming(&buf, reducer) {
                if verbose {
                    tracing::warn!(rank = self.rank(), error = %e, "dropping the remainder of an undecodable buffer");
                }
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }

        for per_thread in &self.outboxes {
            for outbox in per_thread {
                outbox.lock().clear();
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn apply_incoming<R>(&self, buf: &[u8], reducer: &R) -> Result<()>
    where
        R: Reducer<V>,
    {
        if buf.len() < 8 {
            return Ok(());
        }
        let count = u64::from_le_bytes(buf[0..8].try_into().unwrap()) as usize;
        let mut cursor = 8usize;
        for _ in 0..count {
            let (key, consumed) = Codec::<K>::decode_prefix(&self.codec, &buf[cursor..])?;
            cursor += consumed;
            let (value, consumed) = Codec::<V>::decode_prefix(&self.codec, &buf[cursor..])?;
            cursor += consumed;
            let (_owner, local_hash) = self.owner_and_local_hash(&key);
            self.local.set_with_hash(key, local_hash, value, reducer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{InProcessClusterContext, LocalContext};
    use crate::reducer::{Keep, Sum};

    #[test]
    fn single_rank_roundtrip() {
        let ctx: Arc<dyn ParallelContext> = Arc::new(LocalContext::with_threads(2));
        let mut map: DistMap<u64, bool> = DistMap::new(ctx);
        let token = map.register_thread();
        for i in 0..1000u64 {
            map.set(token, i, false, &Keep).unwrap();
        }
        map.sync(&Keep, false).unwrap();
        assert_eq!(map.n_keys().unwrap(), 1000);
        for i in 0..1000u64 {
            assert_eq!(map.get(&i), Some(false));
        }
    }

    #[test]
    fn word_count_across_four_ranks() {
        let ctxs = InProcessClusterContext::cluster(4, 1);
        let handles: Vec<_> = ctxs
            .into_iter()
            .map(|ctx| {
                std::thread::spawn(move || {
                    let ctx: Arc<dyn ParallelContext> = Arc::new(ctx);
                    let mut map: DistMap<String, i64> = DistMap::new(ctx);
                    let token = map.register_thread();
                    for (word, count) in [("a", 1i64), ("b", 1), ("a", 1)] {
                        map.set(token, word.to_string(), count, &Sum).unwrap();
                    }
                    map.sync(&Sum, false).unwrap();
                    let mut local = Vec::new();
                    map.for_each_local(|k, v| local.push((k.clone(), *v)));
                    local
                })
            })
            .collect();

        let mut totals = std::collections::HashMap::new();
        for h in handles {
            for (k, v) in h.join().unwrap() {
                *totals.entry(k).or_insert(0i64) += v;
            }
        }
        assert_eq!(totals.get("a"), Some(&12));
        assert_eq!(totals.get("b"), Some(&4));
    }

    #[test]
    fn partition_is_deterministic_across_two_maps() {
        // Two independently constructed four-rank clusters: if the hash
        // splitting ever disagreed between separately built `DistMap`s, this
        // would catch it at a real P > 1, unlike comparing two P=1 maps
        // (where owner(k) mod 1 is trivially 0 for every key).
        let ctx_a: Arc<dyn ParallelContext> =
            Arc::new(InProcessClusterContext::cluster(4, 1).into_iter().next().unwrap());
        let ctx_b: Arc<dyn ParallelContext> =
            Arc::new(InProcessClusterContext::cluster(4, 1).into_iter().next().unwrap());
        let map_a: DistMap<u64, u64> = DistMap::new(ctx_a);
        let map_b: DistMap<u64, u64> = DistMap::new(ctx_b);
        assert_eq!(map_a.size(), 4);
        for k in 0..500u64 {
            assert_eq!(map_a.owner_and_local_hash(&k), map_b.owner_and_local_hash(&k));
        }
    }
}
