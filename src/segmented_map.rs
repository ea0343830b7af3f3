//! A thread-safe segmented hash table: an array of locked [`BareMap`]s plus
//! per-thread staging caches that absorb writes under lock contention.
//!
//! This is the hot path of the engine. Segment counts are chosen so that
//! lock collisions between threads are unlikely (seven segments per thread,
//! see [`SEGMENTS_PER_THREAD`]), while [`ConcurrentMap::async_set`] gives
//! writers a lock-free fast path that degrades gracefully into a
//! thread-local buffer on contention, flushed at the next [`ConcurrentMap::sync`].

use std::collections::hash_map::DefaultHasher;
use std::hash::{BuildHasher, BuildHasherDefault, Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::bare_map::BareMap;
use crate::error::Result;
use crate::prime::SMALLEST_PRIME;
use crate::reducer::Reducer;

/// Segments per worker thread. Chosen so that, under uniform hashing, the
/// odds of two threads contending for the same segment stay low without
/// making any individual segment's table unreasonably small.
pub const SEGMENTS_PER_THREAD: usize = 7;

/// The default hasher used when none is given explicitly.
///
/// Deliberately `BuildHasherDefault<DefaultHasher>` rather than
/// `RandomState`: `RandomState` seeds itself randomly per process, which
/// would make `owner(key) = hash(key) mod P` disagree between processes and
/// break partition determinism (see the distributed map invariant in the
/// design notes). `DefaultHasher`'s default construction uses fixed internal
/// state, so the same key hashes the same way everywhere.
pub type DefaultMapHasher = BuildHasherDefault<DefaultHasher>;

/// A registration token identifying one writer to a map's staging caches.
///
/// Obtained once per thread via [`ConcurrentMap::register_thread`] (or
/// [`crate::dist_map::DistMap::register_thread`]) and then reused for every
/// subsequent `async_set` call from that thread. Tokens are handed out from a
/// single atomic counter, so two threads can never be handed the same one --
/// unlike indexing a staging cache directly off a caller-supplied `usize`,
/// which silently aliases if two callers ever reuse or miscoordinate their
/// IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadToken(usize);

impl ThreadToken {
    /// Maps this token onto a slot in a `n`-wide array of per-thread buffers
    /// (a staging cache or, for [`crate::dist_map::DistMap`], an outbox row).
    pub(crate) fn outbox_slot(&self, n: usize) -> usize {
        self.0 % n
    }
}

/// A thread-safe, segmented hash map.
///
/// `K` and `V` must be `Send` for the map to be usable from multiple
/// threads, which is enforced by the trait bounds on the methods that cross
/// thread boundaries rather than on the type itself.
pub struct ConcurrentMap<K, V, S = DefaultMapHasher> {
    segments: Vec<Mutex<BareMap<K, V>>>,
    staging: Vec<Mutex<BareMap<K, V>>>,
    hasher: S,
    threads: usize,
    next_token: AtomicUsize,
}

impl<K, V> ConcurrentMap<K, V, DefaultMapHasher>
where
    K: Eq + Hash,
{
    /// Creates a map sized for `max_threads` concurrent workers, using the
    /// crate's default, cross-process-deterministic hasher.
    pub fn new(max_threads: usize) -> Self {
        Self::with_hasher(max_threads, DefaultMapHasher::default())
    }

    /// Creates a map sized for the number of threads the runtime environment
    /// reports (`num_cpus::get()`), overridable via [`ConcurrentMap::new`].
    pub fn with_detected_threads() -> Self {
        Self::new(num_cpus::get().max(1))
    }
}

impl<K, V, S> ConcurrentMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    /// Creates a map sized for `max_threads` concurrent workers, using the
    /// given hasher for key hashing.
    pub fn with_hasher(max_threads: usize, hasher: S) -> Self {
        let threads = max_threads.max(1);
        let n_segments = threads * SEGMENTS_PER_THREAD;
        ConcurrentMap {
            segments: (0..n_segments).map(|_| Mutex::new(BareMap::new())).collect(),
            staging: (0..threads).map(|_| Mutex::new(BareMap::new())).collect(),
            hasher,
            threads,
            next_token: AtomicUsize::new(0),
        }
    }

    /// The number of worker threads this map was sized for.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// The number of segments (`threads * SEGMENTS_PER_THREAD`).
    pub fn n_segments(&self) -> usize {
        self.segments.len()
    }

    /// Hands out a fresh [`ThreadToken`] identifying the calling thread to
    /// this map's staging caches. Call once per thread (e.g. right after
    /// spawning a worker) and reuse the returned token for every `async_set`
    /// that thread makes afterward.
    pub fn register_thread(&self) -> ThreadToken {
        ThreadToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn hash_of(&self, key: &K) -> u64 {
        let mut h = self.hasher.build_hasher();
        key.hash(&mut h);
        h.finish()
    }

    fn segment_and_inner_hash(&self, hash: u64) -> (usize, u64) {
        let s = self.segments.len() as u64;
        ((hash % s) as usize, hash / s)
    }

    /// Blocking insert-or-combine. Always visible to subsequent `get`/`has`.
    pub fn set<R>(&self, key: K, value: V, reducer: &R) -> Result<()>
    where
        R: Reducer<V>,
    {
        let hash = self.hash_of(&key);
        self.set_with_hash(key, hash, value, reducer)
    }

    /// Non-blocking insert-or-combine from the thread identified by `token`
    /// (obtained once via [`register_thread`](Self::register_thread)).
    ///
    /// Tries the owning segment's lock; on contention, buffers the write in
    /// `token`'s staging cache instead of blocking. Staged writes become
    /// visible after the next [`sync`](Self::sync).
    pub fn async_set<R>(&self, token: ThreadToken, key: K, value: V, reducer: &R) -> Result<()>
    where
        R: Reducer<V>,
    {
        let hash = self.hash_of(&key);
        self.async_set_with_hash(token, key, hash, value, reducer)
    }

    /// As [`set`](Self::set), but with the hash supplied by the caller
    /// rather than computed from `key`. Used by [`crate::dist_map::DistMap`],
    /// which must split a key's hash between process ownership and local
    /// segment routing rather than hashing the key twice.
    pub(crate) fn set_with_hash<R>(&self, key: K, hash: u64, value: V, reducer: &R) -> Result<()>
    where
        R: Reducer<V>,
    {
        let (seg, inner_hash) = self.segment_and_inner_hash(hash);
        self.segments[seg].lock().set(key, inner_hash, value, reducer)
    }

    /// As [`async_set`](Self::async_set), with a caller-supplied hash; see
    /// [`set_with_hash`](Self::set_with_hash).
    pub(crate) fn async_set_with_hash<R>(
        &self,
        token: ThreadToken,
        key: K,
        hash: u64,
        value: V,
        reducer: &R,
    ) -> Result<()>
    where
        R: Reducer<V>,
    {
        let (seg, inner_hash) = self.segment_and_inner_hash(hash);
        if let Some(mut guard) = self.segments[seg].try_lock() {
            return guard.set(key, inner_hash, value, reducer);
        }
        let slot = token.0 % self.staging.len();
        // Staged writes are keyed by the *full* (post-ownership-split) hash,
        // not the in-segment hash, so that `sync` can re-derive the owning
        // segment later.
        self.staging[slot].lock().set(key, hash, value, reducer)
    }

    /// Drains every thread's staging cache into its owning segment.
    ///
    /// Threads drain concurrently; each only ever touches its own staging
    /// cache plus whichever segment locks its pending writes target.
    pub fn sync<R>(&self, reducer: &R) -> Result<()>
    where
        R: Reducer<V> + Sync,
        K: Clone + Send,
        V: Clone + Send,
    {
        let errors: Mutex<Vec<crate::error::HpmapError>> = Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for staging in &self.staging {
                scope.spawn(|| {
                    let mut guard = staging.lock();
                    let mut pending = Vec::new();
                    guard.for_each_with_hash(|k, v, h| pending.push((k.clone(), *h, v_clone(v))));
                    guard.clear();
                    drop(guard);

                    for (key, hash, value) in pending {
                        let (seg, inner_hash) = self.segment_and_inner_hash(hash);
                        if let Err(e) = self.segments[seg].lock().set(key, inner_hash, value, reducer)
                        {
                            errors.lock().push(e);
                        }
                    }
                });
            }
        });
        match errors.into_inner().into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Blocking lookup. Returns a clone of the stored value.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let hash = self.hash_of(key);
        self.get_with_hash(key, hash)
    }

    /// Blocking membership test.
    pub fn has(&self, key: &K) -> bool {
        let hash = self.hash_of(key);
        self.has_with_hash(key, hash)
    }

    /// Blocking removal, returning the removed value if present.
    pub fn unset(&self, key: &K) -> Option<V> {
        let hash = self.hash_of(key);
        self.unset_with_hash(key, hash)
    }

    /// As [`get`](Self::get), with a caller-supplied hash; see
    /// [`set_with_hash`](Self::set_with_hash).
    pub(crate) fn get_with_hash(&self, key: &K, hash: u64) -> Option<V>
    where
        V: Clone,
    {
        let (seg, inner_hash) = self.segment_and_inner_hash(hash);
        self.segments[seg].lock().get(key, inner_hash).cloned()
    }

    /// As [`has`](Self::has), with a caller-supplied hash.
    pub(crate) fn has_with_hash(&self, key: &K, hash: u64) -> bool {
        let (seg, inner_hash) = self.segment_and_inner_hash(hash);
        self.segments[seg].lock().has(key, inner_hash)
    }

    /// As [`unset`](Self::unset), with a caller-supplied hash.
    pub(crate) fn unset_with_hash(&self, key: &K, hash: u64) -> Option<V> {
        let (seg, inner_hash) = self.segment_and_inner_hash(hash);
        self.segments[seg].lock().unset(key, inner_hash)
    }

    /// Clears every segment and every thread's staging cache.
    ///
    /// Locks are acquired in ascending segment order to avoid deadlock with
    /// any other multi-segment operation that follows the same discipline.
    pub fn clear(&self) {
        for seg in &self.segments {
            seg.lock().clear();
        }
        for cache in &self.staging {
            cache.lock().clear();
        }
    }

    /// As [`clear`](Self::clear), and additionally shrinks every segment's
    /// bucket array back to [`SMALLEST_PRIME`].
    pub fn clear_and_shrink(&self) {
        for seg in &self.segments {
            seg.lock().clear_and_shrink();
        }
        for cache in &self.staging {
            cache.lock().clear_and_shrink();
        }
    }

    /// Distributes `min_keys` worth of reservation across segments, and a
    /// proportional burst allowance across thread staging caches.
    pub fn reserve(&self, min_keys: usize) -> Result<()> {
        let per_segment = min_keys / self.segments.len().max(1);
        for seg in &self.segments {
            seg.lock().reserve(per_segment)?;
        }
        let per_thread_staging = (min_keys / 1000).max(SMALLEST_PRIME);
        for cache in &self.staging {
            cache.lock().reserve(per_thread_staging)?;
        }
        Ok(())
    }

    /// Total committed key count, summed over segments. Staging caches are
    /// transient and are not counted.
    pub fn n_keys(&self) -> usize {
        self.segments.iter().map(|s| s.lock().n_keys()).sum()
    }

    /// Total bucket count, summed over segments.
    pub fn n_buckets(&self) -> usize {
        self.segments.iter().map(|s| s.lock().n_buckets()).sum()
    }

    /// `n_keys() / n_buckets()`.
    pub fn load_factor(&self) -> f64 {
        self.n_keys() as f64 / self.n_buckets() as f64
    }

    /// Visits every committed `(key, value)` pair across all segments.
    /// Staged-but-unsynced writes are not visited. Order is unspecified.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&K, &V),
    {
        for seg in &self.segments {
            seg.lock().for_each(&mut visitor);
        }
    }

    /// Visits every committed `(key, value)` pair in a single segment,
    /// identified by index. Used by the segmented-map-driven MapReduce to
    /// fan out across segments on separate worker threads, each locking only
    /// the segments it was assigned.
    pub(crate) fn for_each_in_segment<F>(&self, segment: usize, visitor: F)
    where
        F: FnMut(&K, &V),
    {
        self.segments[segment].lock().for_each(visitor);
    }
}

fn v_clone<V: Clone>(v: &V) -> V {
    v.clone()
}

impl<K, V, S> std::fmt::Debug for ConcurrentMap<K, V, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentMap")
            .field("threads", &self.threads)
            .field("n_segments", &self.segments.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducer::{Keep, Sum};

    #[test]
    fn hot_key_contention_under_async_set() {
        let map: ConcurrentMap<&str, i64> = ConcurrentMap::new(16);
        std::thread::scope(|scope| {
            for _ in 0..16 {
                scope.spawn(|| {
                    let token = map.register_thread();
                    for _ in 0..100_000 {
                        map.async_set(token, "hot", 1, &Sum).unwrap();
                    }
                });
            }
        });
        map.sync(&Sum).unwrap();
        assert_eq!(map.get(&"hot"), Some(1_600_000));
    }

    #[test]
    fn rehash_under_serial_load() {
        let map: ConcurrentMap<u64, u64> = ConcurrentMap::new(4);
        for i in 0..100_000u64 {
            map.set(i, i, &Keep).unwrap();
        }
        assert_eq!(map.n_keys(), 100_000);
        for i in 0..100_000u64 {
            assert_eq!(map.get(&i), Some(i));
        }
    }

    #[test]
    fn clear_resets_key_count() {
        let map: ConcurrentMap<u64, u64> = ConcurrentMap::new(2);
        for i in 0..10u64 {
            map.set(i, i, &Keep).unwrap();
        }
        map.clear();
        assert_eq!(map.n_keys(), 0);
    }

    #[test]
    fn clear_and_shrink_resets_every_segment() {
        let map: ConcurrentMap<u64, u64> = ConcurrentMap::new(2);
        for i in 0..10_000u64 {
            map.set(i, i, &Keep).unwrap();
        }
        map.clear_and_shrink();
        assert_eq!(map.n_keys(), 0);
        assert_eq!(map.n_buckets(), map.n_segments() * SMALLEST_PRIME);
    }
}
