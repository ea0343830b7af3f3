//! Single-threaded, open-chaining hash table with prime-sized buckets.
//!
//! `BareMap` is the innermost layer: it owns no locks and is not `Sync`. The
//! segmented concurrent map (`crate::segmented_map`) is built from many of
//! these, one per segment and one per thread's staging cache.

use crate::error::{HpmapError, Result};
use crate::prime::{pick_prime_product, SMALLEST_PRIME};

struct Node<K, V> {
    key: K,
    value: V,
    hash: u64,
    next: Option<Box<Node<K, V>>>,
}

/// A single-threaded hash table whose bucket count is always a prime or a
/// product of primes from [`crate::prime::PRIME_CASCADE`].
///
/// Hashes are supplied by the caller for every operation rather than
/// computed internally, so that callers composing many `BareMap`s (as
/// [`crate::segmented_map::ConcurrentMap`] does) can split a single hash
/// between segment selection and in-segment bucket selection without
/// hashing the key twice.
pub struct BareMap<K, V> {
    buckets: Vec<Option<Box<Node<K, V>>>>,
    n_keys: usize,
    max_load_factor: f64,
}

impl<K, V> BareMap<K, V>
where
    K: Eq,
{
    /// Creates an empty map with the smallest prime bucket count.
    pub fn new() -> Self {
        Self::with_max_load_factor(1.0)
    }

    /// Creates an empty map with the given max load factor.
    pub fn with_max_load_factor(max_load_factor: f64) -> Self {
        BareMap {
            buckets: new_bucket_vec(SMALLEST_PRIME),
            n_keys: 0,
            max_load_factor,
        }
    }

    /// Number of distinct keys currently stored.
    pub fn n_keys(&self) -> usize {
        self.n_keys
    }

    /// Current number of buckets.
    pub fn n_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// `n_keys / n_buckets`.
    pub fn load_factor(&self) -> f64 {
        self.n_keys as f64 / self.buckets.len() as f64
    }

    /// The load factor above which `set` triggers a rehash.
    pub fn max_load_factor(&self) -> f64 {
        self.max_load_factor
    }

    /// Overrides the max load factor used to decide when to rehash.
    pub fn set_max_load_factor(&mut self, factor: f64) {
        self.max_load_factor = factor;
    }

    /// Ensures the table can hold at least `min_keys` without rehashing,
    /// with the default inflation factor of `1.0`.
    pub fn reserve(&mut self, min_keys: usize) -> Result<()> {
        self.reserve_with_inflation(min_keys, 1.0)
    }

    /// Ensures the table can hold at least `min_keys` without rehashing,
    /// inflating the target capacity by `inflation` before sizing.
    ///
    /// This exposes the historical "inflation factor" knob noted as an open
    /// question in the design notes: older code paths padded the requested
    /// capacity before picking a prime product. The default of `1.0`
    /// reproduces the newer, uninflated behavior.
    pub fn reserve_with_inflation(&mut self, min_keys: usize, inflation: f64) -> Result<()> {
        let target = ((min_keys as f64) * inflation / self.max_load_factor).ceil() as usize;
        let wanted = pick_prime_product(target);
        if wanted > self.buckets.len() {
            self.rehash_to(wanted)?;
        }
        Ok(())
    }

    /// Looks up `key` (whose precomputed hash is `hash`), returning a
    /// reference to its value if present.
    pub fn get(&self, key: &K, hash: u64) -> Option<&V> {
        let idx = (hash as usize) % self.buckets.len();
        let mut cur = self.buckets[idx].as_deref();
        while let Some(node) = cur {
            if node.hash == hash && &node.key == key {
                return Some(&node.value);
            }
            cur = node.next.as_deref();
        }
        None
    }

    /// Like [`get`](Self::get), but returns a clone of `default` when the
    /// key is absent, matching the literal operation surface named in the
    /// design documents.
    pub fn get_or(&self, key: &K, hash: u64, default: V) -> V
    where
        V: Clone,
    {
        self.get(key, hash).cloned().unwrap_or(default)
    }

    /// Whether `key` is present.
    pub fn has(&self, key: &K, hash: u64) -> bool {
        self.get(key, hash).is_some()
    }

    /// Inserts `value` for `key`, or folds it into the existing value via
    /// `reducer` if `key` is already present. May trigger a rehash.
    pub fn set<R>(&mut self, key: K, hash: u64, value: V, reducer: &R) -> Result<()>
    where
        R: crate::reducer::Reducer<V>,
    {
        let idx = (hash as usize) % self.buckets.len();
        let mut cur = self.buckets[idx].as_deref_mut();
        while let Some(node) = cur {
            if node.hash == hash && node.key == key {
                reducer.combine(&mut node.value, value);
                return Ok(());
            }
            cur = node.next.as_deref_mut();
        }

        let new_node = Box::new(Node {
            key,
            value,
            hash,
            next: self.buckets[idx].take(),
        });
        self.buckets[idx] = Some(new_node);
        self.n_keys += 1;

        if self.n_keys as f64 > self.buckets.len() as f64 * self.max_load_factor {
            let target = pick_prime_product((self.n_keys as f64 / self.max_load_factor).ceil() as usize);
            self.rehash_to(target)?;
        }
        Ok(())
    }

    /// Removes `key`, returning its value if it was present.
    pub fn unset(&mut self, key: &K, hash: u64) -> Option<V> {
        let idx = (hash as usize) % self.buckets.len();
        let mut slot = &mut self.buckets[idx];
        loop {
            match slot {
                None => return None,
                Some(node) if node.hash == hash && &node.key == key => {
                    let mut owned = slot.take().unwrap();
                    *slot = owned.next.take();
                    self.n_keys -= 1;
                    return Some(owned.value);
                }
                Some(node) => {
                    slot = &mut node.next;
                }
            }
        }
    }

    /// Visits every `(key, value)` pair. Order is unspecified.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&K, &V),
    {
        for head in &self.buckets {
            let mut cur = head.as_deref();
            while let Some(node) = cur {
                visitor(&node.key, &node.value);
                cur = node.next.as_deref();
            }
        }
    }

    /// As [`for_each`](Self::for_each), but also hands the visitor each
    /// node's stored hash. Used when replaying a staging cache, where the
    /// original (pre-split) hash is needed to re-derive the owning segment.
    pub fn for_each_with_hash<F>(&self, mut visitor: F)
    where
        F: FnMut(&K, &V, &u64),
    {
        for head in &self.buckets {
            let mut cur = head.as_deref();
            while let Some(node) = cur {
                visitor(&node.key, &node.value, &node.hash);
                cur = node.next.as_deref();
            }
        }
    }

    /// Removes all entries, keeping the current bucket count.
    pub fn clear(&mut self) {
        for head in &mut self.buckets {
            drop_chain_iteratively(head.take());
        }
        self.n_keys = 0;
    }

    /// Removes all entries and shrinks the bucket array to the smallest
    /// prime in the cascade.
    pub fn clear_and_shrink(&mut self) {
        self.clear();
        self.buckets = new_bucket_vec(SMALLEST_PRIME);
    }

    /// Rehashes to a fresh bucket array of (at least) `new_size` buckets,
    /// transplanting every node without recomputing its hash.
    fn rehash_to(&mut self, new_size: usize) -> Result<()> {
        let new_size = new_size.max(SMALLEST_PRIME);
        let mut new_buckets: Vec<Option<Box<Node<K, V>>>> = Vec::new();
        new_buckets
            .try_reserve_exact(new_size)
            .map_err(|_| HpmapError::Allocation)?;
        new_buckets.resize_with(new_size, || None);

        for head in &mut self.buckets {
            // Post-order: detach each node's successor before moving the
            // node itself, so no chain is ever left half-migrated.
            let mut cur = head.take();
            while let Some(mut node) = cur {
                cur = node.next.take();
                let new_idx = (node.hash as usize) % new_size;
                node.next = new_buckets[new_idx].take();
                new_buckets[new_idx] = Some(node);
            }
        }

        self.buckets = new_buckets;
        Ok(())
    }
}

impl<K, V> Default for BareMap<K, V>
where
    K: Eq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> std::fmt::Debug for BareMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BareMap")
            .field("n_keys", &self.n_keys)
            .field("n_buckets", &self.buckets.len())
            .field("max_load_factor", &self.max_load_factor)
            .finish()
    }
}

impl<K, V> Drop for BareMap<K, V> {
    fn drop(&mut self) {
        for head in &mut self.buckets {
            drop_chain_iteratively(head.take());
        }
    }
}

fn new_bucket_vec<K, V>(size: usize) -> Vec<Option<Box<Node<K, V>>>> {
    let mut v = Vec::with_capacity(size);
    v.resize_with(size, || None);
    v
}

/// Drops a chain without recursing through `Box`'s default `Drop`, which
/// would blow the stack on a pathologically long chain (e.g. under a hostile
/// or broken hash function).
fn drop_chain_iteratively<K, V>(mut head: Option<Box<Node<K, V>>>) {
    while let Some(mut node) = head {
        head = node.next.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducer::{Keep, Sum};

    fn hash_of(k: u64) -> u64 {
        // A deliberately weak hash so chains actually form in tests.
        k % 97
    }

    #[test]
    fn set_get_has() {
        let mut m: BareMap<u64, u64> = BareMap::new();
        m.set(1, hash_of(1), 10, &Keep).unwrap();
        m.set(2, hash_of(2), 20, &Keep).unwrap();
        assert_eq!(m.get(&1, hash_of(1)), Some(&10));
        assert!(m.has(&2, hash_of(2)));
        assert!(!m.has(&3, hash_of(3)));
        assert_eq!(m.n_keys(), 2);
    }

    #[test]
    fn set_combines_with_reducer() {
        let mut m: BareMap<&str, i64> = BareMap::new();
        m.set("a", 1, 1, &Sum).unwrap();
        m.set("a", 1, 2, &Sum).unwrap();
        m.set("a", 1, 3, &Sum).unwrap();
        assert_eq!(m.get(&"a", 1), Some(&6));
        assert_eq!(m.n_keys(), 1);
    }

    #[test]
    fn unset_splices_node_out() {
        let mut m: BareMap<u64, u64> = BareMap::new();
        m.set(1, hash_of(1), 10, &Keep).unwrap();
        m.set(2, hash_of(2), 20, &Keep).unwrap();
        assert_eq!(m.unset(&1, hash_of(1)), Some(10));
        assert!(!m.has(&1, hash_of(1)));
        assert!(m.has(&2, hash_of(2)));
        assert_eq!(m.n_keys(), 1);
    }

    #[test]
    fn rehash_preserves_all_keys() {
        let mut m: BareMap<u64, u64> = BareMap::new();
        for i in 0..10_000u64 {
            m.set(i, i, i * 2, &Keep).unwrap();
        }
        assert_eq!(m.n_keys(), 10_000);
        assert!(m.n_buckets() as f64 >= 10_000.0 / m.max_load_factor());
        for i in 0..10_000u64 {
            assert_eq!(m.get(&i, i), Some(&(i * 2)));
        }
    }

    #[test]
    fn clear_and_shrink_resets_bucket_count() {
        let mut m: BareMap<u64, u64> = BareMap::new();
        for i in 0..1000u64 {
            m.set(i, i, i, &Keep).unwrap();
        }
        m.clear_and_shrink();
        assert_eq!(m.n_keys(), 0);
        assert_eq!(m.n_buckets(), SMALLEST_PRIME);
    }

    #[test]
    fn for_each_visits_every_pair() {
        let mut m: BareMap<u64, u64> = BareMap::new();
        for i in 0..50u64 {
            m.set(i, i, i, &Keep).unwrap();
        }
        let mut seen = Vec::new();
        m.for_each(|k, v| seen.push((*k, *v)));
        seen.sort();
        assert_eq!(seen, (0..50u64).map(|i| (i, i)).collect::<Vec<_>>());
    }
}
