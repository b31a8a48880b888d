//! Fixed-capacity LRU caches for index and grain data.
//!
//! Grain tables and decompressed grains are materialized lazily and may be
//! large; each cache holds a small fixed number of entries and evicts the
//! least recently used value on insert. Lookups refresh recency.

use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;

/// A bounded LRU mapping from `K` to an owned `V`.
///
/// Values are owned by the cache; borrowed access returned by [`get`] is
/// only valid until the next mutation.
///
/// [`get`]: BoundedCache::get
#[derive(Debug)]
pub struct BoundedCache<K: Hash + Eq, V> {
    inner: LruCache<K, V>,
}

impl<K: Hash + Eq, V> BoundedCache<K, V> {
    /// Create a cache holding at most `capacity` entries.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).expect("cache capacity must be non-zero");
        Self {
            inner: LruCache::new(capacity),
        }
    }

    /// Look up `key`, marking it most recently used on a hit.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.inner.get(key).map(|v| &*v)
    }

    /// Insert `value` under `key`, evicting the least recently used entry
    /// if the cache is full.
    pub fn put(&mut self, key: K, value: V) {
        self.inner.put(key, value);
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// The fixed capacity.
    pub fn capacity(&self) -> usize {
        self.inner.cap().get()
    }
}
