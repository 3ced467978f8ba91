//! A small concurrent LRU cache used for CEL environments and compiled
//! programs.
//!
//! Entries are handed out as [`Arc`]s, so an in-flight render keeps its
//! environment or program alive even when the cache evicts it. A capacity of
//! zero disables caching entirely; every lookup then builds a fresh value.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex, PoisonError},
};

pub(crate) struct LruCache<K, V> {
    capacity: usize,
    inner: Mutex<Inner<K, V>>,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    clock: u64,
}

struct Entry<V> {
    value: Arc<V>,
    last_used: u64,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                clock: 0,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns the cached value for `key`, or builds, publishes and returns
    /// a fresh one. The builder runs outside the lock; concurrent misses on
    /// the same key may build twice, the last publish wins. Entries are
    /// immutable once published, so either result is safe to use.
    pub fn get_or_try_insert_with<E>(
        &self,
        key: &K,
        build: impl FnOnce() -> Result<V, E>,
    ) -> Result<Arc<V>, E> {
        if self.capacity == 0 {
            return Ok(Arc::new(build()?));
        }

        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        tracing::trace!("cache miss, building entry");
        let value = Arc::new(build()?);
        self.insert(key.clone(), Arc::clone(&value));
        Ok(value)
    }

    fn get(&self, key: &K) -> Option<Arc<V>> {
        let mut inner = self.lock();
        inner.clock += 1;
        let clock = inner.clock;
        inner.entries.get_mut(key).map(|entry| {
            entry.last_used = clock;
            Arc::clone(&entry.value)
        })
    }

    fn insert(&self, key: K, value: Arc<V>) {
        let mut inner = self.lock();
        inner.clock += 1;
        let clock = inner.clock;

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            // Evict the least recently used entry. Holders of the evicted
            // Arc are unaffected.
            if let Some(lru_key) = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone())
            {
                inner.entries.remove(&lru_key);
            }
        }

        inner.entries.insert(
            key,
            Entry {
                value,
                last_used: clock,
            },
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
