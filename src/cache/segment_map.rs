use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

/// Shards per available CPU when no explicit count is given.
const SHARDS_PER_CPU: usize = 16;

pub fn default_shard_count() -> usize {
    let parallelism = thread::available_parallelism().map_or(1, |n| n.get());

    parallelism * SHARDS_PER_CPU
}

/// Shard selector for string keys.
pub fn hash_string(key: &String) -> u64 {
    crc32fast::hash(key.as_bytes()) as u64
}

/// Concurrent map split into independently locked shards.
///
/// The shard count is fixed at construction and keys are routed by the
/// supplied hash function, so every operation only locks the shard owning the
/// key. The total size is kept in an atomic counter.
pub struct SegmentMap<K, V> {
    shards: Vec<Mutex<HashMap<K, V>>>,
    hasher: fn(&K) -> u64,
    size: AtomicUsize,
}

impl<K, V> SegmentMap<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(shard_count: usize, hasher: fn(&K) -> u64) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();

        Self {
            shards,
            hasher,
            size: AtomicUsize::new(0),
        }
    }

    pub fn with_default_shards(hasher: fn(&K) -> u64) -> Self {
        Self::new(default_shard_count(), hasher)
    }

    fn shard(&self, key: &K) -> &Mutex<HashMap<K, V>> {
        let index = (self.hasher)(key) as usize % self.shards.len();

        &self.shards[index]
    }

    /// Inserts or overwrites, returning the previous value.
    pub fn store(&self, key: K, value: V) -> Option<V> {
        let previous = self.shard(&key).lock().insert(key, value);

        if previous.is_none() {
            self.size.fetch_add(1, Ordering::Relaxed);
        }

        previous
    }

    pub fn load(&self, key: &K) -> Option<V> {
        self.shard(key).lock().get(key).cloned()
    }

    pub fn delete(&self, key: &K) -> Option<V> {
        let removed = self.shard(key).lock().remove(key);

        if removed.is_some() {
            self.size.fetch_sub(1, Ordering::Relaxed);
        }

        removed
    }

    /// Inserts `value` unless `key` is taken. Returns the value now stored
    /// and whether this call inserted it.
    pub fn put_if_absent(&self, key: K, value: V) -> (V, bool) {
        let mut shard = self.shard(&key).lock();

        if let Some(existing) = shard.get(&key) {
            return (existing.clone(), false);
        }

        shard.insert(key, value.clone());
        self.size.fetch_add(1, Ordering::Relaxed);

        (value, true)
    }

    /// Replaces the value under `key` with `update(previous)` while holding
    /// the shard lock, so concurrent upserts of one key are serialized.
    pub fn upsert(&self, key: K, update: impl FnOnce(Option<&V>) -> V) -> V {
        let mut shard = self.shard(&key).lock();
        let next = update(shard.get(&key));

        if shard.insert(key, next.clone()).is_none() {
            self.size.fetch_add(1, Ordering::Relaxed);
        }

        next
    }

    /// Removes the entry under `key` only if `predicate` accepts its value.
    pub fn delete_if(&self, key: &K, predicate: impl FnOnce(&V) -> bool) -> Option<V> {
        let mut shard = self.shard(key).lock();

        if !shard.get(key).is_some_and(predicate) {
            return None;
        }

        let removed = shard.remove(key);
        self.size.fetch_sub(1, Ordering::Relaxed);

        removed
    }

    /// Visits every entry, one shard lock at a time.
    ///
    /// `visit` runs under the shard lock and must not touch this map.
    pub fn range(&self, mut visit: impl FnMut(&K, &V)) {
        for shard in &self.shards {
            let shard = shard.lock();
            for (key, value) in shard.iter() {
                visit(key, value);
            }
        }
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock();
            let removed = shard.len();
            shard.clear();
            self.size.fetch_sub(removed, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}
