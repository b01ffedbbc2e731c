use moka::ops::compute::Op;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use std::fmt;

/// Host-keyed LRU of answer lists. Each key keeps at most `per_key` values,
/// dropping its oldest value first; the least recently used key goes when
/// more than `capacity` keys are present.
pub struct LruCache<V> {
    entries: Cache<String, Vec<V>>,
    capacity: usize,
    per_key: usize,
}

impl<V> fmt::Debug for LruCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruCache")
            .field("capacity", &self.capacity)
            .field("per_key", &self.per_key)
            .finish()
    }
}

impl<V: Clone + Send + Sync + 'static> LruCache<V> {
    pub fn new(capacity: usize, per_key: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Cache::builder()
                .max_capacity(capacity as u64)
                .eviction_policy(EvictionPolicy::lru())
                .build(),
            capacity,
            per_key: per_key.max(1),
        }
    }

    pub fn put(&self, key: &str, value: V) {
        let per_key = self.per_key;
        self.entries.entry_by_ref(key).and_upsert_with(|entry| {
            let mut values = entry.map(|entry| entry.into_value()).unwrap_or_default();
            if values.len() >= per_key {
                values.remove(0);
            }
            values.push(value);
            values
        });
        // Evictions are applied by housekeeping; keep the bound exact.
        self.entries.run_pending_tasks();
    }

    /// Returns the values for `key` and marks it most recently used.
    pub fn get(&self, key: &str) -> Vec<V> {
        self.entries.get(key).unwrap_or_default()
    }

    /// Presence check that leaves recency untouched.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Rewrites the values of `key` atomically. A key left without values is
    /// removed.
    pub fn update(&self, key: &str, apply: impl FnOnce(&mut Vec<V>)) {
        self.entries.entry_by_ref(key).and_compute_with(|entry| {
            let Some(entry) = entry else {
                return Op::Nop;
            };
            let mut values = entry.into_value();
            apply(&mut values);
            if values.is_empty() {
                Op::Remove
            } else {
                Op::Put(values)
            }
        });
        self.entries.run_pending_tasks();
    }

    pub fn delete(&self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        self.entries.run_pending_tasks();
        removed
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks();
    }

    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        self.entries.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
