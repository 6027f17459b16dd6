use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// Callback invoked with the key and value of every evicted entry.
pub type EvictionCallback<V> = Box<dyn Fn(&str, &V) + Send + Sync>;

/// Bounded LRU cache keyed by string, with optional TTL.
///
/// Entries are promoted on read and on update. When the size bound is
/// exceeded the least recently used entry is evicted. Expired entries
/// return a miss but are not proactively evicted; `evict_expired` sweeps
/// them out (the cache-cleanup background task calls it periodically).
pub struct LruCache<V> {
    inner: Mutex<CacheInner<V>>,
    max_entries: usize,
    ttl: Option<Duration>,
    on_evict: Option<EvictionCallback<V>>,
}

struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// Recency order: stamp -> key, oldest first.
    order: BTreeMap<u64, String>,
    next_stamp: u64,
    stats: CacheStats,
}

struct CacheEntry<V> {
    value: V,
    stamp: u64,
    inserted_at: Instant,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl<V: Clone> LruCache<V> {
    pub fn new(max_entries: usize, ttl: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_stamp: 0,
                stats: CacheStats::default(),
            }),
            max_entries: max_entries.max(1),
            ttl,
            on_evict: None,
        }
    }

    pub fn with_eviction_callback(mut self, callback: EvictionCallback<V>) -> Self {
        self.on_evict = Some(callback);
        self
    }

    /// Look up a key, promoting it on hit. Expired entries miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        let expired = match inner.entries.get(key) {
            None => {
                inner.stats.misses += 1;
                return None;
            }
            Some(entry) => self.is_expired(entry),
        };

        if expired {
            inner.stats.misses += 1;
            inner.stats.expired += 1;
            return None;
        }

        let stamp = inner.bump_stamp();
        let Some(entry) = inner.entries.get_mut(key) else {
            inner.stats.misses += 1;
            return None;
        };
        let old_stamp = std::mem::replace(&mut entry.stamp, stamp);
        let value = entry.value.clone();
        inner.order.remove(&old_stamp);
        inner.order.insert(stamp, key.to_string());
        inner.stats.hits += 1;
        Some(value)
    }

    /// Insert or replace a key, promoting it. Evicts the LRU entry when the
    /// bound is exceeded.
    pub fn insert(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let mut evicted = None;

        {
            let mut inner = self.inner.lock();
            let stamp = inner.bump_stamp();

            if let Some(old) = inner.entries.insert(
                key.clone(),
                CacheEntry {
                    value,
                    stamp,
                    inserted_at: Instant::now(),
                },
            ) {
                inner.order.remove(&old.stamp);
            }
            inner.order.insert(stamp, key);

            if inner.entries.len() > self.max_entries {
                if let Some((&oldest_stamp, _)) = inner.order.iter().next() {
                    if let Some(oldest_key) = inner.order.remove(&oldest_stamp) {
                        if let Some(entry) = inner.entries.remove(&oldest_key) {
                            inner.stats.evictions += 1;
                            evicted = Some((oldest_key, entry.value));
                        }
                    }
                }
            }
            inner.stats.entries = inner.entries.len();
        }

        // Callback runs outside the lock.
        if let (Some(callback), Some((key, value))) = (&self.on_evict, &evicted) {
            callback(key, value);
        }
    }

    /// Remove a key without counting it as an eviction.
    pub fn remove(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.remove(key)?;
        inner.order.remove(&entry.stamp);
        inner.stats.entries = inner.entries.len();
        Some(entry.value)
    }

    /// Sweep out every expired entry, reporting how many were removed.
    pub fn evict_expired(&self) -> usize {
        let Some(_) = self.ttl else { return 0 };

        let mut removed = Vec::new();
        {
            let mut inner = self.inner.lock();
            let expired_keys: Vec<String> = inner
                .entries
                .iter()
                .filter(|(_, entry)| self.is_expired(entry))
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired_keys {
                if let Some(entry) = inner.entries.remove(&key) {
                    inner.order.remove(&entry.stamp);
                    inner.stats.evictions += 1;
                    inner.stats.expired += 1;
                    removed.push((key, entry.value));
                }
            }
            inner.stats.entries = inner.entries.len();
        }

        if let Some(callback) = &self.on_evict {
            for (key, value) in &removed {
                callback(key, value);
            }
        }
        removed.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
        inner.stats.entries = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self.inner.lock().stats.clone();
        stats.entries = self.len();
        stats
    }

    fn is_expired(&self, entry: &CacheEntry<V>) -> bool {
        match self.ttl {
            Some(ttl) => entry.inserted_at.elapsed() > ttl,
            None => false,
        }
    }
}

impl<V> CacheInner<V> {
    fn bump_stamp(&mut self) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        stamp
    }
}
