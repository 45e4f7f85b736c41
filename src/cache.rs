//! Read-through caches with hit/miss statistics
//!
//! The [`ReadCache`] serves only exact `(branch, keyspace, key, timestamp)`
//! hits: it does no temporal reasoning, since two neighboring timestamps
//! may observe different histories. The [`QueryCache`] keeps index query
//! results per branch. Both are bounded LRU maps; invalidation on commit
//! is conservative (see the policy notes on each method), so a cached
//! entry can go missing but never go stale.

use std::collections::HashMap;
use std::collections::BTreeMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::storage::types::Timestamp;

/// Atomic hit/miss counters
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Point-in-time snapshot of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Minimal bounded LRU map shared by both caches
struct LruMap<K, V> {
    capacity: usize,
    entries: HashMap<K, (V, u64)>,
    by_use: BTreeMap<u64, K>,
    tick: u64,
}

impl<K: Eq + Hash + Clone, V> LruMap<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            by_use: BTreeMap::new(),
            tick: 0,
        }
    }

    fn get(&mut self, key: &K) -> Option<&V> {
        self.tick += 1;
        let tick = self.tick;
        if let Some((_, last_use)) = self.entries.get_mut(key) {
            self.by_use.remove(&*last_use);
            *last_use = tick;
            self.by_use.insert(tick, key.clone());
        }
        self.entries.get(key).map(|(value, _)| value)
    }

    fn insert(&mut self, key: K, value: V) {
        self.tick += 1;
        if let Some((_, old_use)) = self.entries.remove(&key) {
            self.by_use.remove(&old_use);
        }
        self.entries.insert(key.clone(), (value, self.tick));
        self.by_use.insert(self.tick, key);
        while self.entries.len() > self.capacity {
            if let Some((_, coldest)) = self.by_use.pop_first() {
                self.entries.remove(&coldest);
            }
        }
    }

    fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) {
        self.entries.retain(|k, _| keep(k));
        let entries = &self.entries;
        self.by_use.retain(|_, k| entries.contains_key(k));
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.by_use.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ReadCacheKey {
    branch: String,
    keyspace: String,
    key: String,
    timestamp: Timestamp,
}

/// Bounded cache of point-in-time read results
///
/// `None` entries cache definitive absence (tombstone or never written).
///
/// Cached values are shared as `Arc` allocations. When the values are not
/// assumed immutable, lookups hand out a private copy instead of the
/// shared allocation, so a caller mutating its result can never corrupt
/// the cache.
pub struct ReadCache {
    inner: Mutex<LruMap<ReadCacheKey, Option<Arc<Vec<u8>>>>>,
    assume_values_immutable: bool,
    stats: CacheStats,
}

impl ReadCache {
    pub fn new(max_size: usize, assume_values_immutable: bool) -> Self {
        Self {
            inner: Mutex::new(LruMap::new(max_size)),
            assume_values_immutable,
            stats: CacheStats::default(),
        }
    }

    pub fn get(
        &self,
        branch: &str,
        keyspace: &str,
        key: &str,
        timestamp: Timestamp,
    ) -> Option<Option<Arc<Vec<u8>>>> {
        let cache_key = ReadCacheKey {
            branch: branch.to_string(),
            keyspace: keyspace.to_string(),
            key: key.to_string(),
            timestamp,
        };
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.get(&cache_key) {
            Some(cached) => {
                self.stats.record_hit();
                let value = cached.as_ref().map(|value| {
                    if self.assume_values_immutable {
                        Arc::clone(value)
                    } else {
                        Arc::new(value.as_ref().clone())
                    }
                });
                Some(value)
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    pub fn insert(
        &self,
        branch: &str,
        keyspace: &str,
        key: &str,
        timestamp: Timestamp,
        value: Option<Arc<Vec<u8>>>,
    ) {
        let cache_key = ReadCacheKey {
            branch: branch.to_string(),
            keyspace: keyspace.to_string(),
            key: key.to_string(),
            timestamp,
        };
        // without the immutability assumption, keep a private copy rather
        // than sharing the caller's allocation
        let stored = value.map(|bytes| {
            if self.assume_values_immutable {
                bytes
            } else {
                Arc::new(bytes.as_ref().clone())
            }
        });
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.insert(cache_key, stored);
    }

    /// Conservative commit invalidation: drop every cached entry for each
    /// touched `(keyspace, key)` on the committing branch and on all of
    /// its descendants, regardless of timestamp.
    pub fn invalidate(&self, branches: &[String], touched: &[(String, String)]) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.retain(|entry| {
            !(branches.iter().any(|b| *b == entry.branch)
                && touched
                    .iter()
                    .any(|(ks, k)| *ks == entry.keyspace && *k == entry.key))
        });
    }

    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct QueryCacheKey {
    branch: String,
    keyspace: String,
    timestamp: Timestamp,
    spec: String,
}

/// Bounded cache of index query results (matching keys per search spec)
pub struct QueryCache {
    inner: Mutex<LruMap<QueryCacheKey, Arc<Vec<String>>>>,
    stats: CacheStats,
}

impl QueryCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(LruMap::new(max_size)),
            stats: CacheStats::default(),
        }
    }

    pub fn get(
        &self,
        branch: &str,
        keyspace: &str,
        timestamp: Timestamp,
        spec_key: &str,
    ) -> Option<Arc<Vec<String>>> {
        let cache_key = QueryCacheKey {
            branch: branch.to_string(),
            keyspace: keyspace.to_string(),
            timestamp,
            spec: spec_key.to_string(),
        };
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.get(&cache_key) {
            Some(result) => {
                self.stats.record_hit();
                Some(Arc::clone(result))
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    pub fn insert(
        &self,
        branch: &str,
        keyspace: &str,
        timestamp: Timestamp,
        spec_key: &str,
        result: Arc<Vec<String>>,
    ) {
        let cache_key = QueryCacheKey {
            branch: branch.to_string(),
            keyspace: keyspace.to_string(),
            timestamp,
            spec: spec_key.to_string(),
        };
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.insert(cache_key, result);
    }

    /// Commit invalidation: drop entries of the committing branch and its
    /// descendants. A commit on a child never touches entries of its
    /// ancestors or of unrelated branches.
    pub fn invalidate_branches(&self, branches: &[String]) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.retain(|entry| !branches.iter().any(|b| *b == entry.branch));
    }

    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }
}
