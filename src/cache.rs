//! Run-scoped concurrent caches
//!
//! All caches are shared by every worker and never expire within a run.
//! Inserts are first-write-wins: a racing second writer gets the value that
//! is already stored back, so one key never maps to two different values.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::common_types::IdentityRecord;
use crate::directory::SidTranslation;

#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total > 0.0 { hits / total } else { 0.0 }
    }
}

/// Concurrent map with first-write-wins inserts and hit/miss accounting
pub struct SharedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    cache: DashMap<K, V>,
    stats: Arc<CacheStats>,
}

impl<K, V> Default for SharedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> SharedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        match self.cache.get(key) {
            Some(entry) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value().clone())
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert unless the key is already present; returns the stored value.
    pub fn get_or_insert(&self, key: K, value: V) -> V {
        self.cache.entry(key).or_insert(value).value().clone()
    }

    /// Snapshot of the stored values
    pub fn values(&self) -> Vec<V> {
        self.cache.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.cache.contains_key(key)
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        self.stats.clone()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Identity cache key: SID plus the (uppercased) domain scope it was resolved in
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct IdentityKey {
    pub sid: String,
    pub scope: String,
}

impl IdentityKey {
    pub fn new(sid: &str, scope: &str) -> Self {
        Self {
            sid: sid.to_string(),
            scope: scope.to_uppercase(),
        }
    }
}

/// Identity caches shared by one scan; the probe cache lives in `HostGate`
#[derive(Default)]
pub struct ScanCaches {
    /// SID -> generic translation, `None` when translation failed
    pub sid_names: SharedCache<String, Option<SidTranslation>>,
    pub identities: SharedCache<IdentityKey, IdentityRecord>,
}

impl ScanCaches {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common_types::ObjectType;

    #[test]
    fn test_first_write_wins() {
        let cache: SharedCache<String, i32> = SharedCache::new();
        assert_eq!(cache.get_or_insert("k".to_string(), 1), 1);
        assert_eq!(cache.get_or_insert("k".to_string(), 2), 1);
        assert_eq!(cache.get(&"k".to_string()), Some(1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_stats_track_hits_and_misses() {
        let cache: SharedCache<String, bool> = SharedCache::new();
        assert_eq!(cache.get(&"ws01".to_string()), None);
        cache.get_or_insert("ws01".to_string(), true);
        assert_eq!(cache.get(&"ws01".to_string()), Some(true));

        let stats = cache.stats();
        assert_eq!(stats.hits(), 1);
        assert_eq!(stats.misses(), 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_identity_key_scope_is_case_insensitive() {
        let caches = ScanCaches::new();
        let record = IdentityRecord {
            display_name: "ALICE@CORP.LOCAL".to_string(),
            object_type: ObjectType::User,
            sid: "S-1-5-21-1-2-3-1104".to_string(),
        };
        caches
            .identities
            .get_or_insert(IdentityKey::new("S-1-5-21-1-2-3-1104", "corp.local"), record.clone());
        assert_eq!(
            caches.identities.get(&IdentityKey::new("S-1-5-21-1-2-3-1104", "CORP.LOCAL")),
            Some(record)
        );
    }

    #[test]
    fn test_concurrent_inserts_keep_one_value() {
        let cache: Arc<SharedCache<String, usize>> = Arc::new(SharedCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.get_or_insert("key".to_string(), i))
            })
            .collect();
        let results: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(cache.get(&"key".to_string()), Some(results[0]));
    }
}
