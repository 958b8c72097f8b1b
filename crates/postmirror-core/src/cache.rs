//! TTL response cache for the hybrid read path

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::classify::Origin;

/// Entries above this count trigger a sweep of expired entries on insert
pub const SWEEP_THRESHOLD: usize = 100;

/// Cache key scheme, one fingerprint per read operation and identifier
pub struct CacheKey;

impl CacheKey {
    pub const PREFIX: &'static str = "hybrid:";
    pub const COLLECTION: &'static str = "hybrid:records";

    pub fn record(id: &str) -> String {
        format!("hybrid:record:{id}")
    }

    pub fn detail(slug: &str) -> String {
        format!("hybrid:record:{slug}:detail")
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    data: V,
    origin: Origin,
    stored_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) <= self.ttl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub fresh: usize,
}

/// Map of fingerprint to value, valid while `now - stored_at <= ttl`.
///
/// Stale entries are purged lazily on lookup, or by a sweep once the map
/// grows past [`SWEEP_THRESHOLD`].
pub struct ResponseCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    sweep_threshold: usize,
}

impl<V: Clone> ResponseCache<V> {
    pub fn new() -> Self {
        Self::with_sweep_threshold(SWEEP_THRESHOLD)
    }

    pub fn with_sweep_threshold(sweep_threshold: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            sweep_threshold,
        }
    }

    /// Fresh value and the origin it was fetched from
    pub fn get(&self, key: &str) -> Option<(V, Origin)> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_fresh(now) => Some((entry.data.clone(), entry.origin)),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store a value; a zero TTL is never cached
    pub fn insert(&self, key: impl Into<String>, data: V, origin: Origin, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.insert(
            key.into(),
            CacheEntry {
                data,
                origin,
                stored_at: now,
                ttl,
            },
        );
        if entries.len() > self.sweep_threshold {
            let before = entries.len();
            entries.retain(|_, entry| entry.is_fresh(now));
            tracing::debug!(removed = before - entries.len(), "Swept expired cache entries");
        }
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        before - entries.len()
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let removed = entries.len();
        entries.clear();
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let entries = self.entries.lock();
        CacheStats {
            entries: entries.len(),
            fresh: entries.values().filter(|entry| entry.is_fresh(now)).count(),
        }
    }
}

impl<V: Clone> Default for ResponseCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = ResponseCache::new();
        cache.insert("k", 1, Origin::Mirror, Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.get("k"), Some((1, Origin::Mirror)));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_expired_entries_past_threshold() {
        let cache = ResponseCache::with_sweep_threshold(2);
        cache.insert("a", 1, Origin::Mirror, Duration::from_secs(1));
        cache.insert("b", 2, Origin::Mirror, Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(2)).await;

        cache.insert("c", 3, Origin::Source, Duration::from_secs(60));

        assert_eq!(cache.stats(), CacheStats { entries: 1, fresh: 1 });
    }

    #[test]
    fn invalidation_by_key_and_prefix() {
        let cache = ResponseCache::new();
        let ttl = Duration::from_secs(60);
        cache.insert(CacheKey::COLLECTION, 0, Origin::Mirror, ttl);
        cache.insert(CacheKey::record("n1"), 1, Origin::Mirror, ttl);
        cache.insert(CacheKey::detail("hello"), 2, Origin::Source, ttl);

        assert!(cache.invalidate(CacheKey::COLLECTION));
        assert!(!cache.invalidate(CacheKey::COLLECTION));
        assert_eq!(cache.invalidate_prefix("hybrid:record:"), 2);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn zero_ttl_is_not_cached() {
        let cache = ResponseCache::new();
        cache.insert("k", 1, Origin::Mirror, Duration::ZERO);
        assert_eq!(cache.get("k"), None);
    }
}
