//! Fingerprint-keyed cache using LRU eviction and TTL expiration.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use llmfold_core::Fingerprint;

use super::metrics::CacheMetrics;

/// A cached answer with its own time-to-live
struct CachedEntry {
    text: String,
    created_at: Instant,
    ttl: Duration,
}

impl CachedEntry {
    fn new(text: String, ttl: Duration) -> Self {
        Self { text, created_at: Instant::now(), ttl }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }
}

/// Exact match cache
///
/// O(1) lookup by request fingerprint. When full, the least recently used
/// entry is evicted. Expired entries are never returned: they are dropped on
/// lookup and by [`ExactCache::evict_expired`].
pub struct ExactCache {
    cache: LruCache<Fingerprint, CachedEntry>,
    metrics: Arc<CacheMetrics>,
}

impl ExactCache {
    /// Create a new exact cache holding at most `capacity` entries
    pub fn new(capacity: usize, metrics: Arc<CacheMetrics>) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self { cache: LruCache::new(capacity), metrics }
    }

    /// Look up an answer, treating expired entries as absent
    pub fn get(&mut self, fingerprint: &Fingerprint) -> Option<String> {
        let now = Instant::now();

        let expired = match self.cache.get(fingerprint) {
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => return Some(entry.text.clone()),
            None => return None,
        };

        if expired {
            self.cache.pop(fingerprint);
            self.metrics.record_expiration();
        }
        None
    }

    /// Store an answer; a zero TTL stores nothing
    pub fn put(&mut self, fingerprint: Fingerprint, text: String, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }

        if let Some((evicted, _)) = self.cache.push(fingerprint, CachedEntry::new(text, ttl)) {
            // push returns the old value when the key was already present
            if evicted != fingerprint {
                self.metrics.record_eviction();
            }
        }
        self.metrics.record_put();
    }

    /// Get the current number of entries
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Clear all entries
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Remove expired entries (call periodically for cleanup)
    pub fn evict_expired(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<Fingerprint> = self
            .cache
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| *key)
            .collect();

        for key in &expired {
            self.cache.pop(key);
            self.metrics.record_expiration();
        }

        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn cache(capacity: usize) -> ExactCache {
        ExactCache::new(capacity, Arc::new(CacheMetrics::new()))
    }

    fn fp(n: u64) -> Fingerprint {
        Fingerprint::from(n)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit() {
        let mut cache = cache(100);
        cache.put(fp(1), "Hi there!".to_string(), HOUR);
        assert_eq!(cache.get(&fp(1)), Some("Hi there!".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_miss() {
        let mut cache = cache(100);
        assert!(cache.get(&fp(1)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_eviction() {
        let mut cache = cache(2);

        cache.put(fp(1), "1".to_string(), HOUR);
        cache.put(fp(2), "2".to_string(), HOUR);
        // Touch 1 so 2 becomes least recently used
        assert!(cache.get(&fp(1)).is_some());
        cache.put(fp(3), "3".to_string(), HOUR);

        assert!(cache.get(&fp(2)).is_none());
        assert!(cache.get(&fp(1)).is_some());
        assert!(cache.get(&fp(3)).is_some());
        assert_eq!(cache.metrics.snapshot().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_is_not_eviction() {
        let mut cache = cache(2);
        cache.put(fp(1), "old".to_string(), HOUR);
        cache.put(fp(1), "new".to_string(), HOUR);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&fp(1)), Some("new".to_string()));
        assert_eq!(cache.metrics.snapshot().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiration() {
        let mut cache = cache(100);
        cache.put(fp(1), "Hi!".to_string(), Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.get(&fp(1)).is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get(&fp(1)).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.metrics.snapshot().expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_entry_ttl() {
        let mut cache = cache(100);
        cache.put(fp(1), "short".to_string(), Duration::from_secs(1));
        cache.put(fp(2), "long".to_string(), Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cache.get(&fp(1)).is_none());
        assert!(cache.get(&fp(2)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_not_stored() {
        let mut cache = cache(100);
        cache.put(fp(1), "x".to_string(), Duration::ZERO);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired() {
        let mut cache = cache(100);
        cache.put(fp(1), "a".to_string(), Duration::from_secs(1));
        cache.put(fp(2), "b".to_string(), Duration::from_secs(1));
        cache.put(fp(3), "c".to_string(), HOUR);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.evict_expired(), 2);
        assert_eq!(cache.len(), 1);
    }
}
