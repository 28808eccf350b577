//! Response caching for the llmfold proxy.
//!
//! Answers are keyed by the request [`Fingerprint`] (model, messages and
//! sampling parameters). A hit bypasses batching entirely.
//!
//! # Architecture
//!
//! ```text
//! Incoming Request
//!        │
//!        ▼
//! ┌──────────────┐
//! │ Exact Cache  │ ─── Fingerprint lookup, lazy TTL check
//! │   (LRU)      │
//! └──────┬───────┘
//!        │ Miss
//!        ▼
//!   Batch scheduler
//! ```
//!
//! Expiry is enforced twice: on lookup (an expired entry is never returned)
//! and by a background sweep that reclaims memory for entries nobody asks for.

mod config;
mod exact;
mod metrics;

pub use config::CacheConfig;
pub use exact::ExactCache;
pub use metrics::{CacheMetrics, CacheStats};

use std::sync::Arc;
use std::time::Duration;

use llmfold_core::Fingerprint;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::metrics::prometheus;

/// Shared, internally serialized response cache
pub struct ResponseCache {
    exact: Mutex<ExactCache>,
    metrics: Arc<CacheMetrics>,
    config: CacheConfig,
}

impl ResponseCache {
    /// Create a new response cache with the given configuration
    pub fn new(config: CacheConfig) -> Self {
        let metrics = Arc::new(CacheMetrics::new());
        let exact = Mutex::new(ExactCache::new(config.max_entries, metrics.clone()));
        Self { exact, metrics, config }
    }

    /// Look up a cached answer
    ///
    /// `Some` is a hit; `None` covers absent, expired and disabled.
    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<String> {
        if !self.config.enabled {
            return None;
        }

        let found = self.exact.lock().await.get(fingerprint);
        match found {
            Some(text) => {
                self.metrics.record_hit();
                tracing::debug!(fingerprint = %fingerprint, "Cache hit");
                Some(text)
            }
            None => {
                self.metrics.record_miss();
                None
            }
        }
    }

    /// Store an answer with an explicit time-to-live
    pub async fn put(&self, fingerprint: Fingerprint, text: String, ttl: Duration) {
        if !self.config.enabled {
            return;
        }

        let size = {
            let mut exact = self.exact.lock().await;
            exact.put(fingerprint, text, ttl);
            exact.len()
        };
        prometheus::set_cache_size(size as u64);
    }

    /// Store an answer with the configured time-to-live
    pub async fn insert(&self, fingerprint: Fingerprint, text: String) {
        self.put(fingerprint, text, self.config.ttl).await;
    }

    /// Remove expired entries now
    pub async fn sweep(&self) -> usize {
        let (removed, size) = {
            let mut exact = self.exact.lock().await;
            (exact.evict_expired(), exact.len())
        };
        prometheus::set_cache_size(size as u64);
        removed
    }

    /// Spawn the periodic expiry sweep
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = cache.config.sweep_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = cache.sweep().await;
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired cache entries");
                }
            }
        })
    }

    /// Number of entries currently stored
    pub async fn len(&self) -> usize {
        self.exact.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.exact.lock().await.is_empty()
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        self.metrics.snapshot()
    }

    /// Clear all entries and statistics
    pub async fn clear(&self) {
        self.exact.lock().await.clear();
        self.metrics.reset();
        prometheus::set_cache_size(0);
    }

    /// Get the cache configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}
