//! Configuration for the response cache.

use std::time::Duration;

use crate::config::{env_bool, env_parse};

/// Configuration for the response cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Whether answers are cached at all
    pub enabled: bool,

    /// Maximum number of entries
    pub max_entries: usize,

    /// Time-to-live for new entries
    pub ttl: Duration,

    /// How often expired entries are swept
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1000,
            ttl: Duration::from_secs(3600), // 1 hour
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Create config optimized for low memory usage
    pub fn low_memory() -> Self {
        Self {
            enabled: true,
            max_entries: 100,
            ttl: Duration::from_secs(1800), // 30 minutes
            sweep_interval: Duration::from_secs(30),
        }
    }

    /// Create config optimized for high cache hit rate
    pub fn high_hit_rate() -> Self {
        Self {
            enabled: true,
            max_entries: 5000,
            ttl: Duration::from_secs(7200), // 2 hours
            sweep_interval: Duration::from_secs(120),
        }
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(enabled) = env_bool("LLMFOLD_CACHE_ENABLED") {
            config.enabled = enabled;
        }
        if let Some(n) = env_parse("LLMFOLD_CACHE_SIZE") {
            config.max_entries = n;
        }
        if let Some(secs) = env_parse("LLMFOLD_CACHE_TTL_SECS") {
            config.ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("LLMFOLD_CACHE_SWEEP_SECS") {
            config.sweep_interval = Duration::from_secs(secs.max(1));
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_entries, 1000);
        assert_eq!(config.ttl, Duration::from_secs(3600));
    }

    #[test]
    fn test_low_memory_config() {
        let config = CacheConfig::low_memory();
        assert_eq!(config.max_entries, 100);
    }

    #[test]
    fn test_high_hit_rate_config() {
        let config = CacheConfig::high_hit_rate();
        assert_eq!(config.max_entries, 5000);
        assert!(config.ttl > CacheConfig::default().ttl);
    }
}
