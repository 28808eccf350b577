//! Application state for the llmfold proxy.

use std::sync::Arc;
use std::time::Duration;

use llmfold_core::TokenEstimator;

use crate::batcher::{BatchScheduler, BatcherConfig};
use crate::cache::{CacheConfig, ResponseCache};
use crate::config::{env_bool, env_parse};
use crate::downstream::{DownstreamClient, OpenAiClient};

/// Application state shared across all handlers
pub struct AppState {
    /// Batches requests and answers each caller
    pub scheduler: Arc<BatchScheduler>,

    /// Response cache shared with the scheduler
    pub cache: Arc<ResponseCache>,

    /// Downstream provider client
    pub downstream: Arc<dyn DownstreamClient>,

    /// Token estimator for usage reporting
    pub estimator: TokenEstimator,

    /// Batcher configuration
    pub batcher_config: BatcherConfig,

    /// Cache configuration
    pub cache_config: CacheConfig,

    /// Configuration
    pub config: ProxyConfig,
}

impl AppState {
    /// Create new application state talking to `config.downstream_url`
    pub fn new(config: ProxyConfig, batcher_config: BatcherConfig, cache_config: CacheConfig) -> Self {
        let downstream = Arc::new(OpenAiClient::new(&config.downstream_url, config.api_key.clone()));
        Self::with_downstream(config, batcher_config, cache_config, downstream)
    }

    /// Create application state around an existing downstream client
    pub fn with_downstream(
        config: ProxyConfig,
        batcher_config: BatcherConfig,
        cache_config: CacheConfig,
        downstream: Arc<dyn DownstreamClient>,
    ) -> Self {
        let cache = Arc::new(ResponseCache::new(cache_config.clone()));
        let scheduler = Arc::new(BatchScheduler::new(
            batcher_config.clone(),
            Arc::clone(&downstream),
            Arc::clone(&cache),
        ));

        Self {
            scheduler,
            cache,
            downstream,
            estimator: batcher_config.estimator(),
            batcher_config,
            cache_config,
            config,
        }
    }
}

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Port to listen on
    pub port: u16,

    /// Base URL of the OpenAI-compatible downstream provider
    pub downstream_url: String,

    /// Bearer token for the downstream provider
    pub api_key: Option<String>,

    /// How long a client waits for its answer before getting a 504
    pub request_timeout: Duration,

    /// Enable verbose logging
    pub verbose: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            downstream_url: "http://localhost:11434".to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(300),
            verbose: false,
        }
    }
}

impl ProxyConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            port: env_parse("LLMFOLD_PORT").unwrap_or(defaults.port),
            downstream_url: std::env::var("LLMFOLD_DOWNSTREAM_URL").unwrap_or(defaults.downstream_url),
            api_key: std::env::var("LLMFOLD_API_KEY").ok().filter(|key| !key.is_empty()),
            request_timeout: env_parse("LLMFOLD_REQUEST_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            verbose: env_bool("LLMFOLD_VERBOSE").unwrap_or(defaults.verbose),
        }
    }
}
