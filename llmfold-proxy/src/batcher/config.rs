//! Configuration for the batch scheduler.

use std::time::Duration;

use llmfold_core::budget::DEFAULT_OUTPUT_TOKENS;
use llmfold_core::tokens::DEFAULT_CHARS_PER_TOKEN;
use llmfold_core::types::{DEFAULT_TEMPERATURE, DEFAULT_TOP_P};
use llmfold_core::{PromptBudgeter, TokenEstimator};

use crate::config::env_parse;

/// Configuration for the batch scheduler
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// How long a job stays open for more compatible requests
    pub batch_window: Duration,

    /// Maximum number of requests merged into one downstream call
    pub max_batch_size: usize,

    /// Context window of the downstream model, in tokens
    pub context_budget: usize,

    /// Per-item token allowance for tags and separators
    pub meta_overhead: usize,

    /// Output reservation for requests without `max_output_tokens`
    pub default_output_tokens: usize,

    /// Deadline for every downstream call
    pub downstream_timeout: Duration,

    /// Maximum individual fallback calls in flight across all keys
    pub fallback_concurrency: usize,

    /// Characters per token for estimation
    pub chars_per_token: f64,

    /// Temperature applied when the client sends none
    pub default_temperature: f32,

    /// top_p applied when the client sends none
    pub default_top_p: f32,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_millis(50),
            max_batch_size: 8,
            context_budget: 8192,
            meta_overhead: 32,
            default_output_tokens: DEFAULT_OUTPUT_TOKENS,
            downstream_timeout: Duration::from_secs(60),
            fallback_concurrency: 4,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
            default_temperature: DEFAULT_TEMPERATURE,
            default_top_p: DEFAULT_TOP_P,
        }
    }
}

impl BatcherConfig {
    /// Create config optimized for low latency (few concurrent users)
    pub fn low_latency() -> Self {
        Self {
            batch_window: Duration::from_millis(10),
            max_batch_size: 4,
            downstream_timeout: Duration::from_secs(30),
            fallback_concurrency: 2,
            ..Self::default()
        }
    }

    /// Create config optimized for high throughput (many concurrent users)
    pub fn high_throughput() -> Self {
        Self {
            batch_window: Duration::from_millis(100),
            max_batch_size: 16,
            context_budget: 32_768,
            downstream_timeout: Duration::from_secs(120),
            fallback_concurrency: 8,
            ..Self::default()
        }
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = env_parse("LLMFOLD_BATCH_WINDOW_MS") {
            config.batch_window = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<usize>("LLMFOLD_MAX_BATCH_SIZE") {
            config.max_batch_size = n.max(1);
        }
        if let Some(n) = env_parse("LLMFOLD_CONTEXT_BUDGET") {
            config.context_budget = n;
        }
        if let Some(n) = env_parse("LLMFOLD_META_OVERHEAD_TOKENS") {
            config.meta_overhead = n;
        }
        if let Some(n) = env_parse("LLMFOLD_DEFAULT_OUTPUT_TOKENS") {
            config.default_output_tokens = n;
        }
        if let Some(secs) = env_parse("LLMFOLD_DOWNSTREAM_TIMEOUT_SECS") {
            config.downstream_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<usize>("LLMFOLD_FALLBACK_CONCURRENCY") {
            config.fallback_concurrency = n.max(1);
        }
        if let Some(cpt) = env_parse::<f64>("LLMFOLD_CHARS_PER_TOKEN") {
            if cpt > 0.0 {
                config.chars_per_token = cpt;
            }
        }
        if let Some(t) = env_parse("LLMFOLD_DEFAULT_TEMPERATURE") {
            config.default_temperature = t;
        }
        if let Some(p) = env_parse("LLMFOLD_DEFAULT_TOP_P") {
            config.default_top_p = p;
        }

        config
    }

    pub fn estimator(&self) -> TokenEstimator {
        TokenEstimator::new(self.chars_per_token)
    }

    pub fn budgeter(&self) -> PromptBudgeter {
        PromptBudgeter::new(self.estimator(), self.default_output_tokens)
    }
}
