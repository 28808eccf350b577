//! llmfold proxy - request-batching middleware for OpenAI-compatible backends.
//!
//! This proxy sits between your application and a text-generation provider:
//! - Merges compatible concurrent requests into one downstream call
//! - Fits oversized prompts into the context budget
//! - Caches duplicate calls
//! - Exposes OpenAI-compatible and Prometheus endpoints
//!
//! ## Quick Start
//!
//! ```bash
//! # Start with defaults (port 8000, downstream at localhost:11434)
//! llmfold-proxy
//!
//! # Custom configuration
//! LLMFOLD_DOWNSTREAM_URL=https://api.example.com LLMFOLD_API_KEY=sk-... \
//!     LLMFOLD_BATCH_WINDOW_MS=80 LLMFOLD_PORT=9000 llmfold-proxy
//! ```
//!
//! ## Usage with OpenAI clients
//!
//! ```python
//! from openai import OpenAI
//!
//! client = OpenAI(
//!     base_url="http://localhost:8000/v1",
//!     api_key="not-needed"
//! )
//!
//! response = client.chat.completions.create(
//!     model="llama3.2:3b",
//!     messages=[{"role": "user", "content": "Hello!"}]
//! )
//! ```

use llmfold_proxy::{run_server, ServerConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = ServerConfig::from_env();

    // Initialize logging
    let default_filter = if config.proxy.verbose {
        "llmfold_proxy=debug,tower_http=debug"
    } else {
        "llmfold_proxy=info,tower_http=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    run_server(config).await
}
