//! llmfold Proxy Library
//!
//! Request-batching and token-budgeting proxy for OpenAI-compatible
//! backends.
//!
//! This library provides the core functionality for the llmfold proxy,
//! which can be used either as a standalone binary or started from the
//! `llmfold` CLI.

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

pub mod batcher;
pub mod cache;
pub mod config;
pub mod convert;
pub mod downstream;
pub mod error;
pub mod metrics;
pub mod routes;
pub mod state;
pub mod types;

pub use batcher::{BatchScheduler, BatcherConfig, PendingResult};
pub use cache::{CacheConfig, ResponseCache};
pub use downstream::{DownstreamClient, OpenAiClient};
pub use error::{DownstreamError, ProxyError, SchedulerError};
pub use state::{AppState, ProxyConfig};

/// Server configuration for the proxy
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Listener and downstream settings
    pub proxy: ProxyConfig,
    /// Batching behaviour
    pub batcher: BatcherConfig,
    /// Response cache
    pub cache: CacheConfig,
    /// Whether to print the banner on startup
    pub print_banner: bool,
}

impl ServerConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            proxy: ProxyConfig::from_env(),
            batcher: BatcherConfig::from_env(),
            cache: CacheConfig::from_env(),
            print_banner: true,
        }
    }
}

/// Initialize Prometheus metrics registry.
/// Should be called once before starting the server.
pub fn init_metrics() {
    if let Err(e) = metrics::register_metrics() {
        warn!("Failed to register Prometheus metrics: {}", e);
    }
}

/// Build the HTTP router over shared application state
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(routes::health))
        .route("/ready", get(routes::ready))
        .route("/live", get(routes::live))
        .route("/metrics", get(routes::metrics))
        .route("/metrics/prometheus", get(routes::metrics_prometheus))
        // OpenAI-compatible endpoints
        .route("/v1/chat/completions", post(routes::chat_completions))
        // Middleware
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the llmfold proxy server.
///
/// This function starts the HTTP server and blocks until it's shut down.
/// On Ctrl-C every open batch is dispatched at once and in-flight requests
/// are drained before returning.
///
/// # Example
/// ```no_run
/// use llmfold_proxy::{run_server, ServerConfig};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     run_server(ServerConfig::from_env()).await
/// }
/// ```
pub async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    // Initialize Prometheus metrics
    init_metrics();

    info!(
        port = config.proxy.port,
        downstream_url = %config.proxy.downstream_url,
        "Starting llmfold proxy v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Create application state
    let state = Arc::new(AppState::new(
        config.proxy.clone(),
        config.batcher.clone(),
        config.cache.clone(),
    ));

    // Check downstream connectivity
    match state.downstream.health_check().await {
        Ok(_) => {
            metrics::set_backend_healthy(true);
            info!("Connected to downstream at {}", config.proxy.downstream_url);
        }
        Err(e) => {
            metrics::set_backend_healthy(false);
            warn!(
                "Could not reach downstream at {}: {}. \
                 Proxy will start anyway and retry on requests.",
                config.proxy.downstream_url, e
            );
        }
    }

    let sweeper = state.cache.spawn_sweeper();
    let app = build_router(state.clone());

    // Start server
    let addr = format!("0.0.0.0:{}", config.proxy.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("llmfold proxy listening on http://{}", addr);
    info!("OpenAI API: http://{}/v1/chat/completions", addr);
    info!("Health:     http://{}/health", addr);

    if config.print_banner {
        print_banner(&config);
    }

    let scheduler = Arc::clone(&state.scheduler);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(scheduler))
        .await?;

    sweeper.abort();
    info!("llmfold proxy stopped");

    Ok(())
}

/// Resolve on Ctrl-C, after dispatching every open batch
async fn shutdown_signal(scheduler: Arc<BatchScheduler>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }

    info!("Shutdown requested, flushing open batches");
    scheduler.flush_all();
}

/// Print the startup banner
fn print_banner(config: &ServerConfig) {
    let addr = format!("0.0.0.0:{}", config.proxy.port);
    let batcher = &config.batcher;
    let cache = &config.cache;

    println!();
    println!("==================================================");
    println!("  llmfold proxy v{}", env!("CARGO_PKG_VERSION"));
    println!("==================================================");
    println!("  Listening on: http://{}", addr);
    println!("  Downstream:   {}", config.proxy.downstream_url);
    println!(
        "  API key:      {}",
        if config.proxy.api_key.is_some() { "configured" } else { "none" }
    );
    println!();
    println!("  Batcher configuration:");
    println!(
        "    Window: {}ms, max batch: {}",
        batcher.batch_window.as_millis(),
        batcher.max_batch_size
    );
    println!(
        "    Context budget: {} tokens (overhead {}/item, default output {})",
        batcher.context_budget, batcher.meta_overhead, batcher.default_output_tokens
    );
    println!(
        "    Downstream timeout: {}s, fallback concurrency: {}",
        batcher.downstream_timeout.as_secs(),
        batcher.fallback_concurrency
    );
    println!();
    println!("  Cache configuration:");
    if cache.enabled {
        println!("    {} entries, TTL {}s", cache.max_entries, cache.ttl.as_secs());
    } else {
        println!("    Disabled (set LLMFOLD_CACHE_ENABLED=true to enable)");
    }
    println!();
    println!("  Endpoints:");
    println!("    OpenAI: POST /v1/chat/completions");
    println!("    Health: GET  /health, /ready, /live, /metrics");
    println!("    Prometheus: GET /metrics/prometheus");
    println!("==================================================");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    use crate::downstream::mock::{self, ScriptedDownstream};
    use crate::types::openai::ChatCompletionResponse;

    fn app_with(downstream: Arc<ScriptedDownstream>, proxy: ProxyConfig) -> Router {
        let state = AppState::with_downstream(
            proxy,
            BatcherConfig::default(),
            CacheConfig::default(),
            downstream,
        );
        build_router(Arc::new(state))
    }

    fn chat_request(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_chat_completion_roundtrip() {
        let downstream = ScriptedDownstream::echo();
        let app = app_with(downstream.clone(), ProxyConfig::default());

        let response = app
            .oneshot(chat_request(serde_json::json!({
                "model": "m",
                "messages": [
                    {"role": "system", "content": "S"},
                    {"role": "user", "content": "hello"}
                ],
                "temperature": 0.2
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-llmfold-source"], "single");
        assert_eq!(response.headers()["x-llmfold-truncated"], "false");

        let body: ChatCompletionResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(body.first_content(), Some(mock::echo_of("hello").as_str()));
        assert!(body.id.starts_with("chatcmpl-"));
        assert_eq!(downstream.calls()[0].temperature, 0.2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_is_rejected() {
        let downstream = ScriptedDownstream::echo();
        let app = app_with(downstream.clone(), ProxyConfig::default());

        let response = app
            .oneshot(chat_request(serde_json::json!({
                "model": "m",
                "messages": [{"role": "user", "content": "hello"}],
                "stream": true
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(downstream.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_messages_are_rejected() {
        let app = app_with(ScriptedDownstream::echo(), ProxyConfig::default());

        let response = app
            .oneshot(chat_request(serde_json::json!({"model": "m", "messages": []})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test(start_paused = true)]
    async fn test_downstream_failure_is_bad_gateway() {
        let downstream = ScriptedDownstream::with_script(|_| {
            Err(crate::error::DownstreamError::Provider { status: 503, body: "overloaded".to_string() })
        });
        let app = app_with(downstream, ProxyConfig::default());

        let response = app
            .oneshot(chat_request(serde_json::json!({
                "model": "m",
                "messages": [{"role": "user", "content": "hello"}]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_is_gateway_timeout() {
        let proxy = ProxyConfig { request_timeout: Duration::from_secs(1), ..ProxyConfig::default() };
        let app = app_with(ScriptedDownstream::slow(Duration::from_secs(30)), proxy);

        let response = app
            .oneshot(chat_request(serde_json::json!({
                "model": "m",
                "messages": [{"role": "user", "content": "hello"}]
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_operational_endpoints() {
        let app = app_with(ScriptedDownstream::echo(), ProxyConfig::default());

        for uri in ["/health", "/ready", "/live", "/metrics"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "GET {}", uri);
        }

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["batcher"]["config"]["max_batch_size"], 8);
        assert_eq!(body["cache"]["config"]["enabled"], true);
    }
}
