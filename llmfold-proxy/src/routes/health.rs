//! Health check and metrics endpoints.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;
use std::sync::Arc;

use crate::metrics::{encode_metrics, set_backend_healthy};
use crate::state::AppState;

/// Health check endpoint
///
/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let result = state.downstream.health_check().await;
    set_backend_healthy(result.is_ok());

    match result {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "downstream": "connected",
                "version": env!("CARGO_PKG_VERSION")
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "downstream": "disconnected",
                "error": e.to_string(),
                "version": env!("CARGO_PKG_VERSION")
            })),
        ),
    }
}

/// Metrics endpoint with scheduler and cache statistics
///
/// GET /metrics
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let batcher = state.scheduler.metrics().snapshot();
    let cache_stats = state.cache.stats();
    let cache_entries = state.cache.len().await;

    Json(json!({
        "batcher": {
            "config": {
                "batch_window_ms": state.batcher_config.batch_window.as_millis() as u64,
                "max_batch_size": state.batcher_config.max_batch_size,
                "context_budget": state.batcher_config.context_budget,
                "meta_overhead": state.batcher_config.meta_overhead,
                "downstream_timeout_secs": state.batcher_config.downstream_timeout.as_secs(),
                "fallback_concurrency": state.batcher_config.fallback_concurrency
            },
            "current": {
                "active_queues": state.scheduler.active_queues()
            },
            "totals": batcher
        },
        "cache": {
            "config": {
                "enabled": state.cache_config.enabled,
                "max_entries": state.cache_config.max_entries,
                "ttl_secs": state.cache_config.ttl.as_secs()
            },
            "entries": cache_entries,
            "stats": cache_stats
        }
    }))
}

/// Prometheus metrics endpoint
///
/// GET /metrics/prometheus
pub async fn metrics_prometheus() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        encode_metrics(),
    )
}

/// Ready check (for Kubernetes)
///
/// GET /ready
pub async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.downstream.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Live check (for Kubernetes)
///
/// GET /live
pub async fn live() -> impl IntoResponse {
    StatusCode::OK
}
