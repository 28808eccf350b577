//! Metrics module for the llmfold proxy
//!
//! Provides Prometheus metrics for monitoring and observability.

pub mod prometheus;

// Re-export commonly used items
pub use prometheus::{encode_metrics, register_metrics, set_backend_healthy, RequestTimer};
