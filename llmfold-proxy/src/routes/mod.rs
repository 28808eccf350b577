//! HTTP route handlers for the llmfold proxy.
//!
//! This module organizes all route handlers:
//! - `health`: Health check and metrics endpoints
//! - `openai`: OpenAI-compatible chat completions

pub mod health;
pub mod openai;

// Re-export handlers for convenience
pub use health::{health, live, metrics, metrics_prometheus, ready};
pub use openai::chat_completions;
