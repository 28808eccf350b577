//! Error types for the llmfold proxy.

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use llmfold_core::CoreError;

/// Failure of one downstream call
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DownstreamError {
    /// Network failure or unusable response
    #[error("Downstream transport error: {0}")]
    Transport(String),

    /// Provider answered with a non-success status
    #[error("Downstream returned {status}: {body}")]
    Provider { status: u16, body: String },

    /// Deadline elapsed before the call finished
    #[error("Downstream call timed out after {0:?}")]
    Timeout(Duration),
}

impl DownstreamError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DownstreamError::Timeout(_))
    }

    /// Short label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            DownstreamError::Transport(_) => "transport",
            DownstreamError::Provider { .. } => "provider",
            DownstreamError::Timeout(_) => "timeout",
        }
    }
}

impl From<reqwest::Error> for DownstreamError {
    fn from(err: reqwest::Error) -> Self {
        DownstreamError::Transport(err.to_string())
    }
}

/// Error delivered to a caller waiting on its result
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    /// The item's final individual call failed
    #[error(transparent)]
    Downstream(#[from] DownstreamError),

    /// Rejected at admission
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The completion handle was dropped without a result
    #[error("Request was dropped before completion")]
    Dropped,
}

impl From<CoreError> for SchedulerError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidRequest(msg) => SchedulerError::InvalidRequest(msg),
            other => SchedulerError::InvalidRequest(other.to_string()),
        }
    }
}

/// Proxy error types
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Request parsing error
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Downstream provider failed for this request
    #[error("{0}")]
    Downstream(#[from] DownstreamError),

    /// Waiting for the result took longer than the request timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<SchedulerError> for ProxyError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Downstream(e) => ProxyError::Downstream(e),
            SchedulerError::InvalidRequest(msg) => ProxyError::InvalidRequest(msg),
            SchedulerError::Dropped => ProxyError::Internal(err.to_string()),
        }
    }
}

impl ProxyError {
    fn error_type(&self) -> &'static str {
        match self {
            ProxyError::InvalidRequest(_) | ProxyError::Serialization(_) => "invalid_request_error",
            ProxyError::Downstream(_) => "downstream_error",
            ProxyError::Timeout(_) => "timeout_error",
            ProxyError::Internal(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidRequest(_) | ProxyError::Serialization(_) => StatusCode::BAD_REQUEST,
            ProxyError::Downstream(DownstreamError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Downstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
            }
        }));

        (self.status(), body).into_response()
    }
}
