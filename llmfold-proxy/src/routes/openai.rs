//! OpenAI-compatible API routes.
//!
//! Existing OpenAI clients and SDKs can point at the proxy unchanged; their
//! requests are batched behind the scenes.

use axum::{
    extract::State,
    http::HeaderValue,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use llmfold_core::{ChatRequest, ChatResponse, ResponseSource};

use crate::convert::{chat_response_to_openai, openai_to_chat_request};
use crate::error::ProxyError;
use crate::metrics::RequestTimer;
use crate::state::AppState;
use crate::types::openai::ChatCompletionRequest;

/// Header naming the path that produced the answer
pub const SOURCE_HEADER: &str = "x-llmfold-source";

/// Header set to `true` when the prompt was cut to fit the context budget
pub const TRUNCATED_HEADER: &str = "x-llmfold-truncated";

/// Chat completions endpoint
///
/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, ProxyError> {
    info!(
        model = %request.model,
        messages = request.messages.len(),
        stream = request.stream,
        "Handling POST /v1/chat/completions"
    );

    let timer = RequestTimer::new(&request.model);

    let (chat, response) = match answer(&state, &request).await {
        Ok(answered) => answered,
        Err(e) => {
            warn!(model = %request.model, error = %e, "Chat completion failed");
            timer.record_failure();
            return Err(e);
        }
    };
    timer.record_success(source_label(response.source));

    debug!(
        request_id = %response.id,
        source = %response.source,
        truncated = response.truncated,
        "Chat completion answered"
    );

    let body = chat_response_to_openai(&chat, &response, &state.estimator);
    let mut http = Json(body).into_response();
    let headers = http.headers_mut();
    headers.insert(SOURCE_HEADER, HeaderValue::from_static(source_label(response.source)));
    headers.insert(
        TRUNCATED_HEADER,
        HeaderValue::from_static(if response.truncated { "true" } else { "false" }),
    );

    Ok(http)
}

async fn answer(
    state: &AppState,
    request: &ChatCompletionRequest,
) -> Result<(ChatRequest, ChatResponse), ProxyError> {
    let chat = openai_to_chat_request(
        request,
        state.batcher_config.default_temperature,
        state.batcher_config.default_top_p,
    )?;

    let pending = state.scheduler.submit(chat.clone()).await?;
    let timeout = state.config.request_timeout;

    match tokio::time::timeout(timeout, pending.wait()).await {
        Ok(result) => Ok((chat, result?)),
        Err(_) => Err(ProxyError::Timeout(timeout)),
    }
}

fn source_label(source: ResponseSource) -> &'static str {
    match source {
        ResponseSource::Cache => "cache",
        ResponseSource::Single => "single",
        ResponseSource::Batch => "batch",
        ResponseSource::Fallback => "fallback",
    }
}
