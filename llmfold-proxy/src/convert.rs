//! Conversion between the OpenAI wire format and llmfold's normalized types.

use llmfold_core::{ChatRequest, ChatResponse, Message, Prompt, Role, TokenEstimator};
use tracing::debug;

use crate::error::ProxyError;
use crate::types::openai;

/// Convert an inbound OpenAI request into a normalized request
///
/// Missing sampling parameters take the given defaults. Streaming and tool
/// messages are rejected since the batching path cannot serve them.
pub fn openai_to_chat_request(
    request: &openai::ChatCompletionRequest,
    default_temperature: f32,
    default_top_p: f32,
) -> Result<ChatRequest, ProxyError> {
    if request.stream {
        return Err(ProxyError::InvalidRequest("streaming responses are not supported".to_string()));
    }

    let messages = request
        .messages
        .iter()
        .map(convert_message)
        .collect::<Result<Vec<_>, _>>()?;

    debug!(
        model = %request.model,
        messages = messages.len(),
        "Converting OpenAI request"
    );

    let mut chat = ChatRequest::new(request.model.clone(), messages)
        .with_temperature(request.temperature.unwrap_or(default_temperature))
        .with_top_p(request.top_p.unwrap_or(default_top_p));
    chat.max_output_tokens = request.max_tokens;

    Ok(chat)
}

fn convert_message(msg: &openai::ChatMessage) -> Result<Message, ProxyError> {
    let role = match msg.role {
        openai::Role::System => Role::System,
        openai::Role::User => Role::User,
        openai::Role::Assistant => Role::Assistant,
        openai::Role::Tool => {
            return Err(ProxyError::InvalidRequest("tool messages are not supported".to_string()))
        }
    };
    Ok(Message::new(role, msg.content.clone().unwrap_or_default()))
}

fn role_to_openai(role: Role) -> openai::Role {
    match role {
        Role::System => openai::Role::System,
        Role::User => openai::Role::User,
        Role::Assistant => openai::Role::Assistant,
    }
}

/// Build the downstream request body for a rendered prompt
pub fn prompt_to_openai(prompt: &Prompt) -> openai::ChatCompletionRequest {
    openai::ChatCompletionRequest {
        model: prompt.model.clone(),
        messages: prompt
            .messages
            .iter()
            .map(|m| openai::ChatMessage::new(role_to_openai(m.role), m.content.clone()))
            .collect(),
        temperature: Some(prompt.temperature),
        top_p: Some(prompt.top_p),
        stream: false,
        max_tokens: prompt.max_output_tokens,
        user: None,
    }
}

/// Wrap a normalized response into an OpenAI completion object
///
/// Token usage is estimated, the provider's exact counts are not known for
/// items answered from a merged call.
pub fn chat_response_to_openai(
    request: &ChatRequest,
    response: &ChatResponse,
    estimator: &TokenEstimator,
) -> openai::ChatCompletionResponse {
    let prompt_tokens = estimator.estimate_messages(&request.messages) as u32;
    let completion_tokens = estimator.estimate(&response.text) as u32;

    let mut completion = openai::ChatCompletionResponse::new(
        response.model.clone(),
        response.text.clone(),
        prompt_tokens,
        completion_tokens,
    );
    completion.id = format!("chatcmpl-{}", response.id);
    completion
}
