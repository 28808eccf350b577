//! OpenAI-compatible downstream client built on reqwest.

use std::time::Duration;

use async_trait::async_trait;
use llmfold_core::Prompt;
use reqwest::Client;
use tracing::{debug, error, instrument};

use super::DownstreamClient;
use crate::convert::prompt_to_openai;
use crate::error::DownstreamError;
use crate::types::openai::ChatCompletionResponse;

/// Client for any server exposing `POST /v1/chat/completions`
#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client: Client::new(),
            base_url,
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {}", key)),
            None => request,
        }
    }
}

#[async_trait]
impl DownstreamClient for OpenAiClient {
    #[instrument(skip(self, prompt), fields(model = %prompt.model, messages = prompt.messages.len()))]
    async fn complete(&self, prompt: &Prompt, deadline: Duration) -> Result<String, DownstreamError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = prompt_to_openai(prompt);

        debug!(url = %url, timeout_ms = deadline.as_millis() as u64, "Sending completion request");

        let request = self.authorize(self.client.post(&url).json(&body).timeout(deadline));
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DownstreamError::Timeout(deadline)
            } else {
                error!(url = %url, error = %e, "Completion request failed");
                DownstreamError::from(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DownstreamError::Provider { status: status.as_u16(), body });
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| DownstreamError::transport(format!("invalid completion body: {}", e)))?;

        completion
            .first_content()
            .map(str::to_string)
            .ok_or_else(|| DownstreamError::transport("completion has no content"))
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), DownstreamError> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self.authorize(self.client.get(&url)).send().await?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Err(DownstreamError::Provider { status, body })
        }
    }
}
