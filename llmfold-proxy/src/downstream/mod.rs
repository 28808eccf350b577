//! Downstream text-generation providers.
//!
//! The scheduler never builds HTTP requests itself: it renders a [`Prompt`]
//! and hands it to a [`DownstreamClient`] together with a deadline. The
//! shipped implementation speaks the OpenAI chat completions protocol; tests
//! plug in scripted clients.

mod openai;

#[cfg(test)]
pub(crate) mod mock;

pub use openai::OpenAiClient;

use std::time::Duration;

use async_trait::async_trait;
use llmfold_core::Prompt;

use crate::error::DownstreamError;

/// A provider that turns a prompt into completion text
#[async_trait]
pub trait DownstreamClient: Send + Sync {
    /// Run one completion
    ///
    /// `deadline` bounds the whole call. The scheduler also enforces it, so
    /// implementations may treat it as a hint.
    async fn complete(&self, prompt: &Prompt, deadline: Duration) -> Result<String, DownstreamError>;

    /// Check that the provider is reachable
    async fn health_check(&self) -> Result<(), DownstreamError> {
        Ok(())
    }
}
