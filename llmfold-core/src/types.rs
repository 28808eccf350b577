//! Normalized request, response and prompt types.
//!
//! These are the types the batching pipeline works with. Wire formats (the
//! OpenAI-style HTTP payloads) are converted into them by the proxy's front
//! door before admission.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Sampling temperature used when a caller does not set one
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Nucleus sampling value used when a caller does not set one
pub const DEFAULT_TOP_P: f32 = 1.0;

/// Unique identifier of one logical client call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Create a new random request ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Parse an ID from its display form.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s.trim()).ok().map(Self)
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single conversation turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }
}

/// One logical client call, as admitted by the scheduler.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Correlates the eventual response with this call
    pub id: RequestId,

    /// Model name
    pub model: String,

    /// Conversation, oldest first
    pub messages: Vec<Message>,

    /// Sampling temperature
    pub temperature: f32,

    /// Nucleus sampling parameter
    pub top_p: f32,

    /// Cap on generated tokens
    pub max_output_tokens: Option<u32>,

    /// Set by the scheduler when the request is admitted
    pub arrival_time: Option<Instant>,
}

impl ChatRequest {
    /// Create a request with a fresh ID and default sampling parameters
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            id: RequestId::new(),
            model: model.into(),
            messages,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            max_output_tokens: None,
            arrival_time: None,
        }
    }

    pub fn with_id(mut self, id: RequestId) -> Self {
        self.id = id;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = Some(max_output_tokens);
        self
    }

    /// Check the data model invariants
    pub fn validate(&self) -> Result<()> {
        if self.messages.is_empty() {
            return Err(CoreError::invalid_request("messages must not be empty"));
        }
        if self.model.trim().is_empty() {
            return Err(CoreError::invalid_request("model must not be empty"));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(CoreError::invalid_request(format!(
                "temperature must be a non-negative number, got {}",
                self.temperature
            )));
        }
        if !self.top_p.is_finite() || !(0.0..=1.0).contains(&self.top_p) {
            return Err(CoreError::invalid_request(format!(
                "top_p must be within [0, 1], got {}",
                self.top_p
            )));
        }
        Ok(())
    }

    /// All system messages joined in order, if any
    pub fn system_prompt(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .messages
            .iter()
            .filter(|m| m.is_system())
            .map(|m| m.content.as_str())
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    /// Index of the most recent user message
    pub fn last_user_index(&self) -> Option<usize> {
        self.messages.iter().rposition(|m| m.role == Role::User)
    }
}

/// Which path produced a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    /// Served from the response cache
    Cache,
    /// Sent alone because its batch held a single request
    Single,
    /// Extracted from a merged downstream call
    Batch,
    /// Individual call issued after the merged call could not answer it
    Fallback,
}

impl fmt::Display for ResponseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseSource::Cache => write!(f, "cache"),
            ResponseSource::Single => write!(f, "single"),
            ResponseSource::Batch => write!(f, "batch"),
            ResponseSource::Fallback => write!(f, "fallback"),
        }
    }
}

/// Answer delivered to exactly one originating request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: RequestId,
    pub model: String,
    pub text: String,
    /// The prompt had to be compressed or cut to fit the context budget
    pub truncated: bool,
    pub source: ResponseSource,
}

/// A fully rendered downstream call
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_output_tokens: Option<u32>,
    pub messages: Vec<Message>,
}

impl Prompt {
    /// Concatenated message contents
    pub fn text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}
