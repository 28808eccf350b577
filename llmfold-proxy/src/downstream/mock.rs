//! Scripted downstream client for tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use llmfold_core::{Prompt, RequestId};
use once_cell::sync::Lazy;
use regex::Regex;

use super::DownstreamClient;
use crate::error::DownstreamError;

static ITEM_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)<item id="([^"]+)">\n(.*?)\n</item>"#).unwrap());

type Script = dyn Fn(&Prompt) -> Result<String, DownstreamError> + Send + Sync;

/// Records every prompt and answers according to a script
pub struct ScriptedDownstream {
    calls: Mutex<Vec<Prompt>>,
    script: Box<Script>,
    batch_delay: Duration,
    single_delay: Duration,
}

impl ScriptedDownstream {
    /// Answers every item: batched prompts get one answer block per item
    pub fn echo() -> Arc<Self> {
        Self::with_script(|prompt| Ok(echo_answer(prompt)))
    }

    pub fn with_script<F>(script: F) -> Arc<Self>
    where
        F: Fn(&Prompt) -> Result<String, DownstreamError> + Send + Sync + 'static,
    {
        Arc::new(Self::build(Box::new(script), Duration::ZERO, Duration::ZERO))
    }

    /// Echo, but merged calls take `delay` to answer
    pub fn slow_batches(delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(Box::new(|prompt| Ok(echo_answer(prompt))), delay, Duration::ZERO))
    }

    /// Echo, but every call takes `delay`
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(Box::new(|prompt| Ok(echo_answer(prompt))), delay, delay))
    }

    fn build(script: Box<Script>, batch_delay: Duration, single_delay: Duration) -> Self {
        Self { calls: Mutex::new(Vec::new()), script, batch_delay, single_delay }
    }

    pub fn calls(&self) -> Vec<Prompt> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn batched_calls(&self) -> Vec<Prompt> {
        self.calls().into_iter().filter(is_batched).collect()
    }

    pub fn single_calls(&self) -> Vec<Prompt> {
        self.calls().into_iter().filter(|p| !is_batched(p)).collect()
    }
}

#[async_trait]
impl DownstreamClient for ScriptedDownstream {
    async fn complete(&self, prompt: &Prompt, _deadline: Duration) -> Result<String, DownstreamError> {
        self.calls.lock().unwrap().push(prompt.clone());

        let delay = if is_batched(prompt) { self.batch_delay } else { self.single_delay };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        (self.script)(prompt)
    }
}

/// Whether a prompt is a merged multi-item call
pub fn is_batched(prompt: &Prompt) -> bool {
    prompt.messages.iter().any(|m| m.content.contains("<item id=\""))
}

/// `(id, content)` of every item in a merged prompt
pub fn items(prompt: &Prompt) -> Vec<(RequestId, String)> {
    let text = prompt.text();
    ITEM_BLOCK
        .captures_iter(&text)
        .filter_map(|caps| RequestId::parse(&caps[1]).map(|id| (id, caps[2].to_string())))
        .collect()
}

/// Last user message of a plain prompt
pub fn last_user(prompt: &Prompt) -> String {
    prompt
        .messages
        .iter()
        .rev()
        .find(|m| m.role == llmfold_core::Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

/// The canonical answer the echo script gives for some content
pub fn echo_of(content: &str) -> String {
    format!("echo: {}", content)
}

/// Answer blocks for the given items
pub fn answer_blocks(items: &[(RequestId, String)]) -> String {
    items
        .iter()
        .map(|(id, content)| format!("<answer id=\"{}\">{}</answer>", id, echo_of(content)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn echo_answer(prompt: &Prompt) -> String {
    if is_batched(prompt) {
        answer_blocks(&items(prompt))
    } else {
        echo_of(&last_user(prompt))
    }
}
