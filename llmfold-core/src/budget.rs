//! Prompt budgeting: fit a request's messages into a context window.
//!
//! ## Compression steps
//!
//! Applied in order, stopping as soon as the estimate fits:
//!
//! 1. **Collapse**: runs of blanks, excess blank lines, repeated lines and the
//!    middle of long fenced code blocks
//! 2. **Drop**: oldest non-system messages, never the system prompt and never
//!    the most recent user message
//! 3. **Truncate**: cut the remaining content, latest user message first
//!    (head and tail kept), then system messages
//!
//! Budgeting never fails. Whenever the input was over budget the output is
//! within budget and flagged as truncated.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::tokens::TokenEstimator;
use crate::types::{ChatRequest, Message, Role};

/// Default number of tokens reserved for the answer when a request sets no cap
pub const DEFAULT_OUTPUT_TOKENS: usize = 512;

/// Code blocks longer than this many lines get their middle elided
const CODE_BLOCK_MAX_LINES: usize = 16;

/// Lines kept at each end of an elided code block
const CODE_BLOCK_KEEP_LINES: usize = 8;

/// Marker inserted where content was cut
const ELISION_MARKER: &str = "\n...\n";

/// Share of a truncated message kept from its beginning
const HEAD_RATIO: f64 = 0.7;

static BLANK_RUNS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t]+").expect("Invalid blank run regex"));
static TRAILING_BLANKS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)[ \t]+$").expect("Invalid trailing blank regex"));
static EXTRA_NEWLINES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("Invalid newline regex"));
static CODE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```.*?```").expect("Invalid code block regex"));

/// What the budgeter had to do to a request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BudgetReport {
    /// Estimate before any change
    pub original_tokens: usize,
    /// Whitespace and boilerplate collapsing ran
    pub collapsed: bool,
    /// Number of whole messages removed
    pub messages_dropped: usize,
    /// Characters cut by hard truncation
    pub chars_truncated: usize,
}

/// A request's messages after budgeting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetedPrompt {
    pub messages: Vec<Message>,
    /// Estimate of `messages`
    pub estimated_tokens: usize,
    /// Token budget the messages had to fit into
    pub available: usize,
    /// Content was compressed, dropped or cut
    pub truncated: bool,
    pub report: BudgetReport,
}

impl BudgetedPrompt {
    /// Messages other than system messages
    pub fn conversation(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| !m.is_system())
    }

    /// System messages joined in order
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
}

/// Fits requests into a token budget
#[derive(Debug, Clone)]
pub struct PromptBudgeter {
    estimator: TokenEstimator,
    default_output_tokens: usize,
}

impl Default for PromptBudgeter {
    fn default() -> Self {
        Self::new(TokenEstimator::default(), DEFAULT_OUTPUT_TOKENS)
    }
}

impl PromptBudgeter {
    pub fn new(estimator: TokenEstimator, default_output_tokens: usize) -> Self {
        Self { estimator, default_output_tokens }
    }

    pub fn estimator(&self) -> &TokenEstimator {
        &self.estimator
    }

    /// Tokens reserved for the answer to `request`
    pub fn output_reserve(&self, request: &ChatRequest) -> usize {
        request
            .max_output_tokens
            .map(|n| n as usize)
            .unwrap_or(self.default_output_tokens)
    }

    /// Token budget left for the request's messages
    pub fn available(&self, request: &ChatRequest, context_budget: usize, meta_overhead: usize) -> usize {
        context_budget
            .saturating_sub(meta_overhead)
            .saturating_sub(self.output_reserve(request))
    }

    /// Fit the request's messages into `context_budget`
    pub fn fit(&self, request: &ChatRequest, context_budget: usize, meta_overhead: usize) -> BudgetedPrompt {
        let available = self.available(request, context_budget, meta_overhead);
        let original_tokens = self.estimator.estimate_messages(&request.messages);

        let mut report = BudgetReport { original_tokens, ..Default::default() };

        if original_tokens <= available {
            return BudgetedPrompt {
                messages: request.messages.clone(),
                estimated_tokens: original_tokens,
                available,
                truncated: false,
                report,
            };
        }

        // Step 1: collapse whitespace and boilerplate
        let mut messages: Vec<Message> = request
            .messages
            .iter()
            .map(|m| Message::new(m.role, collapse(&m.content)))
            .collect();
        report.collapsed = true;

        // Step 2: drop oldest unprotected messages
        if self.estimator.estimate_messages(&messages) > available {
            report.messages_dropped = self.drop_oldest(&mut messages, available);
        }

        // Step 3: hard truncation
        if self.estimator.estimate_messages(&messages) > available {
            report.chars_truncated = self.truncate(&mut messages, available);
        }

        let estimated_tokens = self.estimator.estimate_messages(&messages);
        debug_assert!(estimated_tokens <= available);

        BudgetedPrompt { messages, estimated_tokens, available, truncated: true, report }
    }

    /// Remove non-system messages oldest first, keeping the latest user turn
    fn drop_oldest(&self, messages: &mut Vec<Message>, available: usize) -> usize {
        let protected_user = messages.iter().rposition(|m| m.role == Role::User);
        let mut tokens: Vec<usize> =
            messages.iter().map(|m| self.estimator.estimate(&m.content)).collect();
        let mut total: usize = tokens.iter().sum();
        let mut keep = vec![true; messages.len()];
        let mut dropped = 0;

        for idx in 0..messages.len() {
            if total <= available {
                break;
            }
            if messages[idx].is_system() || Some(idx) == protected_user {
                continue;
            }
            keep[idx] = false;
            total -= tokens[idx];
            tokens[idx] = 0;
            dropped += 1;
        }

        let mut flags = keep.into_iter();
        messages.retain(|_| flags.next().unwrap_or(true));
        dropped
    }

    /// Cut content until the estimate fits; returns characters removed
    fn truncate(&self, messages: &mut [Message], available: usize) -> usize {
        let mut tokens: Vec<usize> =
            messages.iter().map(|m| self.estimator.estimate(&m.content)).collect();
        let mut deficit = tokens.iter().sum::<usize>().saturating_sub(available);
        let mut chars_removed = 0;

        // Latest user turn down to half the budget, then system messages, then
        // whatever is left of the user turn
        let user_idx = messages.iter().rposition(|m| m.role == Role::User);
        let mut plan: Vec<(usize, usize)> = Vec::new();
        if let Some(idx) = user_idx {
            plan.push((idx, tokens[idx].min(available / 2)));
        }
        for idx in 0..messages.len() {
            if Some(idx) != user_idx {
                plan.push((idx, 0));
            }
        }
        if let Some(idx) = user_idx {
            plan.push((idx, 0));
        }

        for (idx, floor) in plan {
            if deficit == 0 {
                break;
            }
            let current = tokens[idx];
            let cut = current.saturating_sub(floor).min(deficit);
            if cut == 0 {
                continue;
            }

            let before = messages[idx].content.chars().count();
            let truncated = self.truncate_to_tokens(&messages[idx].content, current - cut);
            let after_tokens = self.estimator.estimate(&truncated);

            chars_removed += before - truncated.chars().count();
            deficit = deficit.saturating_sub(current - after_tokens);
            tokens[idx] = after_tokens;
            messages[idx].content = truncated;
        }

        chars_removed
    }

    /// Shorten text to at most `max_tokens`, keeping its head and tail
    fn truncate_to_tokens(&self, text: &str, max_tokens: usize) -> String {
        let max_chars = self.estimator.max_chars(max_tokens);
        let total_chars = text.chars().count();
        if total_chars <= max_chars {
            return text.to_string();
        }

        let marker_chars = ELISION_MARKER.chars().count();
        if max_chars <= marker_chars * 4 {
            return take_chars(text, max_chars).to_string();
        }

        let keep = max_chars - marker_chars;
        let head = (keep as f64 * HEAD_RATIO) as usize;
        let tail = keep - head;

        format!("{}{}{}", take_chars(text, head), ELISION_MARKER, last_chars(text, tail))
    }
}

/// Collapse whitespace runs, repeated lines and long code blocks
pub fn collapse(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n");
    let normalized = BLANK_RUNS.replace_all(&normalized, " ");
    let normalized = TRAILING_BLANKS.replace_all(&normalized, "");

    let mut deduped = String::with_capacity(normalized.len());
    let mut previous: Option<&str> = None;
    for line in normalized.split('\n') {
        if !line.is_empty() && previous == Some(line) {
            continue;
        }
        if previous.is_some() {
            deduped.push('\n');
        }
        deduped.push_str(line);
        previous = Some(line);
    }

    let collapsed = EXTRA_NEWLINES.replace_all(&deduped, "\n\n");
    let collapsed = CODE_BLOCK.replace_all(&collapsed, |caps: &regex::Captures<'_>| {
        elide_code_block(&caps[0])
    });

    collapsed.trim().to_string()
}

fn elide_code_block(block: &str) -> String {
    let lines: Vec<&str> = block.lines().collect();
    if lines.len() <= CODE_BLOCK_MAX_LINES {
        return block.to_string();
    }
    let head = lines[..CODE_BLOCK_KEEP_LINES].join("\n");
    let tail = lines[lines.len() - CODE_BLOCK_KEEP_LINES..].join("\n");
    format!("{}{}{}", head, ELISION_MARKER, tail)
}

fn take_chars(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn last_chars(text: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    match text.char_indices().rev().nth(n - 1) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}
