//! Multi-item prompt assembly and answer extraction.
//!
//! A batch of compatible requests becomes one downstream call: the shared
//! system prompt plus a formatting instruction, then every item wrapped in an
//! `<item id="...">` block. The model is asked to reply with one
//! `<answer id="...">` block per item. The tag format is best effort; anything
//! that cannot be matched back to an item is reported as a parse failure so
//! the caller can resolve it with an individual call.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::batch::{BatchItem, BatchJob};
use crate::tokens::TokenEstimator;
use crate::types::{Message, Prompt, RequestId, Role};

/// System prompt used when the batched requests carry none
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

const FORMAT_INSTRUCTION: &str = "You will receive several independent items. \
Answer each <item id=\"...\"> on its own.\n\
Reply only with one block per item, using the item's id exactly: \
<answer id=\"same id\">your answer</answer>. Do not add any other text.";

const TASK_LINE: &str = "[task]\nProvide the best possible assistant reply for the above conversation.";

static ANSWER_OPENER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^<answer\s+id\s*=\s*"([^"]*)"\s*>"#).expect("Invalid answer opener regex")
});

static ANY_OPENER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<answer\b").expect("Invalid answer tag regex"));

static ANSWER_CLOSER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</answer\s*>").expect("Invalid answer closer regex"));

/// Result of matching a combined response back to its items
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// Every item has a well-formed answer
    FullyParsed(HashMap<RequestId, String>),
    /// Some items need an individual call; `failed` is in arrival order
    PartiallyParsed {
        answers: HashMap<RequestId, String>,
        failed: Vec<RequestId>,
    },
}

impl ParseOutcome {
    pub fn answers(&self) -> &HashMap<RequestId, String> {
        match self {
            ParseOutcome::FullyParsed(answers) => answers,
            ParseOutcome::PartiallyParsed { answers, .. } => answers,
        }
    }

    pub fn failed(&self) -> &[RequestId] {
        match self {
            ParseOutcome::FullyParsed(_) => &[],
            ParseOutcome::PartiallyParsed { failed, .. } => failed,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, ParseOutcome::FullyParsed(_))
    }

    pub fn into_parts(self) -> (HashMap<RequestId, String>, Vec<RequestId>) {
        match self {
            ParseOutcome::FullyParsed(answers) => (answers, Vec::new()),
            ParseOutcome::PartiallyParsed { answers, failed } => (answers, failed),
        }
    }
}

/// Builds combined prompts and parses combined responses
#[derive(Debug, Clone, Default)]
pub struct BatchAssembler {
    estimator: TokenEstimator,
}

impl BatchAssembler {
    pub fn new(estimator: TokenEstimator) -> Self {
        Self { estimator }
    }

    /// Tokens of the fixed instruction text around the items
    pub fn header_tokens(&self) -> usize {
        self.estimator.estimate(FORMAT_INSTRUCTION) + self.estimator.estimate(TASK_LINE)
    }

    /// Estimated size of the combined call if `extra` joined `job`
    ///
    /// Counts the header, the shared system prompt once, and per item its
    /// rendered content, `meta_overhead` and its output reservation.
    pub fn projected_tokens(&self, job: &BatchJob, extra: &BatchItem, meta_overhead: usize) -> usize {
        let first = job.items().first().unwrap_or(extra);
        let system = first.budget.system_prompt().unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

        let items: usize = job
            .items()
            .iter()
            .chain(std::iter::once(extra))
            .map(|item| self.estimator.estimate(&render_item(item)) + meta_overhead + item.output_reserve)
            .sum();

        self.header_tokens() + self.estimator.estimate(&system) + items
    }

    /// Combined prompt for every item of `job`, in arrival order
    pub fn build_prompt(&self, job: &BatchJob) -> Prompt {
        let items = job.items();
        let first = items.first();

        let shared = first
            .and_then(|item| item.budget.system_prompt())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        let system = format!("{}\n\n{}", shared.trim(), FORMAT_INSTRUCTION);

        let ids: Vec<String> = items.iter().map(|item| item.id().to_string()).collect();
        let mut parts = vec![format!(
            "Answer each of the following {} items. Item ids in order: {}",
            items.len(),
            ids.join(", ")
        )];
        for (id, item) in ids.iter().zip(items) {
            parts.push(format!("<item id=\"{}\">\n{}\n</item>", id, render_item(item)));
        }

        let max_output_tokens = items
            .iter()
            .map(|item| item.request.max_output_tokens)
            .sum::<Option<u32>>();

        Prompt {
            model: job.key().model().to_string(),
            temperature: job.key().temperature(),
            top_p: job.key().top_p(),
            max_output_tokens,
            messages: vec![Message::system(system), Message::user(parts.join("\n\n"))],
        }
    }

    /// Match answer blocks in `text` to the items of `job`
    pub fn parse(&self, text: &str, job: &BatchJob) -> ParseOutcome {
        parse_answers(text, &job.ids())
    }
}

/// Individual downstream call for one item, using its budgeted messages
pub fn individual_prompt(item: &BatchItem) -> Prompt {
    Prompt {
        model: item.request.model.clone(),
        temperature: item.request.temperature,
        top_p: item.request.top_p,
        max_output_tokens: item.request.max_output_tokens,
        messages: item.budget.messages.clone(),
    }
}

/// Item body: a lone user turn verbatim, anything longer as a transcript
fn render_item(item: &BatchItem) -> String {
    let turns: Vec<&Message> = item.budget.conversation().collect();

    if let [only] = turns.as_slice() {
        if only.role == Role::User {
            return only.content.trim().to_string();
        }
    }

    let mut lines: Vec<String> = turns
        .iter()
        .map(|m| format!("[{}]\n{}", m.role, m.content.trim()))
        .collect();
    lines.push(TASK_LINE.to_string());
    lines.join("\n\n")
}

/// Extract one answer per expected id
///
/// The text is split at every `<answer` opener, so a block can never run into
/// the next one. An id resolves only when exactly one closed, non-empty block
/// carries it; a block cut short by the next opener fails only its own id.
/// Blocks for unknown ids are ignored.
pub fn parse_answers(text: &str, expected: &[RequestId]) -> ParseOutcome {
    let wanted: HashSet<RequestId> = expected.iter().copied().collect();
    let mut found: HashMap<RequestId, String> = HashMap::new();
    let mut rejected: HashSet<RequestId> = HashSet::new();

    let starts: Vec<usize> = ANY_OPENER.find_iter(text).map(|m| m.start()).collect();

    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(text.len());
        let segment = &text[start..end];

        let Some(caps) = ANSWER_OPENER.captures(segment) else {
            continue;
        };
        let Some(id) = RequestId::parse(&caps[1]) else {
            continue;
        };
        if !wanted.contains(&id) {
            continue;
        }

        let rest = &segment[caps[0].len()..];
        let Some(closer) = ANSWER_CLOSER.find(rest) else {
            rejected.insert(id);
            continue;
        };

        let body = rest[..closer.start()].trim();
        if body.is_empty() || found.insert(id, body.to_string()).is_some() {
            rejected.insert(id);
        }
    }

    for id in &rejected {
        found.remove(id);
    }

    let failed: Vec<RequestId> = expected.iter().filter(|id| !found.contains_key(id)).copied().collect();

    if failed.is_empty() {
        ParseOutcome::FullyParsed(found)
    } else {
        ParseOutcome::PartiallyParsed { answers: found, failed }
    }
}
