//! Heuristic token estimation.
//!
//! Token counts are approximated from character counts; no model-specific
//! tokenizer is involved. The same estimator is used for budgeting and for
//! batch sizing so that every limit is checked against one consistent number.

use crate::types::Message;

/// Default number of characters per token (a common rule of thumb for English)
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 4.0;

/// Character based token estimator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenEstimator {
    chars_per_token: f64,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self { chars_per_token: DEFAULT_CHARS_PER_TOKEN }
    }
}

impl TokenEstimator {
    /// Create an estimator; non-positive or non-finite ratios fall back to the default
    pub fn new(chars_per_token: f64) -> Self {
        if chars_per_token.is_finite() && chars_per_token > 0.0 {
            Self { chars_per_token }
        } else {
            Self::default()
        }
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }

    /// Estimate the token count of a piece of text
    pub fn estimate(&self, text: &str) -> usize {
        self.tokens_for_chars(text.chars().count())
    }

    /// Sum of the per-message estimates
    pub fn estimate_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.estimate(&m.content)).sum()
    }

    /// Largest character count whose estimate stays within `tokens`
    pub fn max_chars(&self, tokens: usize) -> usize {
        let mut chars = (tokens as f64 * self.chars_per_token).floor() as usize;
        // Float rounding can land one step over
        while chars > 0 && self.tokens_for_chars(chars) > tokens {
            chars -= 1;
        }
        chars
    }

    fn tokens_for_chars(&self, chars: usize) -> usize {
        if chars == 0 {
            return 0;
        }
        (chars as f64 / self.chars_per_token).ceil() as usize
    }
}
