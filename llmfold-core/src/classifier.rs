//! Compatibility classification.
//!
//! Requests may share one downstream call only when the call's parameters
//! would be identical for each of them: same model, same sampling settings
//! and same system prompt. Everything else (user and assistant turns, output
//! caps) can differ between batched items.

use std::fmt;

use serde::Serialize;
use xxhash_rust::xxh3::xxh3_64;

use crate::fingerprint::normalized_bits;
use crate::types::ChatRequest;

/// Grouping key: two requests may be batched together iff their keys are equal
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CompatibilityKey {
    model: String,
    temperature_bits: u32,
    top_p_bits: u32,
    system_hash: u64,
}

impl CompatibilityKey {
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn temperature(&self) -> f32 {
        f32::from_bits(self.temperature_bits)
    }

    pub fn top_p(&self) -> f32 {
        f32::from_bits(self.top_p_bits)
    }

    pub fn system_hash(&self) -> u64 {
        self.system_hash
    }
}

impl fmt::Display for CompatibilityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/t={}/p={}/sys={:08x}",
            self.model,
            self.temperature(),
            self.top_p(),
            self.system_hash >> 32
        )
    }
}

/// Derives compatibility keys
#[derive(Debug, Clone, Copy, Default)]
pub struct CompatibilityClassifier;

impl CompatibilityClassifier {
    pub fn classify(&self, request: &ChatRequest) -> CompatibilityKey {
        classify(request)
    }
}

/// Compute the compatibility key of a request
pub fn classify(request: &ChatRequest) -> CompatibilityKey {
    let system = request.system_prompt().unwrap_or_default();

    CompatibilityKey {
        model: request.model.clone(),
        temperature_bits: normalized_bits(request.temperature),
        top_p_bits: normalized_bits(request.top_p),
        system_hash: xxh3_64(system.as_bytes()),
    }
}
