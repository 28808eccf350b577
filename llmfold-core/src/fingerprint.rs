//! Stable content hash used as the response cache key.

use std::fmt;

use serde::Serialize;
use xxhash_rust::xxh3::xxh3_64;

use crate::types::ChatRequest;

/// xxh3 hash of a request's normalized content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Hash model, every message (role and content), temperature and top_p
    ///
    /// The request id, arrival time and output cap are not part of the
    /// fingerprint: two calls asking the same thing share one cache entry.
    pub fn of(request: &ChatRequest) -> Self {
        let mut canonical = String::with_capacity(
            request.model.len() + request.messages.iter().map(|m| m.content.len() + 12).sum::<usize>() + 32,
        );

        canonical.push_str(&request.model);
        canonical.push('\0');

        for message in &request.messages {
            canonical.push_str(&message.role.to_string());
            canonical.push(':');
            canonical.push_str(&message.content);
            canonical.push('\u{1f}');
        }

        canonical.push_str(&format!(
            "temp:{:08x}\0top_p:{:08x}",
            normalized_bits(request.temperature),
            normalized_bits(request.top_p)
        ));

        Self(xxh3_64(canonical.as_bytes()))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for Fingerprint {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Bit pattern of a float with negative zero folded into zero
pub(crate) fn normalized_bits(value: f32) -> u32 {
    if value == 0.0 {
        0.0f32.to_bits()
    } else {
        value.to_bits()
    }
}
