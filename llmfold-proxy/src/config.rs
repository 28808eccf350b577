//! Environment parsing helpers shared by the `from_env` constructors.
//!
//! Malformed values are ignored so the caller keeps its default.

use std::str::FromStr;

/// Parse an environment variable, `None` when unset or malformed
pub fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "Ignoring malformed environment variable");
            None
        }
    }
}

/// Parse a boolean flag (`1`, `true`, `yes`, `on` and their negatives)
pub fn env_bool(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    parse_bool(&raw)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
