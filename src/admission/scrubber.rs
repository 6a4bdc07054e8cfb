//! PII scrubbing for payloads and results.
//!
//! Scrubbing is a transform, not a gate: it is applied to values before they
//! are logged or persisted, never to decide admission. Each pattern class
//! gets its own redaction tag so downstream consumers can tell what kind of
//! material was removed. Non-matching text is left untouched and container
//! shape (keys, array order) is preserved.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

pub const EMAIL_TAG: &str = "[EMAIL_REDACTED]";
pub const PHONE_TAG: &str = "[PHONE_REDACTED]";
pub const SSN_TAG: &str = "[SSN_REDACTED]";
pub const CARD_TAG: &str = "[CARD_REDACTED]";
pub const IP_TAG: &str = "[IP_REDACTED]";
pub const API_KEY_TAG: &str = "[API_KEY_REDACTED]";

static API_KEY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?i:sk|pk|rk|api|key|token|secret)[-_][A-Za-z0-9_\-]{16,}").unwrap()
});
static EMAIL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").unwrap());
// 13-19 digits, optionally separated by spaces or dashes. Must run before the
// SSN and phone patterns so longer digit runs are not claimed piecemeal.
static CARD_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d(?:[ \-]?\d){12,18}\b").unwrap());
static SSN_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b|\b\d{9}\b").unwrap());
static IP_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap());
static PHONE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\+\d{1,2}[ .\-]?)?(?:\(\d{3}\)[ .\-]?|\b\d{3}[ .\-])\d{3}[ .\-]\d{4}\b")
        .unwrap()
});

/// Redact PII patterns in a single string.
pub fn scrub_text(text: &str) -> String {
    let text = API_KEY_PATTERN.replace_all(text, API_KEY_TAG);
    let text = EMAIL_PATTERN.replace_all(&text, EMAIL_TAG);
    let text = CARD_PATTERN.replace_all(&text, CARD_TAG);
    let text = SSN_PATTERN.replace_all(&text, SSN_TAG);
    let text = IP_PATTERN.replace_all(&text, IP_TAG);
    let text = PHONE_PATTERN.replace_all(&text, PHONE_TAG);
    text.into_owned()
}

/// Redact PII recursively through a JSON value.
///
/// Leaf strings are scrubbed; objects and arrays are rebuilt with the same
/// keys and element order; every other scalar passes through unchanged.
pub fn scrub_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(scrub_text(s)),
        Value::Array(items) => Value::Array(items.iter().map(scrub_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), scrub_value(item)))
                .collect(),
        ),
        other => other.clone(),
    }
}
