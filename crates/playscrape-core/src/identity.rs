//! Content-hash identity for records and images.
//!
//! A candidate without an explicit `id` is keyed by the md5 hex digest of
//! its own `url` field, falling back to the URL of the page it came from.
//! The same input always yields the same id.

use serde_json::Value;

/// md5 hex digest of a string.
pub fn content_hash(data: &str) -> String {
    format!("{:x}", md5::compute(data.as_bytes()))
}

/// Non-empty string or number stored under `key`, rendered as a string.
fn field_as_string(candidate: &Value, key: &str) -> Option<String> {
    match candidate.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The URL a candidate is stored under: its own `url` field, else the page URL.
pub fn record_url(candidate: &Value, page_url: &str) -> String {
    field_as_string(candidate, "url").unwrap_or_else(|| page_url.to_string())
}

/// Identity of a candidate: an explicit `id` field, else the hash of
/// [`record_url`].
pub fn record_id(candidate: &Value, page_url: &str) -> String {
    field_as_string(candidate, "id").unwrap_or_else(|| content_hash(&record_url(candidate, page_url)))
}
