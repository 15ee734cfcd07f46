//! Structured redaction for trace payloads.
//!
//! Telemetry must never persist secrets. The scrubber walks JSON payloads
//! replacing values under sensitive keys and masking secret-shaped
//! substrings in strings. Recursion is depth-limited and oversized payloads
//! collapse to a digest summary instead of being stored.

use std::collections::HashSet;

use regex::Regex;
use sha2::{Digest, Sha256};

/// Maximum recursion depth before the subtree is dropped.
const MAX_DEPTH: usize = 10;

/// Maximum serialized payload size kept in a trace.
const MAX_PAYLOAD_BYTES: usize = 50 * 1024;

/// Replacement for redacted values.
const REDACTED: &str = "[REDACTED]";

/// Structured payload scrubber.
pub struct Scrubber {
    patterns: Vec<Regex>,
    sensitive_keys: HashSet<&'static str>,
}

impl Default for Scrubber {
    fn default() -> Self {
        let patterns = [
            // Bearer tokens and API-key shaped strings.
            r"(?i)bearer\s+[a-zA-Z0-9._\-]{8,}",
            r"sk-[a-zA-Z0-9]{8,}",
            r"AKIA[0-9A-Z]{16}",
            r"ghp_[a-zA-Z0-9]{20,}",
            // JWTs.
            r"eyJ[a-zA-Z0-9_\-]{8,}\.[a-zA-Z0-9_\-]+\.[a-zA-Z0-9_\-]+",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("valid scrub pattern"))
        .collect();

        let sensitive_keys = HashSet::from([
            "api_key",
            "apikey",
            "authorization",
            "password",
            "secret",
            "token",
            "access_token",
            "refresh_token",
            "master_key",
            "private_key",
        ]);

        Self {
            patterns,
            sensitive_keys,
        }
    }
}

impl Scrubber {
    /// Scrub a payload for trace storage.
    ///
    /// Oversized payloads are replaced by a `sha256` summary so the trace
    /// records that content existed without persisting it.
    #[must_use]
    pub fn scrub(&self, value: &serde_json::Value) -> serde_json::Value {
        let serialized = value.to_string();
        if serialized.len() > MAX_PAYLOAD_BYTES {
            let digest = Sha256::digest(serialized.as_bytes());
            return serde_json::json!({
                "truncated": true,
                "bytes": serialized.len(),
                "sha256": hex::encode(digest),
            });
        }

        self.scrub_value(value, 0)
    }

    fn scrub_value(&self, value: &serde_json::Value, depth: usize) -> serde_json::Value {
        if depth > MAX_DEPTH {
            return serde_json::Value::String("[MAX_DEPTH]".into());
        }

        match value {
            serde_json::Value::Object(map) => {
                let mut scrubbed = serde_json::Map::with_capacity(map.len());
                for (key, inner) in map {
                    if self.sensitive_keys.contains(key.to_lowercase().as_str()) {
                        scrubbed.insert(key.clone(), serde_json::Value::String(REDACTED.into()));
                    } else {
                        scrubbed.insert(key.clone(), self.scrub_value(inner, depth + 1));
                    }
                }
                serde_json::Value::Object(scrubbed)
            }
            serde_json::Value::Array(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|item| self.scrub_value(item, depth + 1))
                    .collect(),
            ),
            serde_json::Value::String(text) => {
                serde_json::Value::String(self.scrub_text(text))
            }
            other => other.clone(),
        }
    }

    /// Mask secret-shaped substrings in free text.
    #[must_use]
    pub fn scrub_text(&self, text: &str) -> String {
        let mut scrubbed = text.to_string();
        for pattern in &self.patterns {
            scrubbed = pattern.replace_all(&scrubbed, REDACTED).into_owned();
        }
        scrubbed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_keys_are_redacted() {
        let scrubber = Scrubber::default();
        let scrubbed = scrubber.scrub(&serde_json::json!({
            "api_key": "sk-supersecret123456",
            "Password": "hunter2",
            "message": "hello"
        }));
        assert_eq!(scrubbed["api_key"], REDACTED);
        assert_eq!(scrubbed["Password"], REDACTED);
        assert_eq!(scrubbed["message"], "hello");
    }

    #[test]
    fn secret_patterns_are_masked_in_text() {
        let scrubber = Scrubber::default();
        let scrubbed =
            scrubber.scrub_text("use Bearer abc123def456ghi and sk-0123456789abcdef please");
        assert!(!scrubbed.contains("abc123def456ghi"));
        assert!(!scrubbed.contains("sk-0123456789abcdef"));
        assert!(scrubbed.contains("please"));
    }

    #[test]
    fn depth_limit_stops_recursion() {
        let scrubber = Scrubber::default();
        let mut value = serde_json::json!("leaf");
        for _ in 0..15 {
            value = serde_json::json!({ "inner": value });
        }
        let scrubbed = scrubber.scrub(&value);
        assert!(scrubbed.to_string().contains("[MAX_DEPTH]"));
    }

    #[test]
    fn oversized_payload_becomes_digest() {
        let scrubber = Scrubber::default();
        let big = "x".repeat(60 * 1024);
        let scrubbed = scrubber.scrub(&serde_json::json!({ "content": big }));
        assert_eq!(scrubbed["truncated"], true);
        assert!(scrubbed["sha256"].is_string());
        assert!(scrubbed.get("content").is_none());
    }
}
