//! Payload redaction and canonical hashing.
//!
//! Outbox idempotency keys hash the *redacted* canonical form of a payload
//! so credential-bearing fields never influence (or leak through) stored
//! hashes. The scheme tag travels with every hash for future rotation.

use serde_json::Value;
use sha2::{Digest, Sha256};

pub const HASH_SCHEME: &str = "sha256:cjson:v1";

/// Key substrings treated as credential-bearing wherever they appear.
const SENSITIVE_KEYS: [&str; 8] = [
    "token",
    "secret",
    "password",
    "api_key",
    "apikey",
    "authorization",
    "private_key",
    "credential",
];

#[derive(Debug, Clone)]
pub struct Redacted {
    pub json: Value,
    pub fields_removed: Vec<String>,
    pub secrets_detected: bool,
    pub payload_hash: String,
    pub scheme: &'static str,
}

/// Strip credential-bearing fields and compute the canonical hash of what
/// remains.
pub fn redact(payload: &Value) -> Redacted {
    let mut json = payload.clone();
    let mut fields_removed = Vec::new();
    scrub(&mut json, "$", &mut fields_removed);

    let payload_hash = format!("{HASH_SCHEME}:{}", sha256_hex(canonicalize(&json).as_bytes()));
    Redacted {
        secrets_detected: !fields_removed.is_empty(),
        json,
        fields_removed,
        payload_hash,
        scheme: HASH_SCHEME,
    }
}

fn scrub(value: &mut Value, path: &str, removed: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            let doomed: Vec<String> = map
                .keys()
                .filter(|key| {
                    let lowered = key.to_lowercase();
                    SENSITIVE_KEYS.iter().any(|s| lowered.contains(s))
                })
                .cloned()
                .collect();
            for key in doomed {
                map.remove(&key);
                removed.push(format!("{path}.{key}"));
            }
            for (key, child) in map.iter_mut() {
                scrub(child, &format!("{path}.{key}"), removed);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter_mut().enumerate() {
                scrub(child, &format!("{path}[{i}]"), removed);
            }
        }
        _ => {}
    }
}

/// Deterministic JSON encoding: object keys sorted recursively, compact
/// separators. Equal values always hash equal regardless of key order.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        leaf => out.push_str(&serde_json::to_string(leaf).expect("leaf serializes")),
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_the_hash() {
        let a = json!({ "b": 1, "a": { "y": 2, "x": 3 } });
        let b = json!({ "a": { "x": 3, "y": 2 }, "b": 1 });
        assert_eq!(redact(&a).payload_hash, redact(&b).payload_hash);
    }

    #[test]
    fn hash_carries_the_scheme_tag() {
        let hashed = redact(&json!({ "body": "hello" }));
        assert!(hashed.payload_hash.starts_with("sha256:cjson:v1:"));
    }

    #[test]
    fn credential_fields_are_removed() {
        let payload = json!({
            "body": "hello",
            "github_token": "ghp_abc123",
            "nested": { "client_secret": "shh" },
        });
        let redacted = redact(&payload);
        assert!(redacted.secrets_detected);
        assert_eq!(redacted.fields_removed.len(), 2);
        assert!(redacted.json.get("github_token").is_none());
        assert!(redacted.json["nested"].get("client_secret").is_none());
        assert_eq!(redacted.json["body"], "hello");
    }

    #[test]
    fn redaction_changes_the_hash_only_via_removed_fields() {
        let with_secret = json!({ "body": "hi", "token": "a" });
        let other_secret = json!({ "body": "hi", "token": "b" });
        // Different secrets, same redacted form, same hash.
        assert_eq!(
            redact(&with_secret).payload_hash,
            redact(&other_secret).payload_hash
        );
    }

    #[test]
    fn canonical_form_is_compact() {
        assert_eq!(
            canonicalize(&json!({ "b": [1, 2], "a": null })),
            r#"{"a":null,"b":[1,2]}"#
        );
    }
}
