use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

pub const REDACTED_PLACEHOLDER: &str = "[REDACTED]";

const SENSITIVE_KEY_MARKERS: &[&str] = &[
    "password",
    "secret",
    "token",
    "api_key",
    "apikey",
    "credential",
    "auth",
    "passphrase",
    "private_key",
];

pub fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    SENSITIVE_KEY_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Deep copy of `args` with every value under a sensitive-looking key
/// replaced by a fixed placeholder, at any nesting depth.
pub fn sanitize_args(args: &Map<String, Value>) -> Map<String, Value> {
    args.iter()
        .map(|(key, value)| {
            if is_sensitive_key(key) {
                (key.clone(), Value::String(REDACTED_PLACEHOLDER.to_string()))
            } else {
                (key.clone(), sanitize_value(value))
            }
        })
        .collect()
}

fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(sanitize_args(map)),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_value).collect()),
        other => other.clone(),
    }
}

/// SHA-256 over the sanitized, canonically serialized arguments.
/// serde_json's default map keeps keys sorted, so the same arguments
/// hash identically no matter how the caller ordered them.
pub fn hash_args(args: &Map<String, Value>) -> String {
    let canonical = Value::Object(sanitize_args(args)).to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}
