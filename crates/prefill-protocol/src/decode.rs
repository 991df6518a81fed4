//! Case-insensitive JSON decoding.
//!
//! The worker is free to spell `challengeId`, `ChallengeId` or `challenge_id`.
//! Incoming documents are folded before deserialization: every object key is
//! lowercased and stripped of `_` and `-`. Types that are read from the
//! worker declare their deserialize names in that folded form.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Fold a single key: lowercase ASCII, drop `_` and `-`.
pub fn fold_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_' && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Recursively fold every object key in `value`.
pub fn fold_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let folded: Map<String, Value> = map
                .into_iter()
                .map(|(key, value)| (fold_key(&key), fold_keys(value)))
                .collect();
            Value::Object(folded)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(fold_keys).collect()),
        other => other,
    }
}

/// Parse `text` and deserialize it with folded keys.
pub fn from_str_ci<T: DeserializeOwned>(text: &str) -> serde_json::Result<T> {
    let value: Value = serde_json::from_str(text)?;
    from_value_ci(value)
}

/// Deserialize an already parsed value with folded keys.
pub fn from_value_ci<T: DeserializeOwned>(value: Value) -> serde_json::Result<T> {
    serde_json::from_value(fold_keys(value))
}
