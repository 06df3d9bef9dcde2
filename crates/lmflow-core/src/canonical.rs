//! Canonical JSON rendering.
//!
//! `cache_key` derivation and stored `recipe_params` both depend on one
//! stable serialization: object keys sorted lexicographically, no
//! insignificant whitespace, strings escaped via serde_json, numbers in
//! serde_json's shortest round-trip form. Any other encoder in the
//! workspace is a bug.

use std::collections::BTreeMap;

use serde_json::Value;

/// Renders a `serde_json::Value` canonically.
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => escape_string(s),
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(to_canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        Value::Object(map) => {
            let mut sorted = BTreeMap::new();
            for (key, val) in map {
                sorted.insert(key, to_canonical_json(val));
            }
            let rendered: Vec<String> = sorted
                .into_iter()
                .map(|(key, val)| format!("{}:{}", escape_string(key), val))
                .collect();
            format!("{{{}}}", rendered.join(","))
        }
    }
}

/// Canonically renders any serializable value.
pub fn canonicalize<T: serde::Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    Ok(to_canonical_json(&value))
}

fn escape_string(s: &str) -> String {
    // serde_json's string encoder is already canonical for our purposes.
    serde_json::to_string(s).expect("string serialization is infallible")
}
