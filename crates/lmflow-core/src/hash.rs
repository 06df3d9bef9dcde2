//! Content hashing and cache-key derivation using blake3.
//!
//! All content is identified by a 256-bit blake3 digest rendered as
//! lowercase hex: identical bytes always produce the identical hash.
//! Cache keys compose the operation-identifying slice of a step's
//! parameters (canonical JSON, inputs list removed) with the ordered list
//! of resolved input content hashes.
//!
//! # Determinism
//!
//! - Canonical JSON (see [`crate::canonical`]) is the only serialization
//!   that feeds a hash.
//! - Input hashes are joined in recipe order, never sorted.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::canonical::to_canonical_json;
use crate::recipe::StepParams;

/// A 256-bit content digest in lowercase hex form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

/// Primary key of the global result cache.
///
/// Two computations whose operation parameters (minus inputs) and ordered
/// input content hashes match produce the same cache key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl ContentHash {
    /// Hashes a content string.
    pub fn of(content: &str) -> Self {
        ContentHash(blake3::hash(content.as_bytes()).to_hex().to_string())
    }

    /// The hash of the empty string, used as the SCC iteration seed.
    pub fn empty() -> Self {
        ContentHash::of("")
    }

    /// Wraps an already-rendered hex digest (e.g. loaded from storage).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        ContentHash(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl CacheKey {
    /// Derives the cache key for a step from its parameters and the ordered
    /// list of resolved input content hashes.
    ///
    /// The preimage is `canonical_json(params \ inputs) || "|" ||
    /// join(",", input_hashes)`.
    pub fn compute(
        params: &StepParams,
        input_hashes: &[ContentHash],
    ) -> Result<CacheKey, serde_json::Error> {
        let mut value = serde_json::to_value(params)?;
        if let Some(object) = value.as_object_mut() {
            object.remove("inputs");
        }
        let operation_slice = to_canonical_json(&value);
        let joined: Vec<&str> = input_hashes.iter().map(ContentHash::as_str).collect();
        let preimage = format!("{}|{}", operation_slice, joined.join(","));
        Ok(CacheKey(
            blake3::hash(preimage.as_bytes()).to_hex().to_string(),
        ))
    }

    pub fn from_hex(hex: impl Into<String>) -> Self {
        CacheKey(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::InputDescriptor;

    #[test]
    fn content_hash_is_deterministic_and_hex() {
        let a = ContentHash::of("hello");
        let b = ContentHash::of("hello");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a.as_str(), a.as_str().to_lowercase());
    }

    #[test]
    fn different_content_different_hash() {
        assert_ne!(ContentHash::of("a"), ContentHash::of("b"));
    }

    #[test]
    fn cache_key_ignores_inputs_list_but_not_input_hashes() {
        // Same operation, structurally different input descriptors that
        // resolve to the same content must collide on purpose.
        let via_constant = StepParams::new(
            "identity",
            vec![InputDescriptor::Constant {
                value: "x".to_string(),
            }],
        );
        let via_content = StepParams::new(
            "identity",
            vec![InputDescriptor::Content {
                hash: ContentHash::of("x"),
            }],
        );
        let hashes = [ContentHash::of("x")];
        let a = CacheKey::compute(&via_constant, &hashes).unwrap();
        let b = CacheKey::compute(&via_content, &hashes).unwrap();
        assert_eq!(a, b);

        let other = CacheKey::compute(&via_constant, &[ContentHash::of("y")]).unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn cache_key_depends_on_operation_and_settings() {
        let hashes = [ContentHash::of("x")];
        let identity = StepParams::new("identity", vec![]);
        let concat = StepParams::new("concat", vec![]);
        assert_ne!(
            CacheKey::compute(&identity, &hashes).unwrap(),
            CacheKey::compute(&concat, &hashes).unwrap()
        );

        let mut prompted = StepParams::new("llm", vec![]);
        prompted
            .settings
            .insert("prompt".to_string(), "summarize".into());
        let mut other_prompt = StepParams::new("llm", vec![]);
        other_prompt
            .settings
            .insert("prompt".to_string(), "translate".into());
        assert_ne!(
            CacheKey::compute(&prompted, &hashes).unwrap(),
            CacheKey::compute(&other_prompt, &hashes).unwrap()
        );
    }

    #[test]
    fn cache_key_respects_input_order() {
        let params = StepParams::new("concat", vec![]);
        let ab = [ContentHash::of("a"), ContentHash::of("b")];
        let ba = [ContentHash::of("b"), ContentHash::of("a")];
        assert_ne!(
            CacheKey::compute(&params, &ab).unwrap(),
            CacheKey::compute(&params, &ba).unwrap()
        );
    }

    #[test]
    fn empty_hash_matches_hash_of_empty_string() {
        assert_eq!(ContentHash::empty(), ContentHash::of(""));
    }
}
