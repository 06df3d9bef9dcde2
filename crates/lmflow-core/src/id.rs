//! Stable identifier newtypes for engine entities.
//!
//! All IDs are distinct newtype wrappers over `String`, providing type
//! safety so that a `StepId` cannot be accidentally used where a
//! `DerivationId` is expected. Derivation ids are human-readable slugs;
//! step and document ids are opaque random identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// User-facing derivation identity: a human-readable slug.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DerivationId(String);

/// Opaque identity of an atomic recipe step (random 128-bit, uuid v4).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

/// Identity of a document row in the path-pinning table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(String);

impl DerivationId {
    pub fn new(id: impl Into<String>) -> Self {
        DerivationId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        StepId(id.into())
    }

    /// Allocates a fresh collision-free step id.
    pub fn random() -> Self {
        StepId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl DocId {
    pub fn new(id: impl Into<String>) -> Self {
        DocId(id.into())
    }

    pub fn random() -> Self {
        DocId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DerivationId {
    fn from(s: &str) -> Self {
        DerivationId(s.to_string())
    }
}

impl fmt::Display for DerivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_step_ids_are_unique() {
        let a = StepId::random();
        let b = StepId::random();
        assert_ne!(a, b);
    }

    #[test]
    fn derivation_id_display() {
        assert_eq!(format!("{}", DerivationId::from("report-summary")), "report-summary");
    }

    #[test]
    fn serde_is_transparent() {
        let id = DerivationId::from("alpha");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"alpha\"");
        let back: DerivationId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
