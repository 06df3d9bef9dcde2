//! Dependency and execution trees.
//!
//! A dependency tree mirrors the input list of a step, recording how each
//! input was resolved. It is persisted alongside every step-to-cache link
//! for trace rendering. An execution tree is a dependency tree plus the
//! root step's own operation, cache status, content hash, warnings, and
//! optional SCC metadata; it is what callers receive.

use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;
use crate::id::DerivationId;

/// Whether a step's value came from the result cache or a fresh invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Computed,
    Cached,
}

/// Non-fatal conditions attached to the node that produced them and to its
/// cache row; they survive cache hits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Warning {
    InputTooLarge { input_length: usize, limit: usize },
}

/// Attached to every member result of a cyclic cluster evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SccMetadata {
    pub scc_id: String,
    pub iteration_count: u32,
    pub members: Vec<DerivationId>,
}

/// One resolved input, in recipe order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DependencyNode {
    Content {
        hash: ContentHash,
    },
    Constant {
        hash: ContentHash,
    },
    PinnedPath {
        hash: ContentHash,
    },
    Derivation {
        operation: String,
        cache_status: CacheStatus,
        hash: ContentHash,
        warnings: Vec<Warning>,
        children: Vec<DependencyNode>,
    },
    ComputedStep {
        operation: String,
        cache_status: CacheStatus,
        hash: ContentHash,
        warnings: Vec<Warning>,
        children: Vec<DependencyNode>,
    },
}

/// The trace returned to callers: the root step's own status plus its
/// resolved inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTree {
    pub operation: String,
    pub cache_status: CacheStatus,
    pub content_hash: ContentHash,
    pub warnings: Vec<Warning>,
    pub children: Vec<DependencyNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scc_metadata: Option<SccMetadata>,
}

impl DependencyNode {
    /// The serde tag of this variant, used for shape comparisons.
    pub fn kind(&self) -> &'static str {
        match self {
            DependencyNode::Content { .. } => "content",
            DependencyNode::Constant { .. } => "constant",
            DependencyNode::PinnedPath { .. } => "pinned_path",
            DependencyNode::Derivation { .. } => "derivation",
            DependencyNode::ComputedStep { .. } => "computed_step",
        }
    }

    pub fn content_hash(&self) -> &ContentHash {
        match self {
            DependencyNode::Content { hash }
            | DependencyNode::Constant { hash }
            | DependencyNode::PinnedPath { hash }
            | DependencyNode::Derivation { hash, .. }
            | DependencyNode::ComputedStep { hash, .. } => hash,
        }
    }
}

impl ExecutionTree {
    /// Re-frames this tree as a `derivation` input of a downstream step.
    pub fn into_derivation_node(self) -> DependencyNode {
        DependencyNode::Derivation {
            operation: self.operation,
            cache_status: self.cache_status,
            hash: self.content_hash,
            warnings: self.warnings,
            children: self.children,
        }
    }

    /// Re-frames this tree as a `computed_step` input of its parent step.
    pub fn into_computed_step_node(self) -> DependencyNode {
        DependencyNode::ComputedStep {
            operation: self.operation,
            cache_status: self.cache_status,
            hash: self.content_hash,
            warnings: self.warnings,
            children: self.children,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&CacheStatus::Computed).unwrap(),
            "\"computed\""
        );
        assert_eq!(
            serde_json::to_string(&CacheStatus::Cached).unwrap(),
            "\"cached\""
        );
    }

    #[test]
    fn warning_carries_structured_fields() {
        let warning = Warning::InputTooLarge {
            input_length: 101,
            limit: 100,
        };
        let value = serde_json::to_value(&warning).unwrap();
        assert_eq!(value["type"], "input_too_large");
        assert_eq!(value["input_length"], 101);
        assert_eq!(value["limit"], 100);
    }

    #[test]
    fn execution_tree_reframes_as_dependency_node() {
        let tree = ExecutionTree {
            operation: "identity".to_string(),
            cache_status: CacheStatus::Computed,
            content_hash: ContentHash::of("hello"),
            warnings: vec![],
            children: vec![DependencyNode::Constant {
                hash: ContentHash::of("hello"),
            }],
            scc_metadata: None,
        };

        match tree.clone().into_derivation_node() {
            DependencyNode::Derivation {
                operation,
                cache_status,
                hash,
                children,
                ..
            } => {
                assert_eq!(operation, "identity");
                assert_eq!(cache_status, CacheStatus::Computed);
                assert_eq!(hash, ContentHash::of("hello"));
                assert_eq!(children.len(), 1);
            }
            other => panic!("expected derivation node, got {:?}", other),
        }

        assert_eq!(tree.into_computed_step_node().kind(), "computed_step");
    }

    #[test]
    fn scc_metadata_is_omitted_when_absent() {
        let tree = ExecutionTree {
            operation: "identity".to_string(),
            cache_status: CacheStatus::Cached,
            content_hash: ContentHash::empty(),
            warnings: vec![],
            children: vec![],
            scc_metadata: None,
        };
        let value = serde_json::to_value(&tree).unwrap();
        assert!(value.get("scc_metadata").is_none());
    }
}
