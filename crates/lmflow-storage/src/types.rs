//! Storage-layer row types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lmflow_core::{CacheKey, ContentHash, DependencyNode, DerivationId, DocId, StepId, StepParams, Warning};

/// A user-facing derivation row.
///
/// `recipe_params` stores the flattened parameters of the root step, so
/// the recipe can be evaluated without an extra step lookup. Multiple
/// derivations may share a `final_step_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Derivation {
    pub derivation_id: DerivationId,
    pub recipe_params: StepParams,
    pub label: Option<String>,
    pub final_step_id: StepId,
    pub dsl_expression: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A resolved `pinned_path` input, persisted on the result row so a trace
/// can show which document revision fed the computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPin {
    pub doc_id: DocId,
    pub content_hash: ContentHash,
}

/// One row of the global result cache.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResultRow {
    pub cache_key: CacheKey,
    pub output_content_hash: ContentHash,
    pub resolved_pinned_input_hashes: BTreeMap<String, ResolvedPin>,
    pub input_content_hashes: Vec<ContentHash>,
    pub warnings: Vec<Warning>,
    pub computed_at: DateTime<Utc>,
}

/// A cache row reached through a step's link, together with that step's
/// own materialized dependency tree.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkedStepResult {
    pub row: StepResultRow,
    pub dependency_tree: Vec<DependencyNode>,
}
