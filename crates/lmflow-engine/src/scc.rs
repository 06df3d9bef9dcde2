//! The SCC evaluator: bounded Jacobi iteration over cyclic clusters.
//!
//! Mutually recursive derivations get a well-defined value by unrolling
//! the cluster a fixed number of times against a seed buffer. One pass
//! resolves every member in a deterministic order; each member resolution
//! starts with a fresh per-member budget of `iterations`, every entry into
//! a member's computation consumes one unit, and budget exhaustion
//! substitutes the buffered seed instead of recursing. The buffer is read
//! only during the pass (Jacobi, not Gauss-Seidel); intermediate step
//! results persist through the ordinary cache, so replays are bit-stable.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use lmflow_core::canonical::canonicalize;
use lmflow_core::{
    CacheStatus, ContentHash, DependencyNode, DerivationId, ExecutionTree, InputDescriptor,
    SccMetadata, StepId, StepParams,
};
use lmflow_storage::{Derivation, SqliteStore};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::eval::{BoxFuture, EvalOptions, StepResult};

/// How members are seeded before the pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedPolicy {
    /// Every member starts from the empty string.
    Empty,
    /// Members start from their previous cached output, falling back to
    /// `Empty` when no usable cache row exists.
    LastCache,
}

/// Per-request SCC options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SccOptions {
    /// How many recipe unrollings terminate in the seed. Minimum 1.
    pub iterations: u32,
    pub seed_policy: SeedPolicy,
}

impl Default for SccOptions {
    fn default() -> Self {
        SccOptions {
            iterations: 1,
            seed_policy: SeedPolicy::Empty,
        }
    }
}

/// One member's buffered value.
#[derive(Debug, Clone)]
pub(crate) struct SeedEntry {
    pub output: String,
    pub content_hash: ContentHash,
    pub tree: ExecutionTree,
}

/// The explicit context threaded through one member's resolution. Never a
/// global: intra-SCC recursion is bounded by `remaining_budget` alone.
pub(crate) struct SccContext {
    pub scc_id: String,
    pub buffer: Arc<BTreeMap<DerivationId, SeedEntry>>,
    pub remaining_budget: BTreeMap<DerivationId, u32>,
}

impl SccContext {
    pub fn is_member(&self, id: &DerivationId) -> bool {
        self.buffer.contains_key(id)
    }
}

impl Engine {
    /// Runs one Jacobi pass over a cyclic cluster and returns every
    /// member's result, tagged with the cluster metadata.
    pub(crate) async fn evaluate_scc(
        &mut self,
        scc_id: &str,
        member_ids: &[DerivationId],
        opts: &EvalOptions,
        target: &DerivationId,
        skip_cache: bool,
    ) -> Result<BTreeMap<DerivationId, StepResult>, EngineError> {
        let iterations = opts.scc_options.iterations.max(1);
        tracing::debug!(
            scc = scc_id,
            members = member_ids.len(),
            iterations,
            "evaluating cyclic cluster"
        );

        let mut members = Vec::with_capacity(member_ids.len());
        for id in member_ids {
            members.push(
                self.store
                    .find_derivation(id)?
                    .ok_or_else(|| EngineError::DerivationNotFound(id.clone()))?,
            );
        }
        order_members(&mut members)?;

        let buffer = Arc::new(build_seeds(
            &mut self.store,
            &members,
            opts.scc_options.seed_policy,
        )?);

        let mut sorted_ids: Vec<DerivationId> = member_ids.to_vec();
        sorted_ids.sort();
        let metadata = SccMetadata {
            scc_id: scc_id.to_string(),
            iteration_count: iterations,
            members: sorted_ids,
        };

        let mut results = BTreeMap::new();
        for member in &members {
            // Fresh budgets per member: every member's final expansion is
            // the recipe unrolled exactly `iterations` times.
            let mut ctx = SccContext {
                scc_id: scc_id.to_string(),
                buffer: Arc::clone(&buffer),
                remaining_budget: member_ids
                    .iter()
                    .map(|id| (id.clone(), iterations))
                    .collect(),
            };
            let skip = skip_cache && member.derivation_id == *target;
            let mut result = self
                .resolve_scc_member(member.derivation_id.clone(), &mut ctx, opts, skip)
                .await?;
            result.execution_tree.scc_metadata = Some(metadata.clone());
            results.insert(member.derivation_id.clone(), result);
        }
        Ok(results)
    }

    /// Resolves one intra-SCC reference (or the pass-level entry for a
    /// member). Consumes one budget unit per entry; at zero, the buffered
    /// seed is substituted and recursion stops.
    pub(crate) fn resolve_scc_member<'a>(
        &'a mut self,
        id: DerivationId,
        ctx: &'a mut SccContext,
        opts: &'a EvalOptions,
        skip_cache: bool,
    ) -> BoxFuture<'a, Result<StepResult, EngineError>> {
        Box::pin(async move {
            let budget = ctx.remaining_budget.get_mut(&id).ok_or_else(|| {
                EngineError::Unexpected(format!("{} is not a member of {}", id, ctx.scc_id))
            })?;
            if *budget == 0 {
                let seed = ctx.buffer.get(&id).ok_or_else(|| {
                    EngineError::Unexpected(format!("no buffered value for {}", id))
                })?;
                return Ok(StepResult {
                    output: seed.output.clone(),
                    content_hash: seed.content_hash.clone(),
                    execution_tree: seed.tree.clone(),
                    tokens_output: None,
                });
            }
            *budget -= 1;

            // The caller is already inside the cluster iteration, so the
            // plan's SCC check is skipped and evaluation goes straight to
            // the member's root step.
            let derivation = self
                .store
                .find_derivation(&id)?
                .ok_or_else(|| EngineError::DerivationNotFound(id.clone()))?;
            self.compute_step(
                derivation.final_step_id.clone(),
                derivation.recipe_params,
                opts,
                skip_cache,
                Some(ctx),
            )
            .await
        })
    }
}

/// Sorts members by `(hash(canonical(normalized recipe)), created_at,
/// derivation_id)` so structurally equivalent members order identically
/// across databases that assigned them different ids.
fn order_members(members: &mut [Derivation]) -> Result<(), EngineError> {
    let mut keys: BTreeMap<DerivationId, String> = BTreeMap::new();
    for member in members.iter() {
        let canonical = canonicalize(&normalize_recipe(&member.recipe_params))
            .map_err(|e| EngineError::Unexpected(format!("recipe normalization failed: {}", e)))?;
        keys.insert(
            member.derivation_id.clone(),
            blake3::hash(canonical.as_bytes()).to_hex().to_string(),
        );
    }
    members.sort_by(|a, b| {
        (&keys[&a.derivation_id], a.created_at, &a.derivation_id)
            .cmp(&(&keys[&b.derivation_id], b.created_at, &b.derivation_id))
    });
    Ok(())
}

const PLACEHOLDER: &str = "_";

/// Replaces non-semantic identifiers (derivation ids, step ids, paths,
/// hashes, constant values) with fixed placeholders, so that structurally
/// equivalent recipes normalize identically.
fn normalize_recipe(params: &StepParams) -> StepParams {
    StepParams {
        operation: params.operation.clone(),
        settings: params.settings.clone(),
        inputs: params
            .inputs
            .iter()
            .map(|input| match input {
                InputDescriptor::Content { .. } => InputDescriptor::Content {
                    hash: ContentHash::from_hex(PLACEHOLDER),
                },
                InputDescriptor::Constant { .. } => InputDescriptor::Constant {
                    value: PLACEHOLDER.to_string(),
                },
                InputDescriptor::PinnedPath { .. } => InputDescriptor::PinnedPath {
                    path: PLACEHOLDER.to_string(),
                },
                InputDescriptor::Derivation { .. } => InputDescriptor::Derivation {
                    id: DerivationId::new(PLACEHOLDER),
                },
                InputDescriptor::ComputedStep { step } => InputDescriptor::ComputedStep {
                    step: Box::new(normalize_recipe(step)),
                },
                InputDescriptor::InternalStepLink { .. } => InputDescriptor::InternalStepLink {
                    target_step_id: StepId::new(PLACEHOLDER),
                },
            })
            .collect(),
    }
}

/// Populates the iteration buffer for every member.
fn build_seeds(
    store: &mut SqliteStore,
    members: &[Derivation],
    policy: SeedPolicy,
) -> Result<BTreeMap<DerivationId, SeedEntry>, EngineError> {
    // The empty blob backs the empty policy and every fallback.
    let empty_hash = ContentHash::empty();
    store.put_content(&empty_hash, "")?;

    let mut seeds = BTreeMap::new();
    for member in members {
        let entry = match policy {
            SeedPolicy::Empty => empty_seed(member, &empty_hash),
            SeedPolicy::LastCache => match last_cache_seed(store, member)? {
                Some(entry) => entry,
                None => {
                    tracing::debug!(
                        member = %member.derivation_id,
                        "no usable cached seed; falling back to empty"
                    );
                    empty_seed(member, &empty_hash)
                }
            },
        };
        seeds.insert(member.derivation_id.clone(), entry);
    }
    Ok(seeds)
}

fn empty_seed(member: &Derivation, empty_hash: &ContentHash) -> SeedEntry {
    SeedEntry {
        output: String::new(),
        content_hash: empty_hash.clone(),
        tree: ExecutionTree {
            operation: member.recipe_params.operation.clone(),
            cache_status: CacheStatus::Cached,
            content_hash: empty_hash.clone(),
            warnings: vec![],
            children: vec![],
            scc_metadata: None,
        },
    }
}

/// Loads the member's previous output through its step link. Returns
/// `None` (fall back to empty) when there is no link, the blob is gone, or
/// the stored dependency shape no longer matches the current recipe.
fn last_cache_seed(
    store: &SqliteStore,
    member: &Derivation,
) -> Result<Option<SeedEntry>, EngineError> {
    let linked = match store.find_result_by_step(&member.final_step_id)? {
        Some(linked) => linked,
        None => return Ok(None),
    };
    if !shape_matches(&linked.dependency_tree, &member.recipe_params.inputs) {
        return Ok(None);
    }
    let output = match store.get_content(&linked.row.output_content_hash)? {
        Some(output) => output,
        None => return Ok(None),
    };
    Ok(Some(SeedEntry {
        output,
        content_hash: linked.row.output_content_hash.clone(),
        tree: ExecutionTree {
            operation: member.recipe_params.operation.clone(),
            cache_status: CacheStatus::Cached,
            content_hash: linked.row.output_content_hash,
            warnings: linked.row.warnings,
            children: linked.dependency_tree,
            scc_metadata: None,
        },
    }))
}

/// Positional kind comparison between a stored dependency tree and the
/// current input list.
fn shape_matches(tree: &[DependencyNode], inputs: &[InputDescriptor]) -> bool {
    tree.len() == inputs.len()
        && tree.iter().zip(inputs).all(|(node, input)| {
            matches!(
                (node, input),
                (DependencyNode::Content { .. }, InputDescriptor::Content { .. })
                    | (DependencyNode::Constant { .. }, InputDescriptor::Constant { .. })
                    | (
                        DependencyNode::PinnedPath { .. },
                        InputDescriptor::PinnedPath { .. }
                    )
                    | (
                        DependencyNode::Derivation { .. },
                        InputDescriptor::Derivation { .. }
                    )
                    | (
                        DependencyNode::ComputedStep { .. },
                        InputDescriptor::InternalStepLink { .. }
                    )
            )
        })
}
