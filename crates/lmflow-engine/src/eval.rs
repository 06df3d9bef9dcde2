//! The evaluator: step- and derivation-level computation.
//!
//! `compute_step` validates the recipe against the operation's schema,
//! resolves inputs in recipe order (re-entering the evaluator for
//! referenced derivations and sub-steps), probes the global result cache,
//! executes the operation, and persists the outcome atomically.
//!
//! The short-circuit invariant lives in the cache probe: whenever the
//! ordered input hash list matches a prior computation under the same
//! operation parameters, the operation is NOT re-invoked, even if an
//! upstream derivation recomputed. That is what makes unchanged content
//! propagate caching through idempotent pipelines.
//!
//! Recursion between the evaluator, the dependency resolver, and the SCC
//! evaluator is mutual; it is expressed through explicit arguments (the
//! immutable [`EvalOptions`] bundle and the `&mut SccContext`), never
//! through globals.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;

use lmflow_core::{
    CacheKey, CacheStatus, ContentHash, DependencyNode, DerivationId, ExecutionTree,
    InputDescriptor, StepId, StepParams,
};
use lmflow_storage::{ResolvedPin, StepResultRow};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::events::{EngineEvent, EventObserver};
use crate::ops::{OpError, OpRequest};
use crate::plan::ExecutionPlan;
use crate::scc::{SccContext, SccOptions};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The immutable options bundle carried by value through every recursive
/// evaluator call: the shared plan, the per-request SCC options, and the
/// per-request observer. `skip_cache` travels separately because it only
/// applies to the root step of the requested derivation.
pub(crate) struct EvalOptions {
    pub plan: Arc<ExecutionPlan>,
    pub scc_options: SccOptions,
    pub observer: Option<Arc<dyn EventObserver>>,
}

/// What one step (or one derivation) resolved to.
#[derive(Debug, Clone)]
pub(crate) struct StepResult {
    pub output: String,
    pub content_hash: ContentHash,
    pub execution_tree: ExecutionTree,
    pub tokens_output: Option<u64>,
}

impl Engine {
    /// Resolves a derivation inside an existing plan. Cyclic derivations
    /// are delegated to the SCC evaluator; acyclic ones go straight to
    /// their root step. Emits `step-complete` for every derivation
    /// resolved.
    pub(crate) fn compute_derivation_inner<'a>(
        &'a mut self,
        id: DerivationId,
        opts: &'a EvalOptions,
        skip_cache: bool,
    ) -> BoxFuture<'a, Result<StepResult, EngineError>> {
        Box::pin(async move {
            if let Some((scc_id, member_ids)) = opts.plan.scc_of(&id) {
                let scc_id = scc_id.to_string();
                let member_ids = member_ids.to_vec();
                let mut results = self
                    .evaluate_scc(&scc_id, &member_ids, opts, &id, skip_cache)
                    .await?;
                for (member_id, result) in &results {
                    self.emit(
                        opts,
                        &EngineEvent::StepComplete {
                            derivation_id: member_id.clone(),
                            execution_tree: result.execution_tree.clone(),
                            tokens_output: result.tokens_output,
                        },
                    );
                }
                results.remove(&id).ok_or_else(|| {
                    EngineError::Unexpected(format!("cluster evaluation lost member {}", id))
                })
            } else {
                let derivation = self
                    .store
                    .find_derivation(&id)?
                    .ok_or_else(|| EngineError::DerivationNotFound(id.clone()))?;
                let result = self
                    .compute_step(
                        derivation.final_step_id.clone(),
                        derivation.recipe_params,
                        opts,
                        skip_cache,
                        None,
                    )
                    .await?;
                self.emit(
                    opts,
                    &EngineEvent::StepComplete {
                        derivation_id: id,
                        execution_tree: result.execution_tree.clone(),
                        tokens_output: result.tokens_output,
                    },
                );
                Ok(result)
            }
        })
    }

    /// Computes one step: validate, resolve inputs, probe the cache,
    /// execute, persist.
    pub(crate) fn compute_step<'a>(
        &'a mut self,
        step_id: StepId,
        params: StepParams,
        opts: &'a EvalOptions,
        skip_cache: bool,
        mut scc: Option<&'a mut SccContext>,
    ) -> BoxFuture<'a, Result<StepResult, EngineError>> {
        Box::pin(async move {
            tracing::debug!(step = %step_id, operation = %params.operation, "computing step");

            // 1. Schema validation.
            let executor = self
                .registry
                .get(&params.operation)
                .ok_or_else(|| EngineError::UnsupportedOperation(params.operation.clone()))?;
            let arity = executor.arity();
            if !arity.accepts(params.inputs.len()) {
                return Err(EngineError::InvalidInputArity {
                    operation: params.operation.clone(),
                    expected: arity,
                    actual: params.inputs.len(),
                });
            }

            // 2. Resolve inputs in recipe order.
            let mut children: Vec<DependencyNode> = Vec::with_capacity(params.inputs.len());
            let mut input_hashes: Vec<ContentHash> = Vec::with_capacity(params.inputs.len());
            let mut inline_values: Vec<Option<String>> = Vec::with_capacity(params.inputs.len());
            let mut resolved_pinned: BTreeMap<String, ResolvedPin> = BTreeMap::new();

            for input in &params.inputs {
                match input {
                    InputDescriptor::Content { hash } => {
                        children.push(DependencyNode::Content { hash: hash.clone() });
                        input_hashes.push(hash.clone());
                        inline_values.push(None);
                    }
                    InputDescriptor::Constant { value } => {
                        let hash = ContentHash::of(value);
                        self.store.put_content(&hash, value)?;
                        children.push(DependencyNode::Constant { hash: hash.clone() });
                        input_hashes.push(hash);
                        inline_values.push(Some(value.clone()));
                    }
                    InputDescriptor::PinnedPath { path } => {
                        let doc_id = self.store.find_doc_by_path(path)?.ok_or_else(|| {
                            EngineError::PinnedPathNotFound { path: path.clone() }
                        })?;
                        let hash = self.store.get_document_hash(&doc_id)?.ok_or_else(|| {
                            EngineError::PinnedContentHashNotFound {
                                path: path.clone(),
                                doc_id: doc_id.clone(),
                            }
                        })?;
                        resolved_pinned.insert(
                            path.clone(),
                            ResolvedPin {
                                doc_id,
                                content_hash: hash.clone(),
                            },
                        );
                        children.push(DependencyNode::PinnedPath { hash: hash.clone() });
                        input_hashes.push(hash);
                        inline_values.push(None);
                    }
                    InputDescriptor::Derivation { id } => {
                        let sub = match scc.as_deref_mut() {
                            Some(ctx) if ctx.is_member(id) => {
                                self.resolve_scc_member(id.clone(), ctx, opts, false).await?
                            }
                            // Derivations outside the current cluster are
                            // ordinary recursive resolutions, without the
                            // cluster context.
                            _ => self.compute_derivation_inner(id.clone(), opts, false).await?,
                        };
                        input_hashes.push(sub.content_hash.clone());
                        inline_values.push(Some(sub.output.clone()));
                        children.push(sub.execution_tree.into_derivation_node());
                    }
                    InputDescriptor::InternalStepLink { target_step_id } => {
                        let child_params = self
                            .store
                            .get_step_params(target_step_id)?
                            .ok_or_else(|| EngineError::StepNotFound(target_step_id.clone()))?;
                        let sub = self
                            .compute_step(
                                target_step_id.clone(),
                                child_params,
                                opts,
                                false,
                                scc.as_deref_mut(),
                            )
                            .await?;
                        input_hashes.push(sub.content_hash.clone());
                        inline_values.push(Some(sub.output.clone()));
                        children.push(sub.execution_tree.into_computed_step_node());
                    }
                    InputDescriptor::ComputedStep { .. } => {
                        return Err(EngineError::Unexpected(
                            "unflattened computed_step input reached evaluation".to_string(),
                        ));
                    }
                }
            }

            // 3. Cache probe. An existing row for the key means the
            //    operation must not run again.
            let cache_key = CacheKey::compute(&params, &input_hashes).map_err(|e| {
                EngineError::Unexpected(format!("cache key serialization failed: {}", e))
            })?;
            if !skip_cache {
                if let Some(row) = self.store.find_result_by_cache_key(&cache_key)? {
                    match self.store.get_content(&row.output_content_hash)? {
                        Some(output) => {
                            self.store
                                .link_step_to_cache(&step_id, &cache_key, &children)?;
                            tracing::debug!(step = %step_id, key = %cache_key, "cache hit");
                            return Ok(StepResult {
                                output,
                                content_hash: row.output_content_hash.clone(),
                                execution_tree: ExecutionTree {
                                    operation: params.operation.clone(),
                                    cache_status: CacheStatus::Cached,
                                    content_hash: row.output_content_hash,
                                    warnings: row.warnings,
                                    children,
                                    scc_metadata: None,
                                },
                                tokens_output: None,
                            });
                        }
                        None => {
                            tracing::warn!(
                                key = %cache_key,
                                hash = %row.output_content_hash,
                                "cached output blob missing, recomputing"
                            );
                        }
                    }
                }
            }

            // 4. Execute with materialized input contents.
            let mut input_contents = Vec::with_capacity(input_hashes.len());
            for (hash, inline) in input_hashes.iter().zip(inline_values) {
                match inline {
                    Some(value) => input_contents.push(value),
                    None => input_contents.push(
                        self.store.get_content(hash)?.ok_or_else(|| {
                            EngineError::InputContentHashNotFound {
                                step_id: step_id.clone(),
                                hash: hash.clone(),
                            }
                        })?,
                    ),
                }
            }
            let outcome = executor
                .execute(
                    OpRequest {
                        inputs: &input_contents,
                        settings: &params.settings,
                    },
                    &self.env,
                )
                .await
                .map_err(|err| match err {
                    OpError::Reported(message) => EngineError::OperationResultError {
                        operation: params.operation.clone(),
                        message,
                    },
                    OpError::Unspecified(message) => EngineError::UnspecifiedOperationFailure {
                        operation: params.operation.clone(),
                        message,
                    },
                })?;

            // 5. Persist output blob, cache row, and step link atomically.
            let output_hash = ContentHash::of(&outcome.output);
            let row = StepResultRow {
                cache_key: cache_key.clone(),
                output_content_hash: output_hash.clone(),
                resolved_pinned_input_hashes: resolved_pinned,
                input_content_hashes: input_hashes,
                warnings: outcome.warnings.clone(),
                computed_at: Utc::now(),
            };
            self.store
                .commit_step_result(&step_id, &row, &outcome.output, &children)
                .map_err(EngineError::DerivationStoreFailure)?;

            // 6. Offer the fresh output to the embedding sink; failures are
            //    logged, never propagated.
            if let Some(sink) = self.embedding.clone() {
                if let Err(err) = sink.submit(&output_hash, &outcome.output).await {
                    tracing::warn!(error = %err, hash = %output_hash, "embedding sink failed");
                }
            }

            Ok(StepResult {
                output: outcome.output,
                content_hash: output_hash.clone(),
                execution_tree: ExecutionTree {
                    operation: params.operation,
                    cache_status: CacheStatus::Computed,
                    content_hash: output_hash,
                    warnings: outcome.warnings,
                    children,
                    scc_metadata: None,
                },
                tokens_output: outcome.tokens_output,
            })
        })
    }
}
