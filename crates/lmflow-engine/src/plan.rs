//! The planner: dependency discovery, SCC detection, and the
//! topologically ordered execution plan.
//!
//! Discovery walks recipes from the requested root, descending through
//! `internal_step_link`s and collecting only `derivation`-typed inputs.
//! Tarjan's algorithm (petgraph) finds the strongly connected components
//! of the derivation-to-derivation graph; the condensation is then
//! ordered with Kahn's algorithm, breaking ties deterministically by
//! component id.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use thiserror::Error;

use lmflow_core::{DerivationId, InputDescriptor, StepId, StepParams};
use lmflow_storage::SqliteStore;

use crate::error::EngineError;

/// One derivation in the plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanNode {
    pub id: DerivationId,
    /// Derivations this node reads from.
    pub upstream: BTreeSet<DerivationId>,
    /// Derivations that read from this node.
    pub downstream: BTreeSet<DerivationId>,
    /// Set when the node belongs to a cyclic cluster.
    pub scc_id: Option<String>,
}

/// One unit of the ordered plan: either a single acyclic derivation or a
/// whole cyclic cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanUnit {
    Acyclic {
        node_id: DerivationId,
    },
    Scc {
        scc_id: String,
        node_ids: Vec<DerivationId>,
    },
}

/// The planner's output: every transitively reachable derivation, and the
/// unit list in an order where all of a unit's upstream components
/// precede it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionPlan {
    pub nodes: BTreeMap<DerivationId, PlanNode>,
    pub units: Vec<PlanUnit>,
    pub has_cycles: bool,
}

impl ExecutionPlan {
    /// The cyclic cluster containing `id`, if any.
    pub fn scc_of(&self, id: &DerivationId) -> Option<(&str, &[DerivationId])> {
        let scc_id = self.nodes.get(id)?.scc_id.as_deref()?;
        self.units.iter().find_map(|unit| match unit {
            PlanUnit::Scc {
                scc_id: candidate,
                node_ids,
            } if candidate == scc_id => Some((candidate.as_str(), node_ids.as_slice())),
            _ => None,
        })
    }
}

/// Planner failures.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("formula not found: {0}")]
    FormulaNotFound(DerivationId),

    #[error("planning internal error: {0}")]
    Internal(String),
}

impl From<PlanError> for EngineError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::FormulaNotFound(id) => EngineError::FormulaNotFound(id),
            PlanError::Internal(message) => EngineError::PlanningInternal(message),
        }
    }
}

/// Builds the execution plan for the graph reachable from `root`.
pub fn build_plan(store: &SqliteStore, root: &DerivationId) -> Result<ExecutionPlan, PlanError> {
    // 1. Dependency discovery over a worklist; each derivation processed
    //    once, so self-reference cannot recurse forever.
    let mut nodes: BTreeMap<DerivationId, PlanNode> = BTreeMap::new();
    let mut worklist = vec![root.clone()];
    while let Some(id) = worklist.pop() {
        if nodes.contains_key(&id) {
            continue;
        }
        let derivation = store
            .find_derivation(&id)
            .map_err(|e| PlanError::Internal(e.to_string()))?
            .ok_or_else(|| PlanError::FormulaNotFound(id.clone()))?;

        let mut upstream = BTreeSet::new();
        let mut visited_steps = BTreeSet::new();
        collect_upstream(
            store,
            &derivation.recipe_params,
            &mut visited_steps,
            &mut upstream,
        )?;
        worklist.extend(upstream.iter().cloned());
        nodes.insert(
            id.clone(),
            PlanNode {
                id,
                upstream,
                downstream: BTreeSet::new(),
                scc_id: None,
            },
        );
    }

    // Reverse edges.
    let edges: Vec<(DerivationId, DerivationId)> = nodes
        .values()
        .flat_map(|node| {
            node.upstream
                .iter()
                .map(|up| (node.id.clone(), up.clone()))
                .collect::<Vec<_>>()
        })
        .collect();
    for (consumer, upstream) in &edges {
        if let Some(node) = nodes.get_mut(upstream) {
            node.downstream.insert(consumer.clone());
        }
    }

    // 2. SCC detection. Successors of a derivation are its upstream ids.
    let mut graph: DiGraph<DerivationId, ()> = DiGraph::new();
    let mut index_of: HashMap<DerivationId, NodeIndex> = HashMap::new();
    for id in nodes.keys() {
        let idx = graph.add_node(id.clone());
        index_of.insert(id.clone(), idx);
    }
    for (consumer, upstream) in &edges {
        graph.add_edge(index_of[consumer], index_of[upstream], ());
    }

    let mut has_cycles = false;
    for component in tarjan_scc(&graph) {
        let cyclic = component.len() > 1
            || graph
                .find_edge(component[0], component[0])
                .is_some();
        if !cyclic {
            continue;
        }
        has_cycles = true;
        let mut member_ids: Vec<DerivationId> =
            component.iter().map(|idx| graph[*idx].clone()).collect();
        member_ids.sort();
        let scc_id = format!(
            "scc-{}",
            member_ids
                .iter()
                .map(DerivationId::as_str)
                .collect::<Vec<_>>()
                .join("+")
        );
        for member in &member_ids {
            if let Some(node) = nodes.get_mut(member) {
                node.scc_id = Some(scc_id.clone());
            }
        }
    }

    // 3. Condensation and Kahn's algorithm with deterministic ties.
    let units = order_components(&nodes, &edges)?;

    Ok(ExecutionPlan {
        nodes,
        units,
        has_cycles,
    })
}

/// Collects derivation references from a recipe, descending through
/// persisted sub-steps. `visited_steps` guards against re-walking shared
/// children.
fn collect_upstream(
    store: &SqliteStore,
    params: &StepParams,
    visited_steps: &mut BTreeSet<StepId>,
    upstream: &mut BTreeSet<DerivationId>,
) -> Result<(), PlanError> {
    for input in &params.inputs {
        match input {
            InputDescriptor::Derivation { id } => {
                upstream.insert(id.clone());
            }
            InputDescriptor::InternalStepLink { target_step_id } => {
                if visited_steps.insert(target_step_id.clone()) {
                    let child = store
                        .get_step_params(target_step_id)
                        .map_err(|e| PlanError::Internal(e.to_string()))?
                        .ok_or_else(|| {
                            PlanError::Internal(format!(
                                "dangling internal step link: {}",
                                target_step_id
                            ))
                        })?;
                    collect_upstream(store, &child, visited_steps, upstream)?;
                }
            }
            // Stored recipes are flattened, but walking an inline
            // sub-recipe costs nothing and keeps external forms plannable.
            InputDescriptor::ComputedStep { step } => {
                collect_upstream(store, step, visited_steps, upstream)?;
            }
            InputDescriptor::Content { .. }
            | InputDescriptor::Constant { .. }
            | InputDescriptor::PinnedPath { .. } => {}
        }
    }
    Ok(())
}

fn component_id(node: &PlanNode) -> String {
    node.scc_id
        .clone()
        .unwrap_or_else(|| node.id.as_str().to_string())
}

/// Kahn's algorithm over the component DAG. The ready set is a `BTreeSet`,
/// so ties break deterministically by component id.
fn order_components(
    nodes: &BTreeMap<DerivationId, PlanNode>,
    edges: &[(DerivationId, DerivationId)],
) -> Result<Vec<PlanUnit>, PlanError> {
    // Component membership, keyed by component id.
    let mut members: BTreeMap<String, Vec<DerivationId>> = BTreeMap::new();
    for node in nodes.values() {
        members
            .entry(component_id(node))
            .or_default()
            .push(node.id.clone());
    }

    // Condensed edges point from an upstream component to its consumer,
    // so consumers only become ready after everything they read from.
    let mut successors: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut in_degree: BTreeMap<String, usize> =
        members.keys().map(|id| (id.clone(), 0)).collect();
    for (consumer, upstream) in edges {
        let from = component_id(&nodes[upstream]);
        let to = component_id(&nodes[consumer]);
        if from == to {
            continue;
        }
        if successors.entry(from).or_default().insert(to.clone()) {
            *in_degree.entry(to).or_default() += 1;
        }
    }

    let mut ready: BTreeSet<String> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| id.clone())
        .collect();
    let mut units = Vec::with_capacity(members.len());
    while let Some(next) = ready.iter().next().cloned() {
        ready.remove(&next);
        let mut node_ids = members[&next].clone();
        node_ids.sort();
        units.push(if next.starts_with("scc-") && nodes[&node_ids[0]].scc_id.is_some() {
            PlanUnit::Scc {
                scc_id: next.clone(),
                node_ids,
            }
        } else {
            PlanUnit::Acyclic {
                node_id: node_ids
                    .into_iter()
                    .next()
                    .ok_or_else(|| PlanError::Internal("empty component".to_string()))?,
            }
        });
        if let Some(successor_ids) = successors.get(&next) {
            for successor in successor_ids {
                let degree = in_degree
                    .get_mut(successor)
                    .ok_or_else(|| PlanError::Internal("unknown component".to_string()))?;
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(successor.clone());
                }
            }
        }
    }

    if units.len() != members.len() {
        return Err(PlanError::Internal(
            "condensed graph is not a DAG".to_string(),
        ));
    }
    Ok(units)
}
