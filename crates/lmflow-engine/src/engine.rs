//! The engine facade: lifecycle, configuration, and the request API.
//!
//! [`Engine`] owns the store, the operation registry, the collaborator
//! handles, and the event bus. Scheduling is single-threaded cooperative:
//! at most one operation runs at a time, and the only suspension points
//! are operation invocations and the embedding sink.

use std::env;
use std::sync::Arc;

use lmflow_core::{ContentHash, DerivationId, ExecutionTree, StepParams};
use lmflow_storage::{Derivation, SqliteStore};

use crate::embed::EmbeddingSink;
use crate::error::EngineError;
use crate::events::{EngineEvent, EventBus, EventObserver};
use crate::eval::EvalOptions;
use crate::http::{HttpFetcher, ReqwestFetcher};
use crate::llm::{LlmClient, OpenAiCompatClient};
use crate::ops::{OpEnvironment, OperationRegistry};
use crate::plan::build_plan;
use crate::scc::SccOptions;

/// Environment-derived configuration for a default engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: String,
    pub llm_base_url: String,
    pub llm_api_key: String,
}

impl EngineConfig {
    /// Reads `LMFLOW_DB`, `LMFLOW_LLM_BASE_URL`, and `LMFLOW_LLM_API_KEY`,
    /// with working defaults for everything but the key.
    pub fn from_env() -> Self {
        EngineConfig {
            db_path: env::var("LMFLOW_DB").unwrap_or_else(|_| "lmflow.db".to_string()),
            llm_base_url: env::var("LMFLOW_LLM_BASE_URL")
                .unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string()),
            llm_api_key: env::var("LMFLOW_LLM_API_KEY").unwrap_or_default(),
        }
    }
}

/// Options for one `compute_derivation` request.
pub struct ComputeRequest {
    /// Force recomputation of the requested derivation's root step.
    /// Descendant steps remain free to hit the cache.
    pub skip_cache: bool,
    /// Cyclic-cluster iteration settings.
    pub scc: SccOptions,
    /// Extra observer for this request, on top of engine subscribers.
    pub on_event: Option<Arc<dyn EventObserver>>,
}

impl Default for ComputeRequest {
    fn default() -> Self {
        ComputeRequest {
            skip_cache: false,
            scc: SccOptions::default(),
            on_event: None,
        }
    }
}

/// What a computation request returns: the output plus the trace of how
/// it was derived.
#[derive(Debug, Clone)]
pub struct ComputeOutcome {
    pub derivation_id: DerivationId,
    pub output: String,
    pub content_hash: ContentHash,
    pub execution_tree: ExecutionTree,
    pub tokens_output: Option<u64>,
}

/// The reactive derivation engine.
pub struct Engine {
    pub(crate) store: SqliteStore,
    pub(crate) registry: OperationRegistry,
    pub(crate) env: OpEnvironment,
    pub(crate) events: EventBus,
    pub(crate) embedding: Option<Arc<dyn EmbeddingSink>>,
}

impl Engine {
    /// An engine over an opened store with the standard operation set.
    pub fn new(store: SqliteStore, llm: Arc<dyn LlmClient>, http: Arc<dyn HttpFetcher>) -> Self {
        Engine {
            store,
            registry: OperationRegistry::standard(),
            env: OpEnvironment { llm, http },
            events: EventBus::new(),
            embedding: None,
        }
    }

    /// Opens the configured database and wires the default collaborators.
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        let store = SqliteStore::new(&config.db_path)?;
        Ok(Engine::new(
            store,
            Arc::new(OpenAiCompatClient::new(
                config.llm_base_url.clone(),
                config.llm_api_key.clone(),
            )),
            Arc::new(ReqwestFetcher::new()),
        ))
    }

    /// Replaces the operation registry (e.g. to add custom operations).
    pub fn with_registry(mut self, registry: OperationRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Wires an embedding sink; completed outputs are offered to it.
    pub fn with_embedding_sink(mut self, sink: Arc<dyn EmbeddingSink>) -> Self {
        self.embedding = Some(sink);
        self
    }

    /// Subscribes an observer to every computation's events.
    pub fn subscribe(&mut self, observer: Arc<dyn EventObserver>) {
        self.events.subscribe(observer);
    }

    /// Direct store access for collaborators (document table, blobs).
    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SqliteStore {
        &mut self.store
    }

    // -----------------------------------------------------------------------
    // Request API
    // -----------------------------------------------------------------------

    /// Flattens `recipe` and creates a derivation. The DSL expression is
    /// stored verbatim for the surface editor; parsing it is the
    /// collaborator's job.
    pub fn create_derivation(
        &mut self,
        recipe: &StepParams,
        label: Option<&str>,
        dsl_expression: &str,
    ) -> Result<Derivation, EngineError> {
        let derivation = self.store.create_derivation(recipe, label, dsl_expression)?;
        tracing::info!(derivation = %derivation.derivation_id, "derivation created");
        Ok(derivation)
    }

    /// Re-flattens `recipe` and rewrites an existing derivation.
    pub fn update_derivation(
        &mut self,
        id: &DerivationId,
        recipe: &StepParams,
        label: Option<&str>,
        dsl_expression: &str,
    ) -> Result<Derivation, EngineError> {
        let derivation = self
            .store
            .update_derivation(id, recipe, label, dsl_expression)?;
        tracing::info!(derivation = %id, "derivation updated");
        Ok(derivation)
    }

    /// Removes the derivation row; steps and cache rows stay behind.
    pub fn delete_derivation(&mut self, id: &DerivationId) -> Result<(), EngineError> {
        self.store.delete_derivation(id)?;
        tracing::info!(derivation = %id, "derivation deleted");
        Ok(())
    }

    pub fn find_derivation(&self, id: &DerivationId) -> Result<Option<Derivation>, EngineError> {
        Ok(self.store.find_derivation(id)?)
    }

    pub fn list_derivations(&self) -> Result<Vec<Derivation>, EngineError> {
        Ok(self.store.get_all_derivations()?)
    }

    /// Computes the current value of a derivation, returning its output
    /// and execution tree.
    pub async fn compute_derivation(
        &mut self,
        id: &DerivationId,
        request: ComputeRequest,
    ) -> Result<ComputeOutcome, EngineError> {
        tracing::info!(derivation = %id, skip_cache = request.skip_cache, "compute requested");

        // The root reports derivation_not_found itself; the planner's
        // formula_not_found is reserved for upstream references.
        if self.store.find_derivation(id)?.is_none() {
            return Err(EngineError::DerivationNotFound(id.clone()));
        }

        let plan = Arc::new(build_plan(&self.store, id)?);
        let opts = EvalOptions {
            plan: Arc::clone(&plan),
            scc_options: request.scc,
            observer: request.on_event,
        };
        self.emit(&opts, &EngineEvent::PlanReady { plan });

        let result = self
            .compute_derivation_inner(id.clone(), &opts, request.skip_cache)
            .await?;
        tracing::info!(derivation = %id, hash = %result.content_hash, "compute finished");
        Ok(ComputeOutcome {
            derivation_id: id.clone(),
            output: result.output,
            content_hash: result.content_hash,
            execution_tree: result.execution_tree,
            tokens_output: result.tokens_output,
        })
    }

    /// Synchronous fan-out to engine subscribers plus the per-request
    /// observer.
    pub(crate) fn emit(&self, opts: &EvalOptions, event: &EngineEvent) {
        self.events.emit(event);
        if let Some(observer) = &opts.observer {
            observer.on_event(event);
        }
    }
}
