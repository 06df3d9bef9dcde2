//! The lmflow derivation engine.
//!
//! Turns a formula reference into a computed value: builds the local
//! dependency graph, detects cyclic clusters, walks the graph honoring
//! the global result cache, executes operations through the registry, and
//! persists results transactionally. Mutually recursive formulas get a
//! well-defined value via bounded Jacobi iteration over a seed buffer.
//!
//! # Architecture
//!
//! - [`plan`]: dependency discovery, Tarjan SCC detection, ordered plan
//! - `eval` (internal): the step/derivation evaluator and the cache
//!   short-circuit
//! - [`scc`]: bounded iteration over cyclic clusters
//! - [`ops`]: the operation registry and the core operation set
//! - [`events`]: synchronous `plan-ready` / `step-complete` emission
//! - [`llm`], [`http`], [`embed`]: collaborator boundaries with default
//!   implementations and test doubles
//! - [`engine`]: the [`Engine`] facade and request API
//!
//! # Usage
//!
//! ```ignore
//! let mut engine = Engine::from_config(&EngineConfig::from_env())?;
//! let derivation = engine.create_derivation(&recipe, Some("summary"), dsl)?;
//! let outcome = engine
//!     .compute_derivation(&derivation.derivation_id, ComputeRequest::default())
//!     .await?;
//! println!("{}", outcome.output);
//! ```

pub mod embed;
pub mod engine;
pub mod error;
pub mod events;
mod eval;
pub mod http;
pub mod llm;
pub mod ops;
pub mod plan;
pub mod scc;

pub use embed::{EmbeddingSink, EmbeddingSinkError, NullEmbeddingSink};
pub use engine::{ComputeOutcome, ComputeRequest, Engine, EngineConfig};
pub use error::EngineError;
pub use events::{EngineEvent, EventBus, EventObserver};
pub use http::{FetchError, HttpFetcher, ReqwestFetcher, StaticFetcher};
pub use llm::{EchoLlm, LlmClient, LlmError, LlmModel, LlmRequest, LlmResponse, OpenAiCompatClient};
pub use ops::{
    InputArity, OpEnvironment, OpError, OpOutcome, OpRequest, OperationExecutor,
    OperationRegistry, CONTEXT_WINDOW_LIMIT_CHARS,
};
pub use plan::{build_plan, ExecutionPlan, PlanError, PlanNode, PlanUnit};
pub use scc::{SccOptions, SeedPolicy};
