//! The operation registry.
//!
//! An operation is a pure function from resolved input strings plus
//! operation-specific settings to an output string, warnings, and an
//! optional token count. Each operation declares an input-arity schema
//! that the evaluator enforces before resolving anything. New operations
//! plug in by registering a schema and an executor; the evaluator never
//! changes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use lmflow_core::Warning;

use crate::http::HttpFetcher;
use crate::llm::LlmClient;

mod builtin;
mod fetch;
mod llm_op;

pub use builtin::{ConstantForTesting, Concat, Identity};
pub use fetch::FetchUrlContent;
pub use llm_op::{LlmOp, CONTEXT_WINDOW_LIMIT_CHARS};

/// Input-count schema of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputArity {
    Exactly(usize),
    AtLeast(usize),
}

impl InputArity {
    pub fn accepts(&self, count: usize) -> bool {
        match self {
            InputArity::Exactly(n) => count == *n,
            InputArity::AtLeast(n) => count >= *n,
        }
    }
}

impl fmt::Display for InputArity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputArity::Exactly(n) => write!(f, "exactly {}", n),
            InputArity::AtLeast(n) => write!(f, "at least {}", n),
        }
    }
}

/// Resolved inputs and settings handed to an executor.
pub struct OpRequest<'a> {
    /// Input contents, in recipe order.
    pub inputs: &'a [String],
    /// Operation-specific parameters from the step's settings.
    pub settings: &'a Map<String, Value>,
}

/// What an executor produced.
#[derive(Debug, Clone)]
pub struct OpOutcome {
    pub output: String,
    pub warnings: Vec<Warning>,
    pub tokens_output: Option<u64>,
}

impl OpOutcome {
    pub fn plain(output: impl Into<String>) -> Self {
        OpOutcome {
            output: output.into(),
            warnings: Vec::new(),
            tokens_output: None,
        }
    }
}

/// Operation-level failure.
///
/// `Reported` surfaces as `operation_result_error`; `Unspecified` as
/// `unspecified_operation_failure`.
#[derive(Debug, Error)]
pub enum OpError {
    #[error("{0}")]
    Reported(String),

    #[error("{0}")]
    Unspecified(String),
}

/// Collaborators an executor may suspend on.
pub struct OpEnvironment {
    pub llm: Arc<dyn LlmClient>,
    pub http: Arc<dyn HttpFetcher>,
}

/// A registered operation: schema plus executor.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    fn arity(&self) -> InputArity;

    async fn execute(
        &self,
        request: OpRequest<'_>,
        env: &OpEnvironment,
    ) -> Result<OpOutcome, OpError>;
}

/// Maps operation tags to executors. Unknown tags at evaluation time are
/// an `unsupported_operation` error, not a panic.
pub struct OperationRegistry {
    executors: HashMap<String, Arc<dyn OperationExecutor>>,
}

impl OperationRegistry {
    /// A registry with nothing in it.
    pub fn empty() -> Self {
        OperationRegistry {
            executors: HashMap::new(),
        }
    }

    /// The core operation set.
    pub fn standard() -> Self {
        let mut registry = OperationRegistry::empty();
        registry.register("identity", Arc::new(Identity));
        registry.register("concat", Arc::new(Concat));
        registry.register("constant_for_testing", Arc::new(ConstantForTesting));
        registry.register("llm", Arc::new(LlmOp));
        registry.register("fetch_url_content", Arc::new(FetchUrlContent));
        registry
    }

    /// Registers (or replaces) an executor for a tag.
    pub fn register(&mut self, tag: impl Into<String>, executor: Arc<dyn OperationExecutor>) {
        self.executors.insert(tag.into(), executor);
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn OperationExecutor>> {
        self.executors.get(tag).cloned()
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        OperationRegistry::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_schemas() {
        assert!(InputArity::Exactly(1).accepts(1));
        assert!(!InputArity::Exactly(1).accepts(2));
        assert!(InputArity::AtLeast(2).accepts(2));
        assert!(InputArity::AtLeast(2).accepts(5));
        assert!(!InputArity::AtLeast(2).accepts(1));
        assert_eq!(InputArity::Exactly(1).to_string(), "exactly 1");
        assert_eq!(InputArity::AtLeast(2).to_string(), "at least 2");
    }

    #[test]
    fn standard_registry_covers_the_core_set() {
        let registry = OperationRegistry::standard();
        for tag in [
            "identity",
            "concat",
            "constant_for_testing",
            "llm",
            "fetch_url_content",
        ] {
            assert!(registry.get(tag).is_some(), "missing operation {}", tag);
        }
        assert!(registry.get("made_up").is_none());
    }
}
