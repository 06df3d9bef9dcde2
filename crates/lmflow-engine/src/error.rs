//! Engine error types.
//!
//! Every failure the engine can report is a structured [`EngineError`]
//! variant with a stable machine-readable [`EngineError::kind`] string;
//! nothing is thrown past the engine boundary. Recursive evaluator calls
//! propagate the inner error up through the dependency-resolution frames
//! untouched.

use thiserror::Error;

use lmflow_core::{ContentHash, DerivationId, DocId, StepId};
use lmflow_storage::StorageError;

use crate::ops::InputArity;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The requested derivation does not exist.
    #[error("derivation not found: {0}")]
    DerivationNotFound(DerivationId),

    /// A derivation referenced by a recipe was absent during planning.
    #[error("formula not found: {0}")]
    FormulaNotFound(DerivationId),

    /// No document is registered for a `pinned_path` input.
    #[error("no document registered for pinned path {path}")]
    PinnedPathNotFound { path: String },

    /// The document behind a pinned path has no current content hash.
    #[error("document {doc_id} behind pinned path {path} has no content hash")]
    PinnedContentHashNotFound { path: String, doc_id: DocId },

    /// A referenced content blob is missing from the content store.
    #[error("content blob {hash} needed by step {step_id} is missing")]
    InputContentHashNotFound { step_id: StepId, hash: ContentHash },

    /// An `internal_step_link` points at a step that does not exist.
    #[error("step not found: {0}")]
    StepNotFound(StepId),

    /// The recipe's input count does not match the operation's schema.
    #[error("operation {operation} takes {expected} input(s), got {actual}")]
    InvalidInputArity {
        operation: String,
        expected: InputArity,
        actual: usize,
    },

    /// The operation tag is not registered.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// The operation reported a failure of its own.
    #[error("operation {operation} failed: {message}")]
    OperationResultError { operation: String, message: String },

    /// The operation failed without reporting a structured cause.
    #[error("operation {operation} failed unexpectedly: {message}")]
    UnspecifiedOperationFailure { operation: String, message: String },

    /// The step-persistence transaction aborted.
    #[error("persisting step result failed: {0}")]
    DerivationStoreFailure(StorageError),

    /// Any other storage failure.
    #[error("storage error: {0}")]
    Db(StorageError),

    /// The planner failed for a reason other than a missing formula.
    #[error("planning failed: {0}")]
    PlanningInternal(String),

    /// Catch-all wrapping the underlying message.
    #[error("unexpected derivation computation error: {0}")]
    Unexpected(String),
}

impl EngineError {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::DerivationNotFound(_) => "derivation_not_found",
            EngineError::FormulaNotFound(_) => "formula_not_found",
            EngineError::PinnedPathNotFound { .. } => "pinned_path_not_found",
            EngineError::PinnedContentHashNotFound { .. } => "pinned_content_hash_not_found",
            EngineError::InputContentHashNotFound { .. } => "input_content_hash_not_found",
            EngineError::StepNotFound(_) => "step_not_found",
            EngineError::InvalidInputArity { .. } => "invalid_input_arity",
            EngineError::UnsupportedOperation(_) => "unsupported_operation",
            EngineError::OperationResultError { .. } => "operation_result_error",
            EngineError::UnspecifiedOperationFailure { .. } => "unspecified_operation_failure",
            EngineError::DerivationStoreFailure(_) => "derivation_store_failure",
            EngineError::Db(_) => "db_error",
            EngineError::PlanningInternal(_) => "planning_internal_error",
            EngineError::Unexpected(_) => "unexpected_derivation_computation_error",
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::DerivationNotFound(id) => EngineError::DerivationNotFound(id),
            StorageError::StepNotFound(id) => EngineError::StepNotFound(id),
            other => EngineError::Db(other),
        }
    }
}
