//! Storage error types for lmflow-storage.
//!
//! [`StorageError`] covers all anticipated failure modes in the
//! persistence layer: SQLite failures, serialization, migrations, and
//! entity-not-found variants for rows the engine dereferences.

use lmflow_core::{DerivationId, StepId};
use thiserror::Error;

/// Errors produced by storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The underlying SQLite call failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Applying schema migrations failed.
    #[error("migration error: {0}")]
    Migration(String),

    /// JSON serialization or deserialization of a stored column failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A derivation row with the given slug was not found.
    #[error("derivation not found: {0}")]
    DerivationNotFound(DerivationId),

    /// A step row with the given id was not found.
    #[error("step not found: {0}")]
    StepNotFound(StepId),

    /// A data integrity violation was detected in stored rows.
    #[error("integrity error: {reason}")]
    Integrity { reason: String },
}
