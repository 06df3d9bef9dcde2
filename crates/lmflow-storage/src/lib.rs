//! SQLite persistence for the lmflow derivation engine.
//!
//! Implements the content store (deduplicated blobs keyed by blake3
//! digest), the document table used for path pinning, the step and
//! derivation stores, the global result cache, and the embedding side
//! tables. All multi-row writes run inside transactions; the schema is
//! managed by `rusqlite_migration` via the `user_version` pragma.
//!
//! # Modules
//!
//! - [`error`]: [`StorageError`] with all failure modes
//! - [`schema`]: SQL migrations and connection setup
//! - [`types`]: row types ([`Derivation`], [`StepResultRow`], ...)
//! - [`sqlite`]: the [`SqliteStore`] implementation

pub mod error;
pub mod schema;
pub mod sqlite;
pub mod types;

pub use error::StorageError;
pub use sqlite::SqliteStore;
pub use types::{Derivation, LinkedStepResult, ResolvedPin, StepResultRow};
