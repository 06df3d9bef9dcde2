//! Core data model for the lmflow derivation engine.
//!
//! Pure types shared by the storage and engine crates: identifier
//! newtypes, blake3 content hashing and cache-key derivation, the
//! canonical JSON encoder, the recipe model (input descriptors + step
//! parameters), and the dependency/execution trees returned to callers.
//! No I/O lives here.
//!
//! # Modules
//!
//! - [`id`]: DerivationId, StepId, DocId newtypes
//! - [`hash`]: ContentHash, CacheKey
//! - [`canonical`]: the canonical JSON encoder (a load-bearing contract:
//!   cache hits across processes depend on it)
//! - [`recipe`]: InputDescriptor and StepParams
//! - [`tree`]: DependencyNode, ExecutionTree, Warning, SccMetadata

pub mod canonical;
pub mod hash;
pub mod id;
pub mod recipe;
pub mod tree;

pub use canonical::{canonicalize, to_canonical_json};
pub use hash::{CacheKey, ContentHash};
pub use id::{DerivationId, DocId, StepId};
pub use recipe::{InputDescriptor, StepParams};
pub use tree::{CacheStatus, DependencyNode, ExecutionTree, SccMetadata, Warning};
