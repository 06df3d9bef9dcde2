//! The optional embedding sink collaborator.
//!
//! After a step computes (not on cache hits), the evaluator offers the
//! output to this sink. Sink failures are logged and swallowed; they must
//! never surface as engine errors. The queueing, rate limiting, and
//! persistence into `hash_embeddings` / `embedding_usage_log` belong to
//! the collaborator behind this trait.

use async_trait::async_trait;
use thiserror::Error;

use lmflow_core::ContentHash;

#[derive(Debug, Error)]
#[error("embedding sink error: {0}")]
pub struct EmbeddingSinkError(pub String);

#[async_trait]
pub trait EmbeddingSink: Send + Sync {
    async fn submit(&self, hash: &ContentHash, content: &str) -> Result<(), EmbeddingSinkError>;
}

/// Discards everything. The default when no embedding pipeline is wired up.
pub struct NullEmbeddingSink;

#[async_trait]
impl EmbeddingSink for NullEmbeddingSink {
    async fn submit(&self, _hash: &ContentHash, _content: &str) -> Result<(), EmbeddingSinkError> {
        Ok(())
    }
}
