//! Crate-wide error taxonomy.
//!
//! Leaf modules (store, embedding, vector) define their own error enums and
//! convert into `EngineError` at the engine boundary. Sync steps never
//! propagate errors to the caller of `trigger_sync`; they are classified and
//! folded into the job record instead.

use thiserror::Error;

use crate::embedding::EmbeddingError;
use crate::store::StoreError;
use crate::vector::VectorError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input from the caller (empty query, non-positive limit, ...).
    #[error("invalid input: {0}")]
    Validation(String),

    /// A referenced resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique or ownership conflict (duplicate collection name, duplicate
    /// content hash under a different key, ...).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A rate-limit tier rejected the request.
    #[error("rate limited by tier '{tier}', retry after {retry_after_ms}ms")]
    RateLimited { tier: String, retry_after_ms: u64 },

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Vector(#[from] VectorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A step or call exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
