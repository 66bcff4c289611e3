//! Embedding provider contract.
//!
//! The engine only depends on the `EmbeddingProvider` trait; the production
//! implementation talks to an OpenAI-compatible `/embeddings` endpoint.

use async_trait::async_trait;
use thiserror::Error;

pub mod http;

pub use http::HttpEmbeddingClient;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding API network failure: {0}")]
    Network(String),

    /// Could not reach the service at all (connect/DNS failure).
    #[error("embedding API unavailable: {0}")]
    Unavailable(String),

    #[error("embedding API request timed out after {0}ms")]
    Timeout(u64),

    #[error("embedding API rate limited: {0}")]
    RateLimited(String),

    #[error("embedding API server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    /// Non-retryable failure: 4xx other than 429, malformed response, or a
    /// count/dimension mismatch.
    #[error("embedding API permanent failure: {message}")]
    Permanent { status: Option<u16>, message: String },
}

impl EmbeddingError {
    /// Whether a retry may succeed without operator intervention.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Permanent { .. })
    }
}

/// Batched text-to-vector embedding. Output order matches input order and
/// every vector has exactly `dimension()` components.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    fn dimension(&self) -> usize;
}
