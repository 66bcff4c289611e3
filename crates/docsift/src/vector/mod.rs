//! Vector store contract.
//!
//! The engine depends on the `VectorIndex` trait; the production
//! implementation speaks the Qdrant REST API. Point payloads are a fixed
//! struct, not free-form maps.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod qdrant;

pub use qdrant::QdrantStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Cosine,
    Dot,
}

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("vector store network failure: {0}")]
    Network(String),

    /// Could not reach the service at all (connect/DNS failure).
    #[error("vector store unavailable: {0}")]
    Unavailable(String),

    #[error("vector store request timed out after {0}ms")]
    Timeout(u64),

    #[error("vector store rate limited: {0}")]
    RateLimited(String),

    #[error("vector store server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("vector store permanent failure: {message}")]
    Permanent { status: Option<u16>, message: String },
}

impl VectorError {
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::Permanent { .. } | Self::DimensionMismatch { .. }
        )
    }
}

/// Fixed payload carried by every point; extra attributes live outside the
/// vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointPayload {
    pub doc_id: String,
    pub collection_id: String,
    pub chunk_index: u32,
    pub content: String,
    pub content_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title_chain: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: PointPayload,
}

/// One semantic hit; score higher is better. `chunk_index` comes from the
/// payload when the store returns it.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub point_id: String,
    pub score: f32,
    pub chunk_index: Option<u32>,
}

/// Optional narrowing of a semantic search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorFilter {
    pub doc_id: Option<String>,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Idempotently create the backing collection for `vector_size`
    /// dimensional points.
    async fn ensure_collection(
        &self,
        collection_id: &str,
        vector_size: usize,
    ) -> Result<(), VectorError>;

    /// Upsert points; idempotent by point id.
    async fn upsert(
        &self,
        collection_id: &str,
        points: Vec<VectorPoint>,
    ) -> Result<(), VectorError>;

    async fn search(
        &self,
        collection_id: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&VectorFilter>,
    ) -> Result<Vec<VectorHit>, VectorError>;

    async fn delete_by_doc(&self, collection_id: &str, doc_id: &str) -> Result<(), VectorError>;

    async fn delete_by_collection(&self, collection_id: &str) -> Result<(), VectorError>;
}
