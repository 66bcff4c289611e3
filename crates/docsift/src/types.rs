//! Core entities and deterministic id derivation.
//!
//! Ids are opaque strings. `doc_id` is derived from the content hash so that
//! identical content always yields the same id; `point_id` is derived from
//! `(doc_id, chunk_index)` so re-ingestion upserts the same vector points
//! instead of accumulating duplicates.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Epoch milliseconds, the timestamp unit used across the engine.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// SHA-256 of the raw text, hex-encoded.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Document id derived from the content hash: identical content yields an
/// identical id regardless of when or where it is imported.
pub fn doc_id_for(content_hash: &str) -> String {
    content_hash[..content_hash.len().min(32)].to_string()
}

/// Deterministic point id linking a chunk row to its vector point.
///
/// Rendered as a UUID (built from the first 16 bytes of
/// SHA-256(`doc_id:chunk_index`)) so the id is accepted verbatim by vector
/// stores that require UUID point ids.
pub fn point_id(doc_id: &str, chunk_index: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(doc_id.as_bytes());
    hasher.update(b":");
    hasher.update(chunk_index.to_string().as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}

pub fn new_collection_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub collection_id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Cached per-document status. The authoritative lifecycle state lives in the
/// owning sync job; this is what list/detail views read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    New,
    Processing,
    Completed,
    Failed,
    Deleted,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// Document row. `content` is large and lazily loaded; fetch it through
/// `SqliteStore::document_content` instead of carrying it here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: String,
    pub collection_id: String,
    pub key: String,
    pub name: Option<String>,
    pub mime: Option<String>,
    pub size_bytes: Option<i64>,
    pub content_hash: String,
    pub status: DocumentStatus,
    pub created_at: i64,
    pub updated_at: i64,
    pub is_deleted: bool,
}

/// An ordered slice of a document's text; the unit of embedding and retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub point_id: String,
    pub doc_id: String,
    pub collection_id: String,
    pub chunk_index: u32,
    pub title: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub point_id: String,
    pub doc_id: String,
    pub collection_id: String,
    pub chunk_index: u32,
    pub title_chain: Option<String>,
    pub content_hash: String,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_id_is_stable_for_identical_content() {
        let h1 = content_hash("alpha beta gamma");
        let h2 = content_hash("alpha beta gamma");
        assert_eq!(doc_id_for(&h1), doc_id_for(&h2));
        assert_eq!(doc_id_for(&h1).len(), 32);
    }

    #[test]
    fn doc_id_differs_for_different_content() {
        let a = doc_id_for(&content_hash("alpha"));
        let b = doc_id_for(&content_hash("beta"));
        assert_ne!(a, b);
    }

    #[test]
    fn point_id_is_deterministic_and_uuid_shaped() {
        let a = point_id("doc-1", 0);
        let b = point_id("doc-1", 0);
        assert_eq!(a, b);
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn point_id_varies_with_doc_and_index() {
        let base = point_id("doc-1", 0);
        assert_ne!(base, point_id("doc-1", 1));
        assert_ne!(base, point_id("doc-2", 0));
    }
}
