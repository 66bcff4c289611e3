//! Hybrid retrieval: keyword (FTS5) and semantic (vector) arms fused with
//! Reciprocal Rank Fusion.
//!
//! The pipeline degrades instead of failing: a broken embedding call turns
//! the search keyword-only, a single failed arm is recovered with the
//! surviving one, and only both arms erroring surfaces an error.

use std::collections::HashMap;

use serde::Serialize;

use crate::embedding::EmbeddingProvider;
use crate::error::EngineError;
use crate::store::SqliteStore;
use crate::types::Chunk;
use crate::vector::{VectorFilter, VectorIndex};

pub mod hybrid;

pub use hybrid::{rrf_fuse, FusedHit, RRF_K};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Hybrid,
    KeywordOnly,
    VectorOnly,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<ScoredChunk>,
    pub mode: SearchMode,
    /// Why the search ran in a degraded mode, when it did.
    pub degraded_reason: Option<String>,
}

/// Execute a hybrid search against one collection.
pub async fn hybrid_search(
    store: &SqliteStore,
    vectors: &dyn VectorIndex,
    embedder: &dyn EmbeddingProvider,
    query: &str,
    collection_id: &str,
    limit: usize,
    filter: Option<&VectorFilter>,
) -> Result<SearchResponse, EngineError> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(EngineError::validation("query must not be empty"));
    }
    if limit == 0 {
        return Err(EngineError::validation("limit must be positive"));
    }

    let mut mode = SearchMode::Hybrid;
    let mut degraded_reason: Option<String> = None;

    // Semantic arm preparation. Both transient and permanent embedding
    // failures degrade to keyword-only; the distinction only matters for the
    // log line.
    let query_texts = vec![trimmed.to_string()];
    let query_vector = match embedder.embed(&query_texts).await {
        Ok(mut vectors) if !vectors.is_empty() => Some(vectors.remove(0)),
        Ok(_) => {
            mode = SearchMode::KeywordOnly;
            degraded_reason = Some("embedding returned no vector".to_string());
            None
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                transient = e.is_transient(),
                "query embedding failed, degrading to keyword-only"
            );
            mode = SearchMode::KeywordOnly;
            degraded_reason = Some(e.to_string());
            None
        }
    };

    // Both arms run concurrently.
    let fts_future = async { store.fts_search(trimmed, collection_id, limit) };
    let vector_future = async {
        match &query_vector {
            Some(vector) => Some(
                vectors
                    .search(collection_id, vector, limit, filter)
                    .await,
            ),
            None => None,
        }
    };
    let (fts_result, vector_result) = tokio::join!(fts_future, vector_future);

    let (fts_hits, fts_failed) = match fts_result {
        Ok(hits) => (hits, false),
        Err(e) => {
            tracing::warn!(error = %e, "keyword arm failed");
            (Vec::new(), true)
        }
    };
    let (vector_hits, vector_failed) = match vector_result {
        None => (Vec::new(), false),
        Some(Ok(hits)) => (hits, false),
        Some(Err(e)) => {
            tracing::warn!(error = %e, "vector arm failed");
            (Vec::new(), true)
        }
    };

    let vector_arm_usable = query_vector.is_some() && !vector_failed;
    if fts_failed && !vector_arm_usable {
        return Err(EngineError::internal(
            "both search arms failed".to_string(),
        ));
    }
    if fts_failed {
        mode = SearchMode::VectorOnly;
        degraded_reason.get_or_insert_with(|| "keyword search unavailable".to_string());
    } else if vector_failed {
        mode = SearchMode::KeywordOnly;
        degraded_reason.get_or_insert_with(|| "vector search unavailable".to_string());
    }

    let fused = rrf_fuse(&fts_hits, &vector_hits);
    let top_ids: Vec<String> = fused
        .iter()
        .take(limit)
        .map(|hit| hit.point_id.clone())
        .collect();
    let score_by_id: HashMap<&str, f64> = fused
        .iter()
        .map(|hit| (hit.point_id.as_str(), hit.score))
        .collect();

    // Point ids the relational store no longer knows are dropped here; that
    // is the lazy reconciliation of vector-store eventual consistency.
    let chunks = store.fetch_chunks_by_point_ids(&top_ids, collection_id)?;
    let chunk_by_id: HashMap<String, Chunk> = chunks
        .into_iter()
        .map(|c| (c.point_id.clone(), c))
        .collect();

    let results: Vec<ScoredChunk> = top_ids
        .iter()
        .filter_map(|id| {
            chunk_by_id.get(id).map(|chunk| ScoredChunk {
                chunk: chunk.clone(),
                score: score_by_id.get(id.as_str()).copied().unwrap_or(0.0),
            })
        })
        .collect();

    tracing::debug!(
        query = trimmed,
        collection_id = %collection_id,
        fts_hits = fts_hits.len(),
        vector_hits = vector_hits.len(),
        fused = fused.len(),
        returned = results.len(),
        mode = ?mode,
        "hybrid search complete"
    );

    Ok(SearchResponse {
        results,
        mode,
        degraded_reason,
    })
}
