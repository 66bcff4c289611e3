//! Qdrant REST client.
//!
//! All logical collections share one physical Qdrant collection; isolation
//! comes from a `collection_id` payload filter on every search and delete.
//! Point ids are deterministic UUIDs, so upserts are idempotent and replays
//! are safe.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    Metric, PointPayload, VectorError, VectorFilter, VectorHit, VectorIndex, VectorPoint,
};
use crate::config::VectorConfig;

pub struct QdrantStore {
    http: Client,
    base_url: String,
    collection: String,
    vector_size: usize,
    metric: Metric,
    timeout_ms: u64,
    upsert_batch: usize,
}

#[derive(Deserialize)]
struct QdrantEnvelope<T> {
    result: Option<T>,
}

#[derive(Deserialize)]
struct ScoredPoint {
    id: serde_json::Value,
    score: f32,
    payload: Option<PointPayload>,
}

#[derive(Serialize)]
struct UpsertBody<'a> {
    points: &'a [VectorPoint],
}

impl QdrantStore {
    pub fn new(config: &VectorConfig) -> Result<Self, VectorError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| VectorError::Permanent {
                status: None,
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            collection: config.collection.clone(),
            vector_size: config.vector_size,
            metric: config.metric,
            timeout_ms: config.timeout_ms,
            upsert_batch: config.upsert_batch,
        })
    }

    fn url(&self, suffix: &str) -> String {
        format!(
            "{}/collections/{}{}",
            self.base_url, self.collection, suffix
        )
    }

    fn map_transport(&self, e: reqwest::Error) -> VectorError {
        if e.is_timeout() {
            VectorError::Timeout(self.timeout_ms)
        } else if e.is_connect() {
            VectorError::Unavailable(e.to_string())
        } else {
            VectorError::Network(e.to_string())
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, VectorError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let preview: String = body.chars().take(300).collect();
        Err(classify_status(status.as_u16(), preview))
    }

    /// `must` clauses for payload filtering; the collection scope is always
    /// present, a doc filter is appended when given.
    fn payload_filter(collection_id: &str, filter: Option<&VectorFilter>) -> serde_json::Value {
        let mut must = vec![json!({"key": "collection_id", "match": {"value": collection_id}})];
        if let Some(f) = filter {
            if let Some(doc_id) = &f.doc_id {
                must.push(json!({"key": "doc_id", "match": {"value": doc_id}}));
            }
        }
        json!({ "must": must })
    }
}

#[async_trait]
impl VectorIndex for QdrantStore {
    async fn ensure_collection(
        &self,
        collection_id: &str,
        vector_size: usize,
    ) -> Result<(), VectorError> {
        if vector_size != self.vector_size {
            return Err(VectorError::DimensionMismatch {
                expected: self.vector_size,
                got: vector_size,
            });
        }

        let exists = self
            .http
            .get(self.url(""))
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;
        if exists.status().is_success() {
            return Ok(());
        }
        if exists.status().as_u16() != 404 {
            Self::check_status(exists).await?;
            return Ok(());
        }

        let body = json!({
            "vectors": {
                "size": self.vector_size,
                "distance": match self.metric {
                    Metric::Cosine => "Cosine",
                    Metric::Dot => "Dot",
                },
            }
        });
        let response = self
            .http
            .put(self.url(""))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;
        Self::check_status(response).await?;

        tracing::info!(
            collection_id = %collection_id,
            vector_size = self.vector_size,
            "vector collection ready"
        );
        Ok(())
    }

    async fn upsert(
        &self,
        collection_id: &str,
        points: Vec<VectorPoint>,
    ) -> Result<(), VectorError> {
        if points.is_empty() {
            return Ok(());
        }
        for point in &points {
            if point.vector.len() != self.vector_size {
                return Err(VectorError::DimensionMismatch {
                    expected: self.vector_size,
                    got: point.vector.len(),
                });
            }
        }

        let total = points.len();
        for batch in points.chunks(self.upsert_batch) {
            let body = UpsertBody { points: batch };
            let response = self
                .http
                .put(self.url("/points?wait=true"))
                .json(&body)
                .send()
                .await
                .map_err(|e| self.map_transport(e))?;
            Self::check_status(response).await?;
        }

        tracing::debug!(
            collection_id = %collection_id,
            points = total,
            "upserted vector points"
        );
        Ok(())
    }

    async fn search(
        &self,
        collection_id: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&VectorFilter>,
    ) -> Result<Vec<VectorHit>, VectorError> {
        if vector.len() != self.vector_size {
            return Err(VectorError::DimensionMismatch {
                expected: self.vector_size,
                got: vector.len(),
            });
        }

        let body = json!({
            "vector": vector,
            "limit": limit,
            "filter": Self::payload_filter(collection_id, filter),
            "with_payload": true,
        });
        let response = self
            .http
            .post(self.url("/points/search"))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;
        let response = Self::check_status(response).await?;

        let envelope: QdrantEnvelope<Vec<ScoredPoint>> =
            response.json().await.map_err(|e| VectorError::Permanent {
                status: None,
                message: format!("invalid search response body: {}", e),
            })?;

        let hits = envelope
            .result
            .unwrap_or_default()
            .into_iter()
            .map(|p| VectorHit {
                point_id: point_id_string(&p.id),
                score: p.score,
                chunk_index: p.payload.map(|payload| payload.chunk_index),
            })
            .collect();
        Ok(hits)
    }

    async fn delete_by_doc(&self, collection_id: &str, doc_id: &str) -> Result<(), VectorError> {
        let filter = Self::payload_filter(
            collection_id,
            Some(&VectorFilter {
                doc_id: Some(doc_id.to_string()),
            }),
        );
        let body = json!({ "filter": filter });
        let response = self
            .http
            .post(self.url("/points/delete?wait=true"))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;
        Self::check_status(response).await?;
        tracing::debug!(collection_id = %collection_id, doc_id = %doc_id, "deleted doc points");
        Ok(())
    }

    async fn delete_by_collection(&self, collection_id: &str) -> Result<(), VectorError> {
        let body = json!({ "filter": Self::payload_filter(collection_id, None) });
        let response = self
            .http
            .post(self.url("/points/delete?wait=true"))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;
        Self::check_status(response).await?;
        tracing::info!(collection_id = %collection_id, "deleted collection points");
        Ok(())
    }
}

fn classify_status(status: u16, message: String) -> VectorError {
    match status {
        429 => VectorError::RateLimited(message),
        s if s >= 500 => VectorError::Server { status: s, message },
        s => VectorError::Permanent {
            status: Some(s),
            message,
        },
    }
}

/// Qdrant returns point ids as JSON strings or integers.
fn point_id_string(id: &serde_json::Value) -> String {
    match id {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
