//! Scripted dependency doubles and helpers shared by sync, search and engine
//! tests. Everything here is deterministic: embedding vectors are derived
//! from the text, searches sort with explicit tie-breaks.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::embedding::{EmbeddingError, EmbeddingProvider};
use crate::store::SqliteStore;
use crate::sync::state::{SyncJob, SyncStatus};
use crate::sync::SyncEngine;
use crate::types::{content_hash, doc_id_for, now_ms, Collection, Document, DocumentStatus};
use crate::vector::{PointPayload, VectorError, VectorFilter, VectorHit, VectorIndex, VectorPoint};

/// Deterministic pseudo-embedding: bytes of SHA-256(text) scaled to [0, 1].
pub(crate) fn vector_for(text: &str, dim: usize) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    (0..dim).map(|i| digest[i % 32] as f32 / 255.0).collect()
}

#[derive(Debug, Clone)]
pub(crate) enum EmbedOutcome {
    Ok,
    Transient(String),
    Permanent(String),
}

/// Embedding double driven by a script of per-call outcomes. An exhausted
/// script keeps returning Ok.
pub(crate) struct ScriptedEmbedder {
    dimension: usize,
    script: Mutex<VecDeque<EmbedOutcome>>,
    calls: Mutex<Vec<Vec<String>>>,
    delay: Option<Duration>,
    always_transient: bool,
}

impl ScriptedEmbedder {
    pub(crate) fn always_ok(dimension: usize) -> Self {
        Self::scripted(dimension, Vec::new())
    }

    pub(crate) fn always_ok_with_delay(dimension: usize, delay: Duration) -> Self {
        let mut embedder = Self::scripted(dimension, Vec::new());
        embedder.delay = Some(delay);
        embedder
    }

    pub(crate) fn always_transient(dimension: usize) -> Self {
        let mut embedder = Self::scripted(dimension, Vec::new());
        embedder.always_transient = true;
        embedder
    }

    pub(crate) fn scripted(dimension: usize, outcomes: Vec<EmbedOutcome>) -> Self {
        Self {
            dimension,
            script: Mutex::new(outcomes.into()),
            calls: Mutex::new(Vec::new()),
            delay: None,
            always_transient: false,
        }
    }

    /// Every recorded call, in order, with the exact texts received.
    pub(crate) fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl EmbeddingProvider for ScriptedEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.lock().push(texts.to_vec());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.always_transient {
            return Err(EmbeddingError::Unavailable("scripted outage".to_string()));
        }
        let outcome = self.script.lock().pop_front().unwrap_or(EmbedOutcome::Ok);
        match outcome {
            EmbedOutcome::Ok => Ok(texts
                .iter()
                .map(|t| vector_for(t, self.dimension))
                .collect()),
            EmbedOutcome::Transient(message) => Err(EmbeddingError::Unavailable(message)),
            EmbedOutcome::Permanent(message) => Err(EmbeddingError::Permanent {
                status: Some(400),
                message,
            }),
        }
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

struct StoredPoint {
    vector: Vec<f32>,
    payload: PointPayload,
}

/// In-memory stand-in for the vector store: cosine search over a point map,
/// payload-filtered deletes, optional scripted search failures.
pub(crate) struct MemoryVectorIndex {
    dimension: usize,
    points: Mutex<HashMap<String, StoredPoint>>,
    fail_searches: AtomicBool,
    delete_by_collection_calls: AtomicUsize,
}

impl MemoryVectorIndex {
    pub(crate) fn new(dimension: usize) -> Self {
        Self {
            dimension,
            points: Mutex::new(HashMap::new()),
            fail_searches: AtomicBool::new(false),
            delete_by_collection_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn contains(&self, point_id: &str) -> bool {
        self.points.lock().contains_key(point_id)
    }

    pub(crate) fn point_count(&self) -> usize {
        self.points.lock().len()
    }

    pub(crate) fn points_in_collection(&self, collection_id: &str) -> usize {
        self.points
            .lock()
            .values()
            .filter(|p| p.payload.collection_id == collection_id)
            .count()
    }

    pub(crate) fn fail_searches(&self, fail: bool) {
        self.fail_searches.store(fail, Ordering::Relaxed);
    }

    pub(crate) fn delete_by_collection_calls(&self) -> usize {
        self.delete_by_collection_calls.load(Ordering::Relaxed)
    }

    /// A point with no matching chunk row, for eventual-consistency tests.
    pub(crate) fn insert_orphan(&self, collection_id: &str, point_id: &str, dim: usize) {
        self.points.lock().insert(
            point_id.to_string(),
            StoredPoint {
                // Maximal cosine match against any query.
                vector: vec![1.0; dim],
                payload: PointPayload {
                    doc_id: "orphan-doc".to_string(),
                    collection_id: collection_id.to_string(),
                    chunk_index: 0,
                    content: "orphan".to_string(),
                    content_hash: "orphan".to_string(),
                    title_chain: None,
                },
            },
        );
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn ensure_collection(
        &self,
        _collection_id: &str,
        vector_size: usize,
    ) -> Result<(), VectorError> {
        if vector_size != self.dimension {
            return Err(VectorError::DimensionMismatch {
                expected: self.dimension,
                got: vector_size,
            });
        }
        Ok(())
    }

    async fn upsert(
        &self,
        _collection_id: &str,
        points: Vec<VectorPoint>,
    ) -> Result<(), VectorError> {
        let mut map = self.points.lock();
        for point in points {
            if point.vector.len() != self.dimension {
                return Err(VectorError::DimensionMismatch {
                    expected: self.dimension,
                    got: point.vector.len(),
                });
            }
            map.insert(
                point.id,
                StoredPoint {
                    vector: point.vector,
                    payload: point.payload,
                },
            );
        }
        Ok(())
    }

    async fn search(
        &self,
        collection_id: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&VectorFilter>,
    ) -> Result<Vec<VectorHit>, VectorError> {
        if self.fail_searches.load(Ordering::Relaxed) {
            return Err(VectorError::Server {
                status: 503,
                message: "scripted failure".to_string(),
            });
        }
        let map = self.points.lock();
        let mut hits: Vec<VectorHit> = map
            .iter()
            .filter(|(_, p)| p.payload.collection_id == collection_id)
            .filter(|(_, p)| match filter.and_then(|f| f.doc_id.as_deref()) {
                Some(doc_id) => p.payload.doc_id == doc_id,
                None => true,
            })
            .map(|(id, p)| VectorHit {
                point_id: id.clone(),
                score: cosine(vector, &p.vector),
                chunk_index: Some(p.payload.chunk_index),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.point_id.cmp(&b.point_id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete_by_doc(&self, collection_id: &str, doc_id: &str) -> Result<(), VectorError> {
        self.points.lock().retain(|_, p| {
            !(p.payload.collection_id == collection_id && p.payload.doc_id == doc_id)
        });
        Ok(())
    }

    async fn delete_by_collection(&self, collection_id: &str) -> Result<(), VectorError> {
        self.delete_by_collection_calls.fetch_add(1, Ordering::Relaxed);
        self.points
            .lock()
            .retain(|_, p| p.payload.collection_id != collection_id);
        Ok(())
    }
}

/// Insert a collection (if absent) and a document with derived ids; returns
/// the doc id.
pub(crate) fn seed_document(
    store: &Arc<SqliteStore>,
    collection_id: &str,
    key: &str,
    content: &str,
) -> String {
    if store.collection(collection_id).unwrap().is_none() {
        let now = now_ms();
        store
            .insert_collection(&Collection {
                collection_id: collection_id.to_string(),
                name: collection_id.to_string(),
                description: None,
                created_at: now,
                updated_at: now,
            })
            .unwrap();
    }

    let hash = content_hash(content);
    let doc_id = doc_id_for(&hash);
    let now = now_ms();
    store
        .create_document(
            &Document {
                doc_id: doc_id.clone(),
                collection_id: collection_id.to_string(),
                key: key.to_string(),
                name: Some(key.to_string()),
                mime: Some("text/markdown".to_string()),
                size_bytes: Some(content.len() as i64),
                content_hash: hash,
                status: DocumentStatus::New,
                created_at: now,
                updated_at: now,
                is_deleted: false,
            },
            content,
        )
        .unwrap();
    doc_id
}

/// Poll the engine until the job reaches `status` (5s deadline).
pub(crate) async fn wait_for_status(
    engine: &SyncEngine,
    doc_id: &str,
    status: SyncStatus,
) -> SyncJob {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(job) = engine.job(doc_id) {
            if job.status == status {
                return job;
            }
            if std::time::Instant::now() > deadline {
                panic!(
                    "timed out waiting for {:?} on {}, last status {:?}",
                    status, doc_id, job.status
                );
            }
        } else if std::time::Instant::now() > deadline {
            panic!("timed out waiting for job on {}", doc_id);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
