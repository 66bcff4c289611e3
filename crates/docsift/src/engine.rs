//! Public façade: collections, document import/resync/delete, hybrid search,
//! and the rate-limit gate an outer surface calls before dispatching.
//!
//! Owns the transactional write path that spans the relational store and the
//! vector store. Cross-store atomicity is not offered; consistency comes from
//! forward-only job transitions plus deterministic point ids, so every step
//! is safe to replay.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::chunking::Chunker;
use crate::config::EngineConfig;
use crate::embedding::{EmbeddingProvider, HttpEmbeddingClient};
use crate::error::EngineError;
use crate::ratelimit::RateLimiter;
use crate::search::{self, SearchResponse};
use crate::store::{CollectionCascade, SqliteStore};
use crate::sync::retry::SchedulerStats;
use crate::sync::state::{SyncJob, SyncStatus};
use crate::sync::SyncEngine;
use crate::types::{
    content_hash, doc_id_for, new_collection_id, now_ms, Collection, Document, DocumentStatus,
};
use crate::vector::{QdrantStore, VectorFilter, VectorIndex};

#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub collection_id: String,
    pub key: String,
    pub name: Option<String>,
    pub mime: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone)]
pub enum ImportOutcome {
    /// A new document was created and queued for sync.
    Created { document: Document, job: SyncJob },
    /// Same content hash under the same key: descriptive fields updated only.
    MetadataUpdated { document: Document },
    /// Content changed: the old document was removed and replaced.
    Replaced {
        document: Document,
        previous_doc_id: String,
        job: SyncJob,
    },
}

impl ImportOutcome {
    pub fn document(&self) -> &Document {
        match self {
            Self::Created { document, .. }
            | Self::MetadataUpdated { document }
            | Self::Replaced { document, .. } => document,
        }
    }
}

/// A document together with its sync job, with the user-visible status rule
/// applied: a retrying job reports as processing, only a dead job as failed.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentView {
    pub document: Document,
    pub job: Option<SyncJob>,
}

impl DocumentView {
    pub fn effective_status(&self) -> DocumentStatus {
        match &self.job {
            Some(job) => match job.status {
                SyncStatus::Synced => DocumentStatus::Completed,
                SyncStatus::Dead => DocumentStatus::Failed,
                SyncStatus::New => DocumentStatus::New,
                SyncStatus::SplitOk
                | SyncStatus::EmbedOk
                | SyncStatus::Failed
                | SyncStatus::Retrying => DocumentStatus::Processing,
            },
            None => self.document.status,
        }
    }

    pub fn retries(&self) -> u32 {
        self.job.as_ref().map(|j| j.retries).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub collections: usize,
    pub documents: u64,
    pub chunks: u64,
    pub jobs_by_status: Vec<(SyncStatus, u64)>,
    pub active_syncs: usize,
    pub pending_retries: usize,
    pub scheduler: SchedulerStats,
}

pub struct SiftEngine {
    config: EngineConfig,
    store: Arc<SqliteStore>,
    vectors: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    sync: SyncEngine,
    limiter: RateLimiter,
}

impl SiftEngine {
    /// Build an engine over injected dependencies (stores, clients).
    pub fn new(
        config: EngineConfig,
        store: Arc<SqliteStore>,
        vectors: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::Validation)?;

        let chunker = Chunker::new(&config.chunking);
        // Whole-task deadline: both remote step timeouts plus local slack.
        let task_deadline = Duration::from_millis(
            config.embedding.timeout_ms + config.vector.timeout_ms + 10_000,
        );
        let sync = SyncEngine::new(
            Arc::clone(&store),
            Arc::clone(&vectors),
            Arc::clone(&embedder),
            chunker,
            config.sync.clone(),
            task_deadline,
        );
        let limiter = RateLimiter::new(&config.rate_limit);

        Ok(Self {
            config,
            store,
            vectors,
            embedder,
            sync,
            limiter,
        })
    }

    /// Build an engine with the production dependencies: SQLite on disk, a
    /// Qdrant vector store and an HTTP embedding client.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let store = Arc::new(SqliteStore::open(
            &config.store.path,
            config.store.busy_timeout_ms,
        )?);
        let vectors: Arc<dyn VectorIndex> = Arc::new(QdrantStore::new(&config.vector)?);
        let embedder: Arc<dyn EmbeddingProvider> =
            Arc::new(HttpEmbeddingClient::new(config.embedding.clone())?);
        Self::new(config, store, vectors, embedder)
    }

    // ── Collections ────────────────────────────────────────────────────────

    pub async fn create_collection(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<Collection, EngineError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::validation("collection name must not be empty"));
        }
        if self.store.collection_by_name(name)?.is_some() {
            return Err(EngineError::Conflict(format!(
                "collection '{}' already exists",
                name
            )));
        }

        let now = now_ms();
        let collection = Collection {
            collection_id: new_collection_id(),
            name: name.to_string(),
            description: description.map(String::from),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_collection(&collection)?;
        self.vectors
            .ensure_collection(&collection.collection_id, self.config.embedding.dimension)
            .await?;

        tracing::info!(
            collection_id = %collection.collection_id,
            name = %collection.name,
            "collection created"
        );
        Ok(collection)
    }

    pub fn collection(&self, collection_id: &str) -> Result<Option<Collection>, EngineError> {
        Ok(self.store.collection(collection_id)?)
    }

    pub fn collection_by_name(&self, name: &str) -> Result<Option<Collection>, EngineError> {
        Ok(self.store.collection_by_name(name)?)
    }

    pub fn list_collections(&self) -> Result<Vec<Collection>, EngineError> {
        Ok(self.store.list_collections()?)
    }

    /// Remove a collection, its documents, chunks and jobs, then the points
    /// mirrored in the vector store.
    pub async fn delete_collection(
        &self,
        collection_id: &str,
    ) -> Result<CollectionCascade, EngineError> {
        if self.store.collection(collection_id)?.is_none() {
            return Err(EngineError::not_found(format!(
                "collection {}",
                collection_id
            )));
        }

        let doc_ids = self.store.document_ids_in_collection(collection_id)?;
        for doc_id in &doc_ids {
            self.sync.cancel(doc_id);
            self.sync.forget(doc_id);
        }

        let cascade = self.store.delete_collection(collection_id)?;
        self.vectors.delete_by_collection(collection_id).await?;

        tracing::info!(
            collection_id = %collection_id,
            documents = cascade.documents,
            chunks = cascade.chunks,
            "collection deleted"
        );
        Ok(cascade)
    }

    // ── Documents ──────────────────────────────────────────────────────────

    /// Import (or re-import) a document. The document id derives from the
    /// content hash: an unchanged document is a metadata-only update, changed
    /// content replaces the old document entirely.
    pub async fn import_document(
        &self,
        request: ImportRequest,
    ) -> Result<ImportOutcome, EngineError> {
        let collection = self
            .store
            .collection(&request.collection_id)?
            .ok_or_else(|| {
                EngineError::not_found(format!("collection {}", request.collection_id))
            })?;
        if request.key.trim().is_empty() {
            return Err(EngineError::validation("document key must not be empty"));
        }

        let hash = content_hash(&request.content);
        let doc_id = doc_id_for(&hash);
        let size = request.content.len() as i64;
        let now = now_ms();

        let existing = self
            .store
            .document_by_key(&collection.collection_id, &request.key)?;

        if let Some(current) = &existing {
            if current.content_hash == hash {
                self.store.touch_document_metadata(
                    &current.doc_id,
                    request.name.as_deref(),
                    request.mime.as_deref(),
                    Some(size),
                )?;
                // Heal a previously interrupted import: resumes a non-terminal
                // job, no-op when already synced.
                let _ = self.sync.trigger_sync(&current.doc_id)?;
                let document = self
                    .store
                    .document(&current.doc_id)?
                    .ok_or_else(|| EngineError::internal("document vanished during import"))?;
                tracing::info!(doc_id = %document.doc_id, key = %request.key, "metadata updated");
                return Ok(ImportOutcome::MetadataUpdated { document });
            }
        }

        // The new id must not collide with a live document elsewhere.
        if let Some(clash) = self.store.document(&doc_id)? {
            let replacing_same_row = existing
                .as_ref()
                .map(|d| d.doc_id == clash.doc_id)
                .unwrap_or(false);
            if !replacing_same_row && !clash.is_deleted {
                return Err(EngineError::Conflict(format!(
                    "identical content already imported as document {}",
                    clash.doc_id
                )));
            }
        }

        let document = Document {
            doc_id: doc_id.clone(),
            collection_id: collection.collection_id.clone(),
            key: request.key.clone(),
            name: request.name.clone(),
            mime: request.mime.clone(),
            size_bytes: Some(size),
            content_hash: hash,
            status: DocumentStatus::New,
            created_at: now,
            updated_at: now,
            is_deleted: false,
        };

        match existing {
            Some(previous) => {
                self.sync.cancel(&previous.doc_id);
                self.sync.forget(&previous.doc_id);
                self.store
                    .replace_document(&previous.doc_id, &document, &request.content)?;
                // Old points are keyed by the old doc id; remove them. A
                // failure here only leaves orphans the search path already
                // drops lazily.
                if let Err(e) = self
                    .vectors
                    .delete_by_doc(&collection.collection_id, &previous.doc_id)
                    .await
                {
                    tracing::warn!(
                        doc_id = %previous.doc_id,
                        error = %e,
                        "failed to delete replaced document's points"
                    );
                }
                let job = self.sync.trigger_sync(&doc_id)?;
                tracing::info!(
                    doc_id = %doc_id,
                    previous_doc_id = %previous.doc_id,
                    key = %request.key,
                    "document replaced"
                );
                Ok(ImportOutcome::Replaced {
                    document,
                    previous_doc_id: previous.doc_id,
                    job,
                })
            }
            None => {
                // Reviving tombstoned content reuses its id; swap the row.
                if let Some(tombstone) = self.store.document(&doc_id)? {
                    self.sync.forget(&doc_id);
                    self.store
                        .replace_document(&tombstone.doc_id, &document, &request.content)?;
                } else {
                    self.store.create_document(&document, &request.content)?;
                }
                let job = self.sync.trigger_sync(&doc_id)?;
                tracing::info!(
                    doc_id = %doc_id,
                    collection_id = %collection.collection_id,
                    key = %request.key,
                    "document imported"
                );
                Ok(ImportOutcome::Created { document, job })
            }
        }
    }

    pub fn document_view(&self, doc_id: &str) -> Result<DocumentView, EngineError> {
        let document = self
            .store
            .document(doc_id)?
            .ok_or_else(|| EngineError::not_found(format!("document {}", doc_id)))?;
        let job = self.sync.job(doc_id);
        Ok(DocumentView { document, job })
    }

    pub fn list_documents(&self, collection_id: &str) -> Result<Vec<Document>, EngineError> {
        Ok(self.store.list_documents(collection_id)?)
    }

    pub fn job_status(&self, doc_id: &str) -> Option<SyncJob> {
        self.sync.job(doc_id)
    }

    /// Re-run the full sync pipeline for a document from scratch.
    pub async fn resync_document(&self, doc_id: &str) -> Result<SyncJob, EngineError> {
        let document = self
            .store
            .document(doc_id)?
            .ok_or_else(|| EngineError::not_found(format!("document {}", doc_id)))?;
        if document.is_deleted {
            return Err(EngineError::validation(format!(
                "document {} is deleted",
                doc_id
            )));
        }
        self.sync.reset_job(doc_id)?;
        self.sync.trigger_sync(doc_id)
    }

    /// Tombstone a document, removing its chunks, metadata, job and points.
    pub async fn delete_document(&self, doc_id: &str) -> Result<(), EngineError> {
        let document = self
            .store
            .document(doc_id)?
            .ok_or_else(|| EngineError::not_found(format!("document {}", doc_id)))?;
        if document.is_deleted {
            return Ok(());
        }

        self.sync.cancel(doc_id);
        self.sync.forget(doc_id);
        self.store.delete_document(doc_id)?;
        self.vectors
            .delete_by_doc(&document.collection_id, doc_id)
            .await?;

        tracing::info!(doc_id = %doc_id, "document deleted");
        Ok(())
    }

    // ── Search ─────────────────────────────────────────────────────────────

    pub async fn search(
        &self,
        collection_id: &str,
        query: &str,
        limit: Option<usize>,
        filter: Option<&VectorFilter>,
    ) -> Result<SearchResponse, EngineError> {
        if self.store.collection(collection_id)?.is_none() {
            return Err(EngineError::not_found(format!(
                "collection {}",
                collection_id
            )));
        }
        let limit = limit.unwrap_or(self.config.search.default_limit);
        search::hybrid_search(
            &self.store,
            self.vectors.as_ref(),
            self.embedder.as_ref(),
            query,
            collection_id,
            limit,
            filter,
        )
        .await
    }

    // ── Operations ─────────────────────────────────────────────────────────

    /// Rate-limit gate for an outer surface; maps a rejection into the error
    /// taxonomy.
    pub fn check_request(&self, ip: &str, endpoint_class: &str) -> Result<(), EngineError> {
        self.limiter
            .check(ip, endpoint_class)
            .map_err(|rejection| EngineError::RateLimited {
                tier: rejection.tier,
                retry_after_ms: rejection.retry_after.as_millis() as u64,
            })
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Crash recovery; call once at startup.
    pub fn recover(&self) -> Result<usize, EngineError> {
        self.sync.recover()
    }

    /// Spawn the periodic cleanup loop owned by the sync engine.
    pub fn spawn_maintenance(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.sync.clone().run_maintenance_loop(interval))
    }

    pub fn sync_engine(&self) -> &SyncEngine {
        &self.sync
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        Ok(EngineStats {
            collections: self.store.list_collections()?.len(),
            documents: self.store.count_documents(None)?,
            chunks: self.store.count_chunks(None)?,
            jobs_by_status: self.store.count_jobs_by_status()?,
            active_syncs: self.sync.active_count(),
            pending_retries: self.sync.pending_retries(),
            scheduler: self.sync.scheduler_stats(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::ChunkStrategy;
    use crate::ratelimit::{TierConfig, TierScope};
    use crate::search::SearchMode;
    use crate::sync::classifier::RetryStrategy;
    use crate::test_support::{wait_for_status, MemoryVectorIndex, ScriptedEmbedder};
    use crate::types::point_id;

    const DIM: usize = 4;

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.embedding.dimension = DIM;
        config.vector.vector_size = DIM;
        config.chunking.strategy = ChunkStrategy::ByHeadings;
        config.sync.default_retry = RetryStrategy {
            max_retries: 3,
            base_delay_ms: 10,
            max_delay_ms: 100,
            factor: 2.0,
            jitter: 0.0,
        };
        config
    }

    struct World {
        engine: SiftEngine,
        store: Arc<SqliteStore>,
        vectors: Arc<MemoryVectorIndex>,
        embedder: Arc<ScriptedEmbedder>,
    }

    fn world() -> World {
        world_with(test_config(), ScriptedEmbedder::always_ok(DIM))
    }

    fn world_with(config: EngineConfig, embedder: ScriptedEmbedder) -> World {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let vectors = Arc::new(MemoryVectorIndex::new(DIM));
        let embedder = Arc::new(embedder);
        let engine = SiftEngine::new(
            config,
            Arc::clone(&store),
            vectors.clone(),
            embedder.clone(),
        )
        .unwrap();
        World {
            engine,
            store,
            vectors,
            embedder,
        }
    }

    fn import(collection_id: &str, key: &str, content: &str) -> ImportRequest {
        ImportRequest {
            collection_id: collection_id.to_string(),
            key: key.to_string(),
            name: Some(key.to_string()),
            mime: Some("text/markdown".to_string()),
            content: content.to_string(),
        }
    }

    async fn import_and_sync(world: &World, collection_id: &str, key: &str, content: &str) -> String {
        let outcome = world
            .engine
            .import_document(import(collection_id, key, content))
            .await
            .unwrap();
        let doc_id = outcome.document().doc_id.clone();
        wait_for_status(&world.engine.sync, &doc_id, SyncStatus::Synced).await;
        doc_id
    }

    #[tokio::test]
    async fn happy_path_import_chunks_embeds_and_syncs() {
        let w = world();
        let collection = w.engine.create_collection("A", None).await.unwrap();

        let outcome = w
            .engine
            .import_document(import(
                &collection.collection_id,
                "doc.md",
                "# Heading\n\nalpha beta gamma.",
            ))
            .await
            .unwrap();
        let doc_id = outcome.document().doc_id.clone();
        assert!(matches!(outcome, ImportOutcome::Created { .. }));

        let job = wait_for_status(&w.engine.sync, &doc_id, SyncStatus::Synced).await;
        assert_eq!(job.progress, 100);

        let chunks = w.store.chunks_by_doc(&doc_id).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].title.as_deref(), Some("Heading"));
        assert_eq!(chunks[0].content, "alpha beta gamma.");

        let calls = w.embedder.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec!["alpha beta gamma.".to_string()]);

        assert!(w.vectors.contains(&point_id(&doc_id, 0)));
        assert_eq!(w.vectors.point_count(), 1);

        let view = w.engine.document_view(&doc_id).unwrap();
        assert_eq!(view.effective_status(), DocumentStatus::Completed);
    }

    #[tokio::test]
    async fn import_into_missing_collection_is_not_found() {
        let w = world();
        let err = w
            .engine
            .import_document(import("nope", "a.md", "body"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn duplicate_collection_name_is_a_conflict() {
        let w = world();
        w.engine.create_collection("A", None).await.unwrap();
        let err = w.engine.create_collection("A", None).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn same_content_reimport_updates_metadata_only() {
        let w = world();
        let collection = w.engine.create_collection("A", None).await.unwrap();
        let doc_id =
            import_and_sync(&w, &collection.collection_id, "doc.md", "# H\n\nstable body.").await;
        let calls_before = w.embedder.calls().len();

        let mut request = import(&collection.collection_id, "doc.md", "# H\n\nstable body.");
        request.name = Some("renamed.md".to_string());
        let outcome = w.engine.import_document(request).await.unwrap();
        assert!(matches!(outcome, ImportOutcome::MetadataUpdated { .. }));
        assert_eq!(outcome.document().doc_id, doc_id);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(w.embedder.calls().len(), calls_before, "no re-embedding");
        let doc = w.store.document(&doc_id).unwrap().unwrap();
        assert_eq!(doc.name.as_deref(), Some("renamed.md"));
    }

    #[tokio::test]
    async fn changed_content_replaces_the_document() {
        let w = world();
        let collection = w.engine.create_collection("A", None).await.unwrap();
        let old_doc_id =
            import_and_sync(&w, &collection.collection_id, "doc.md", "# H\n\nfirst version.").await;
        assert!(w.vectors.contains(&point_id(&old_doc_id, 0)));

        let outcome = w
            .engine
            .import_document(import(
                &collection.collection_id,
                "doc.md",
                "# H\n\nsecond version.",
            ))
            .await
            .unwrap();
        let new_doc_id = outcome.document().doc_id.clone();
        assert!(matches!(outcome, ImportOutcome::Replaced { .. }));
        assert_ne!(new_doc_id, old_doc_id);

        wait_for_status(&w.engine.sync, &new_doc_id, SyncStatus::Synced).await;

        // Old rows and points are gone, new ones exist.
        assert!(w.store.document(&old_doc_id).unwrap().is_none());
        assert_eq!(w.store.chunks_by_doc(&old_doc_id).unwrap().len(), 0);
        assert!(!w.vectors.contains(&point_id(&old_doc_id, 0)));
        assert!(w.vectors.contains(&point_id(&new_doc_id, 0)));
    }

    #[tokio::test]
    async fn identical_content_under_different_key_conflicts() {
        let w = world();
        let collection = w.engine.create_collection("A", None).await.unwrap();
        import_and_sync(&w, &collection.collection_id, "a.md", "# H\n\nsame body.").await;

        let err = w
            .engine
            .import_document(import(&collection.collection_id, "b.md", "# H\n\nsame body."))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn deleted_document_can_be_reimported() {
        let w = world();
        let collection = w.engine.create_collection("A", None).await.unwrap();
        let doc_id =
            import_and_sync(&w, &collection.collection_id, "doc.md", "# H\n\nbody one.").await;

        w.engine.delete_document(&doc_id).await.unwrap();
        assert_eq!(w.vectors.point_count(), 0);
        assert_eq!(w.store.chunks_by_doc(&doc_id).unwrap().len(), 0);
        let view = w.engine.document_view(&doc_id).unwrap();
        assert!(view.document.is_deleted);

        // Same key and the same content come back under the same doc id.
        let outcome = w
            .engine
            .import_document(import(&collection.collection_id, "doc.md", "# H\n\nbody one."))
            .await
            .unwrap();
        assert!(matches!(outcome, ImportOutcome::Created { .. }));
        assert_eq!(outcome.document().doc_id, doc_id);
        wait_for_status(&w.engine.sync, &doc_id, SyncStatus::Synced).await;
        assert!(w.vectors.contains(&point_id(&doc_id, 0)));
    }

    #[tokio::test]
    async fn resync_is_idempotent_end_to_end() {
        let w = world();
        let collection = w.engine.create_collection("A", None).await.unwrap();
        let doc_id =
            import_and_sync(&w, &collection.collection_id, "doc.md", "# H\n\nalpha beta.").await;

        let chunks_before = w.store.chunks_by_doc(&doc_id).unwrap();
        let points_before = w.vectors.point_count();

        w.engine.resync_document(&doc_id).await.unwrap();
        wait_for_status(&w.engine.sync, &doc_id, SyncStatus::Synced).await;

        // Deterministic point ids: the second full run leaves both stores in
        // exactly the same state.
        assert_eq!(w.store.chunks_by_doc(&doc_id).unwrap(), chunks_before);
        assert_eq!(w.vectors.point_count(), points_before);
        assert_eq!(w.embedder.calls().len(), 2);
    }

    #[tokio::test]
    async fn cascade_delete_clears_both_stores() {
        let w = world();
        let collection = w.engine.create_collection("A", None).await.unwrap();
        // 3 + 2 = 5 chunks across two documents.
        let doc1 = import_and_sync(
            &w,
            &collection.collection_id,
            "one.md",
            "# A\n\nfirst.\n\n# B\n\nsecond.\n\n# C\n\nthird.",
        )
        .await;
        let doc2 = import_and_sync(
            &w,
            &collection.collection_id,
            "two.md",
            "# D\n\nfourth.\n\n# E\n\nfifth.",
        )
        .await;
        assert_eq!(w.store.count_chunks(Some(&collection.collection_id)).unwrap(), 5);
        assert_eq!(w.vectors.point_count(), 5);

        let cascade = w
            .engine
            .delete_collection(&collection.collection_id)
            .await
            .unwrap();
        assert_eq!(cascade.documents, 2);
        assert_eq!(cascade.chunks, 5);
        assert_eq!(cascade.jobs, 2);

        assert_eq!(w.store.count_chunks(None).unwrap(), 0);
        assert_eq!(w.store.count_documents(None).unwrap(), 0);
        assert!(w.store.job_by_doc(&doc1).unwrap().is_none());
        assert!(w.store.job_by_doc(&doc2).unwrap().is_none());
        assert_eq!(w.vectors.delete_by_collection_calls(), 1);
        assert_eq!(w.vectors.points_in_collection(&collection.collection_id), 0);

        // Searching the removed collection is a not-found error now.
        let err = w
            .engine
            .search(&collection.collection_id, "first", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn search_returns_ranked_results_end_to_end() {
        let w = world();
        let collection = w.engine.create_collection("A", None).await.unwrap();
        import_and_sync(
            &w,
            &collection.collection_id,
            "savanna.md",
            "# Wildlife\n\nzebras graze on the savanna.",
        )
        .await;
        import_and_sync(
            &w,
            &collection.collection_id,
            "ocean.md",
            "# Marine\n\nwhales sing in the ocean.",
        )
        .await;

        let response = w
            .engine
            .search(&collection.collection_id, "savanna", None, None)
            .await
            .unwrap();
        assert_eq!(response.mode, SearchMode::Hybrid);
        assert!(!response.results.is_empty());
        assert!(response.results[0].chunk.content.contains("savanna"));
    }

    #[tokio::test]
    async fn failed_job_reports_document_as_failed() {
        let w = world_with(
            test_config(),
            ScriptedEmbedder::scripted(
                DIM,
                vec![crate::test_support::EmbedOutcome::Permanent("denied".to_string())],
            ),
        );
        let collection = w.engine.create_collection("A", None).await.unwrap();
        let outcome = w
            .engine
            .import_document(import(&collection.collection_id, "doc.md", "# H\n\nbody."))
            .await
            .unwrap();
        let doc_id = outcome.document().doc_id.clone();
        wait_for_status(&w.engine.sync, &doc_id, SyncStatus::Dead).await;

        let view = w.engine.document_view(&doc_id).unwrap();
        assert_eq!(view.effective_status(), DocumentStatus::Failed);
    }

    #[tokio::test]
    async fn retrying_document_reports_as_processing() {
        let mut config = test_config();
        config.sync.default_retry.base_delay_ms = 5_000;
        let w = world_with(
            config,
            ScriptedEmbedder::scripted(
                DIM,
                vec![crate::test_support::EmbedOutcome::Transient("down".to_string())],
            ),
        );
        let collection = w.engine.create_collection("A", None).await.unwrap();
        let outcome = w
            .engine
            .import_document(import(&collection.collection_id, "doc.md", "# H\n\nbody."))
            .await
            .unwrap();
        let doc_id = outcome.document().doc_id.clone();
        wait_for_status(&w.engine.sync, &doc_id, SyncStatus::Retrying).await;

        let view = w.engine.document_view(&doc_id).unwrap();
        assert_eq!(view.effective_status(), DocumentStatus::Processing);
        assert_eq!(view.retries(), 1);
    }

    #[tokio::test]
    async fn rate_limit_gate_maps_to_engine_error() {
        let mut config = test_config();
        config.rate_limit.tiers = vec![TierConfig {
            name: "search".to_string(),
            scope: TierScope::EndpointClass,
            max_tokens: 2.0,
            refill_per_sec: 0.001,
            whitelist: Vec::new(),
            priority: 0,
            enabled: true,
        }];
        let w = world_with(config, ScriptedEmbedder::always_ok(DIM));

        assert!(w.engine.check_request("1.2.3.4", "search").is_ok());
        assert!(w.engine.check_request("1.2.3.4", "search").is_ok());
        let err = w.engine.check_request("1.2.3.4", "search").unwrap_err();
        match err {
            EngineError::RateLimited { tier, retry_after_ms } => {
                assert_eq!(tier, "search");
                assert!(retry_after_ms > 0);
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn stats_reflect_the_world() {
        let w = world();
        let collection = w.engine.create_collection("A", None).await.unwrap();
        import_and_sync(&w, &collection.collection_id, "doc.md", "# H\n\nbody text.").await;

        let stats = w.engine.stats().unwrap();
        assert_eq!(stats.collections, 1);
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.chunks, 1);
        assert!(stats
            .jobs_by_status
            .iter()
            .any(|(status, count)| *status == SyncStatus::Synced && *count == 1));
    }
}
