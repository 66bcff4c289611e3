//! Durable per-document sync engine.
//!
//! Drives split → embed → mark-synced for each document, with resume-by-status
//! after a crash, classified retries on failure, per-document serialization
//! and a bounded worker pool. The job row in the store is the source of truth;
//! the in-memory map is a read-through cache.

pub mod classifier;
pub mod retry;
pub mod state;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Semaphore;

use crate::chunking::Chunker;
use crate::config::SyncConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::EngineError;
use crate::store::SqliteStore;
use crate::types::{now_ms, point_id, Chunk, ChunkMeta, DocumentStatus};
use crate::vector::{PointPayload, VectorIndex, VectorPoint};

use classifier::{classify, strategy_for, ErrorCategory, RetryStrategy};
use retry::{RetryScheduler, SchedulerStats};
use state::{SyncEvent, SyncJob, SyncStatus};

/// Outcome of a failed step, decided by classification alone.
enum StepOutcome {
    Retryable(EngineError),
    Fatal(EngineError),
}

fn outcome_of(err: EngineError) -> StepOutcome {
    if classify(&err).is_temporary() {
        StepOutcome::Retryable(err)
    } else {
        StepOutcome::Fatal(err)
    }
}

struct RetryPlan {
    category: ErrorCategory,
    attempt: u32,
    strategy: RetryStrategy,
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<SyncShared>,
}

struct SyncShared {
    store: Arc<SqliteStore>,
    vectors: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunker: Chunker,
    config: SyncConfig,
    /// Whole-task deadline: the sum of the step timeouts.
    task_deadline: Duration,
    jobs: DashMap<String, SyncJob>,
    /// Cancel flag per in-flight document; presence means a task is running.
    in_flight: DashMap<String, Arc<AtomicBool>>,
    scheduler: RetryScheduler,
    permits: Arc<Semaphore>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<SqliteStore>,
        vectors: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        chunker: Chunker,
        config: SyncConfig,
        task_deadline: Duration,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_parallel_docs));
        Self {
            inner: Arc::new(SyncShared {
                store,
                vectors,
                embedder,
                chunker,
                config,
                task_deadline,
                jobs: DashMap::new(),
                in_flight: DashMap::new(),
                scheduler: RetryScheduler::new(),
                permits,
            }),
        }
    }

    /// Start (or resume) syncing a document. A second call while the document
    /// is already in flight coalesces into the current run and just returns
    /// the job snapshot. Errors after this point are recorded on the job, not
    /// surfaced here.
    pub fn trigger_sync(&self, doc_id: &str) -> Result<SyncJob, EngineError> {
        let job = self.get_or_create_job(doc_id)?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        self.spawn_execute(doc_id);
        Ok(self.job(doc_id).unwrap_or(job))
    }

    /// Current job snapshot, read through the cache.
    pub fn job(&self, doc_id: &str) -> Option<SyncJob> {
        if let Some(job) = self.inner.jobs.get(doc_id) {
            return Some(job.clone());
        }
        match self.inner.store.job_by_doc(doc_id) {
            Ok(Some(job)) => {
                self.inner.jobs.insert(doc_id.to_string(), job.clone());
                Some(job)
            }
            _ => None,
        }
    }

    /// Cancel pending retries and signal the in-flight task, if any. The
    /// running task observes the flag at its next step boundary and stops,
    /// leaving the job in its last persisted state.
    pub fn cancel(&self, doc_id: &str) -> bool {
        let pending = self.inner.scheduler.cancel_all_for(doc_id);
        let signalled = match self.inner.in_flight.get(doc_id) {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        };
        if pending > 0 || signalled {
            tracing::info!(doc_id = %doc_id, pending, signalled, "sync cancelled");
        }
        pending > 0 || signalled
    }

    /// Drop the job from the in-memory cache (used when its document goes
    /// away entirely).
    pub fn forget(&self, doc_id: &str) {
        self.inner.jobs.remove(doc_id);
    }

    /// Cancel any pending work and restart the job from NEW. Used by resync,
    /// where the caller wants a fresh end-to-end run regardless of the
    /// current state.
    pub fn reset_job(&self, doc_id: &str) -> Result<SyncJob, EngineError> {
        self.cancel(doc_id);
        let job = SyncJob::new(doc_id);
        self.inner.store.upsert_job(&job)?;
        self.inner.jobs.insert(doc_id.to_string(), job.clone());
        Ok(job)
    }

    /// Crash recovery: reload every unfinished job. Forward states resume
    /// immediately; failed/retrying jobs are rescheduled when their error is
    /// temporary and attempts remain, otherwise they are marked dead.
    pub fn recover(&self) -> Result<usize, EngineError> {
        let jobs = self.inner.store.jobs_with_statuses(&[
            SyncStatus::New,
            SyncStatus::SplitOk,
            SyncStatus::EmbedOk,
            SyncStatus::Retrying,
            SyncStatus::Failed,
        ])?;

        let mut scheduled = 0usize;
        for job in jobs {
            self.inner.jobs.insert(job.doc_id.clone(), job.clone());
            match job.status {
                SyncStatus::New | SyncStatus::SplitOk | SyncStatus::EmbedOk => {
                    self.spawn_execute(&job.doc_id);
                    scheduled += 1;
                }
                SyncStatus::Retrying | SyncStatus::Failed => {
                    let category = job.error_category.unwrap_or(ErrorCategory::Unknown);
                    let strategy = job
                        .last_retry_strategy
                        .unwrap_or_else(|| strategy_for(category, &self.inner.config.default_retry));

                    if category.is_temporary() && job.retries < strategy.max_retries {
                        let mut job = job;
                        if job.status == SyncStatus::Failed {
                            job.apply(SyncEvent::Retry)
                                .map_err(|e| EngineError::internal(e.to_string()))?;
                            self.persist(&mut job)?;
                        }
                        let attempt = job.retries.max(1);
                        self.schedule_retry(&job.doc_id, category, attempt, strategy);
                        scheduled += 1;
                    } else {
                        let mut job = job;
                        if job.status != SyncStatus::Failed {
                            let _ = job.apply(SyncEvent::Error);
                        }
                        let _ = job.apply(SyncEvent::RetriesExceeded);
                        self.persist(&mut job)?;
                        let _ = self
                            .inner
                            .store
                            .set_document_status(&job.doc_id, DocumentStatus::Failed);
                        tracing::warn!(
                            doc_id = %job.doc_id,
                            category = category.as_str(),
                            retries = job.retries,
                            "job not recoverable, marked dead"
                        );
                    }
                }
                SyncStatus::Synced | SyncStatus::Dead => {}
            }
        }

        tracing::info!(scheduled, "sync recovery complete");
        Ok(scheduled)
    }

    /// Evict terminal cache entries older than `older_than_hours` and purge
    /// historical terminal job rows past the retention window.
    pub fn cleanup(&self, older_than_hours: u64) -> Result<usize, EngineError> {
        let cache_cutoff = now_ms() - (older_than_hours as i64) * 3_600_000;
        self.inner
            .jobs
            .retain(|_, job| !(job.status.is_terminal() && job.updated_at < cache_cutoff));

        let retention_cutoff =
            now_ms() - (self.inner.config.job_retention_days as i64) * 86_400_000;
        let purged = self
            .inner
            .store
            .purge_terminal_jobs_older_than(retention_cutoff)?;
        if purged > 0 {
            tracing::info!(purged, "purged historical sync jobs");
        }
        Ok(purged)
    }

    /// Periodic maintenance driven by a single monotonic ticker.
    pub async fn run_maintenance_loop(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.cleanup(self.inner.config.cleanup_after_hours) {
                tracing::warn!(error = %e, "sync maintenance failed");
            }
        }
    }

    /// In-flight sync tasks; bounded by `max_parallel_docs`.
    pub fn active_count(&self) -> usize {
        self.inner.config.max_parallel_docs - self.inner.permits.available_permits()
    }

    pub fn pending_retries(&self) -> usize {
        self.inner.scheduler.pending_count()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.inner.scheduler.stats()
    }

    // ── Internals ──────────────────────────────────────────────────────────

    fn get_or_create_job(&self, doc_id: &str) -> Result<SyncJob, EngineError> {
        if let Some(job) = self.inner.jobs.get(doc_id) {
            return Ok(job.clone());
        }
        if let Some(job) = self.inner.store.job_by_doc(doc_id)? {
            self.inner.jobs.insert(doc_id.to_string(), job.clone());
            return Ok(job);
        }
        if self.inner.store.document(doc_id)?.is_none() {
            return Err(EngineError::not_found(format!("document {}", doc_id)));
        }
        let job = SyncJob::new(doc_id);
        self.inner.store.upsert_job(&job)?;
        self.inner.jobs.insert(doc_id.to_string(), job.clone());
        Ok(job)
    }

    fn load_job(&self, doc_id: &str) -> Result<SyncJob, EngineError> {
        self.job(doc_id)
            .ok_or_else(|| EngineError::internal(format!("job for {} missing", doc_id)))
    }

    fn persist(&self, job: &mut SyncJob) -> Result<(), EngineError> {
        self.inner.store.upsert_job(job)?;
        self.inner.jobs.insert(job.doc_id.clone(), job.clone());
        Ok(())
    }

    /// Register the document as in-flight and spawn its task. Returns false
    /// when a task is already running (the call coalesces).
    fn spawn_execute(&self, doc_id: &str) -> bool {
        let cancel = Arc::new(AtomicBool::new(false));
        match self.inner.in_flight.entry(doc_id.to_string()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&cancel));
            }
        }
        let engine = self.clone();
        let doc_id = doc_id.to_string();
        tokio::spawn(async move {
            engine.execute_sync(doc_id, cancel).await;
        });
        true
    }

    async fn execute_sync(self, doc_id: String, cancel: Arc<AtomicBool>) {
        let permit = match Arc::clone(&self.inner.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.inner.in_flight.remove(&doc_id);
                return;
            }
        };

        let outcome =
            tokio::time::timeout(self.inner.task_deadline, self.run_steps(&doc_id, &cancel))
                .await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(_) => Some(EngineError::Timeout(format!(
                "sync task for {} exceeded {}ms deadline",
                doc_id,
                self.inner.task_deadline.as_millis()
            ))),
        };

        let plan = failure.and_then(|err| self.record_failure(&doc_id, err));

        drop(permit);
        self.inner.in_flight.remove(&doc_id);

        // Scheduling happens after the in-flight slot is released so the
        // retry task can re-register even with a zero delay.
        if let Some(plan) = plan {
            self.schedule_retry(&doc_id, plan.category, plan.attempt, plan.strategy);
        }
    }

    async fn run_steps(&self, doc_id: &str, cancel: &AtomicBool) -> Result<(), EngineError> {
        {
            let mut job = self.load_job(doc_id)?;
            if job.started_at.is_none() {
                job.started_at = Some(now_ms());
            }
            job.last_attempt_at = Some(now_ms());
            self.persist(&mut job)?;
        }
        self.inner
            .store
            .set_document_status(doc_id, DocumentStatus::Processing)?;

        loop {
            if cancel.load(Ordering::Relaxed) {
                tracing::info!(doc_id = %doc_id, "sync stopped at step boundary after cancel");
                return Ok(());
            }

            // The document can be tombstoned between steps; re-running the
            // cascade clears anything the previous step re-created.
            match self.inner.store.document(doc_id)? {
                None => return Ok(()),
                Some(doc) if doc.is_deleted => {
                    let _ = self.inner.store.delete_document(doc_id);
                    self.inner.jobs.remove(doc_id);
                    tracing::info!(doc_id = %doc_id, "document deleted mid-sync, stopping");
                    return Ok(());
                }
                Some(_) => {}
            }

            let status = self.load_job(doc_id)?.status;
            match status {
                SyncStatus::New | SyncStatus::Retrying => self.step_split(doc_id).await?,
                SyncStatus::SplitOk => self.step_embed(doc_id).await?,
                SyncStatus::EmbedOk => self.step_mark_synced(doc_id)?,
                SyncStatus::Synced | SyncStatus::Dead | SyncStatus::Failed => return Ok(()),
            }
        }
    }

    /// Split the document and swap its chunks in one transaction. Documents
    /// with no effective content complete immediately.
    async fn step_split(&self, doc_id: &str) -> Result<(), EngineError> {
        let doc = self
            .inner
            .store
            .document(doc_id)?
            .ok_or_else(|| EngineError::not_found(format!("document {}", doc_id)))?;
        let content = self.inner.store.document_content(doc_id)?;

        if content.trim().is_empty() {
            self.inner
                .store
                .set_document_status(doc_id, DocumentStatus::Completed)?;
            let mut job = self.load_job(doc_id)?;
            job.apply(SyncEvent::MetaUpdated)
                .map_err(|e| EngineError::internal(e.to_string()))?;
            finish_timing(&mut job);
            self.persist(&mut job)?;
            tracing::info!(doc_id = %doc_id, "empty document, synced without chunks");
            return Ok(());
        }

        let pieces = self.inner.chunker.split(&content, doc.name.as_deref());
        let now = now_ms();
        let mut chunks = Vec::with_capacity(pieces.len());
        let mut metas = Vec::with_capacity(pieces.len());
        for piece in pieces {
            let pid = point_id(doc_id, piece.chunk_index);
            chunks.push(Chunk {
                point_id: pid.clone(),
                doc_id: doc_id.to_string(),
                collection_id: doc.collection_id.clone(),
                chunk_index: piece.chunk_index,
                title: piece.title,
                content: piece.content,
            });
            metas.push(ChunkMeta {
                point_id: pid,
                doc_id: doc_id.to_string(),
                collection_id: doc.collection_id.clone(),
                chunk_index: piece.chunk_index,
                title_chain: piece.title_chain,
                content_hash: piece.content_hash,
                created_at: now,
            });
        }

        self.inner.store.replace_chunks(doc_id, &chunks, &metas)?;

        let mut job = self.load_job(doc_id)?;
        job.apply(SyncEvent::ChunksSaved)
            .map_err(|e| EngineError::internal(e.to_string()))?;
        self.persist(&mut job)?;

        tracing::info!(doc_id = %doc_id, chunks = chunks.len(), "chunks saved");
        Ok(())
    }

    /// Embed all chunks in order and upsert the resulting points in bulk.
    async fn step_embed(&self, doc_id: &str) -> Result<(), EngineError> {
        let doc = self
            .inner
            .store
            .document(doc_id)?
            .ok_or_else(|| EngineError::not_found(format!("document {}", doc_id)))?;
        let chunks = self.inner.store.chunks_by_doc(doc_id)?;
        let metas = self.inner.store.chunk_metas_by_doc(doc_id)?;
        let meta_by_point: HashMap<&str, &ChunkMeta> =
            metas.iter().map(|m| (m.point_id.as_str(), m)).collect();

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self.inner.embedder.embed(&texts).await?;
        if embeddings.len() != chunks.len() {
            return Err(EngineError::internal(format!(
                "embedding count mismatch for {}: {} chunks, {} vectors",
                doc_id,
                chunks.len(),
                embeddings.len()
            )));
        }

        let points: Vec<VectorPoint> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, vector)| {
                let meta = meta_by_point.get(chunk.point_id.as_str());
                VectorPoint {
                    id: chunk.point_id.clone(),
                    vector,
                    payload: PointPayload {
                        doc_id: chunk.doc_id.clone(),
                        collection_id: chunk.collection_id.clone(),
                        chunk_index: chunk.chunk_index,
                        content: chunk.content.clone(),
                        content_hash: meta.map(|m| m.content_hash.clone()).unwrap_or_default(),
                        title_chain: meta.and_then(|m| m.title_chain.clone()),
                    },
                }
            })
            .collect();

        let point_count = points.len();
        self.inner.vectors.upsert(&doc.collection_id, points).await?;

        let mut job = self.load_job(doc_id)?;
        job.apply(SyncEvent::VectorsInserted)
            .map_err(|e| EngineError::internal(e.to_string()))?;
        self.persist(&mut job)?;

        tracing::info!(doc_id = %doc_id, points = point_count, "vectors inserted");
        Ok(())
    }

    fn step_mark_synced(&self, doc_id: &str) -> Result<(), EngineError> {
        self.inner
            .store
            .set_document_status(doc_id, DocumentStatus::Completed)?;
        let mut job = self.load_job(doc_id)?;
        job.apply(SyncEvent::MetaUpdated)
            .map_err(|e| EngineError::internal(e.to_string()))?;
        finish_timing(&mut job);
        self.persist(&mut job)?;

        tracing::info!(
            doc_id = %doc_id,
            duration_ms = job.duration_ms.unwrap_or(0),
            retries = job.retries,
            "document synced"
        );
        Ok(())
    }

    /// Stamp the failure into the job and decide its fate. Returns a retry
    /// plan when the job moved to RETRYING; `None` means terminal.
    fn record_failure(&self, doc_id: &str, err: EngineError) -> Option<RetryPlan> {
        let category = classify(&err);
        let strategy = strategy_for(category, &self.inner.config.default_retry);

        let mut job = match self.load_job(doc_id) {
            Ok(job) => job,
            Err(load_err) => {
                tracing::error!(doc_id = %doc_id, error = %load_err, "failure on unknown job");
                return None;
            }
        };
        if job.status.is_terminal() {
            return None;
        }

        let exhausted = job.retries >= strategy.max_retries;

        if job.apply(SyncEvent::Error).is_err() {
            tracing::error!(doc_id = %doc_id, status = ?job.status, "illegal error transition");
            return None;
        }
        job.error = Some(err.to_string());
        job.error_category = Some(category);
        job.last_retry_strategy = Some(strategy);
        job.last_attempt_at = Some(now_ms());

        match outcome_of(err) {
            StepOutcome::Retryable(cause) if !exhausted => {
                if job.apply(SyncEvent::Retry).is_err() {
                    return None;
                }
                if self.persist(&mut job).is_err() {
                    tracing::error!(doc_id = %doc_id, "failed to persist retrying job");
                }
                tracing::warn!(
                    doc_id = %doc_id,
                    category = category.as_str(),
                    error = %cause,
                    attempt = job.retries,
                    max = strategy.max_retries,
                    "sync step failed, retry scheduled"
                );
                Some(RetryPlan {
                    category,
                    attempt: job.retries,
                    strategy,
                })
            }
            StepOutcome::Retryable(cause) | StepOutcome::Fatal(cause) => {
                let _ = job.apply(SyncEvent::RetriesExceeded);
                if self.persist(&mut job).is_err() {
                    tracing::error!(doc_id = %doc_id, "failed to persist dead job");
                }
                let _ = self
                    .inner
                    .store
                    .set_document_status(doc_id, DocumentStatus::Failed);
                tracing::warn!(
                    doc_id = %doc_id,
                    category = category.as_str(),
                    error = %cause,
                    retries = job.retries,
                    "sync job dead"
                );
                None
            }
        }
    }

    fn schedule_retry(
        &self,
        doc_id: &str,
        category: ErrorCategory,
        attempt: u32,
        strategy: RetryStrategy,
    ) {
        let engine = self.clone();
        let doc = doc_id.to_string();
        self.inner
            .scheduler
            .schedule_retry(doc_id, category, attempt, &strategy, move || async move {
                engine.spawn_execute(&doc);
            });
    }
}

fn finish_timing(job: &mut SyncJob) {
    let now = now_ms();
    job.completed_at = Some(now);
    job.duration_ms = job.started_at.map(|started| (now - started).max(0));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::ChunkStrategy;
    use crate::config::ChunkingConfig;
    use crate::test_support::{
        seed_document, wait_for_status, EmbedOutcome, MemoryVectorIndex, ScriptedEmbedder,
    };
    use crate::types::content_hash;

    const DIM: usize = 4;

    fn chunker() -> Chunker {
        Chunker::new(&ChunkingConfig {
            strategy: ChunkStrategy::ByHeadings,
            max_chunk_size: 1000,
            overlap: 100,
        })
    }

    fn sync_config() -> SyncConfig {
        SyncConfig {
            max_parallel_docs: 4,
            default_retry: RetryStrategy {
                max_retries: 3,
                base_delay_ms: 10,
                max_delay_ms: 100,
                factor: 2.0,
                jitter: 0.0,
            },
            cleanup_after_hours: 24,
            job_retention_days: 14,
        }
    }

    fn engine_with(
        store: Arc<SqliteStore>,
        embedder: Arc<ScriptedEmbedder>,
        vectors: Arc<MemoryVectorIndex>,
    ) -> SyncEngine {
        SyncEngine::new(
            store,
            vectors,
            embedder,
            chunker(),
            sync_config(),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn happy_path_reaches_synced_with_deterministic_points() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let embedder = Arc::new(ScriptedEmbedder::always_ok(DIM));
        let vectors = Arc::new(MemoryVectorIndex::new(DIM));
        let engine = engine_with(store.clone(), embedder.clone(), vectors.clone());

        let doc_id = seed_document(&store, "col-1", "a.md", "# Heading\n\nalpha beta gamma.");
        engine.trigger_sync(&doc_id).unwrap();
        let job = wait_for_status(&engine, &doc_id, SyncStatus::Synced).await;

        assert_eq!(job.progress, 100);
        assert!(job.completed_at.is_some());
        assert!(job.duration_ms.is_some());

        let chunks = store.chunks_by_doc(&doc_id).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].title.as_deref(), Some("Heading"));
        assert_eq!(chunks[0].content, "alpha beta gamma.");

        // Embedding called once, with the chunk text.
        let calls = embedder.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec!["alpha beta gamma.".to_string()]);

        // Exactly the deterministic point exists in the vector store.
        assert!(vectors.contains(&point_id(&doc_id, 0)));
        assert_eq!(vectors.point_count(), 1);

        let doc = store.document(&doc_id).unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Completed);
    }

    #[tokio::test]
    async fn triggering_twice_is_idempotent() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let embedder = Arc::new(ScriptedEmbedder::always_ok(DIM));
        let vectors = Arc::new(MemoryVectorIndex::new(DIM));
        let engine = engine_with(store.clone(), embedder.clone(), vectors.clone());

        let doc_id = seed_document(&store, "col-1", "a.md", "# H\n\nalpha beta.");
        engine.trigger_sync(&doc_id).unwrap();
        wait_for_status(&engine, &doc_id, SyncStatus::Synced).await;
        let chunks_before = store.chunks_by_doc(&doc_id).unwrap();

        // A second end-to-end run over the same terminal job is a no-op.
        engine.trigger_sync(&doc_id).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.chunks_by_doc(&doc_id).unwrap(), chunks_before);
        assert_eq!(vectors.point_count(), 1);
        assert_eq!(embedder.calls().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_triggers_coalesce_per_document() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let embedder = Arc::new(ScriptedEmbedder::always_ok_with_delay(
            DIM,
            Duration::from_millis(50),
        ));
        let vectors = Arc::new(MemoryVectorIndex::new(DIM));
        let engine = engine_with(store.clone(), embedder.clone(), vectors.clone());

        let doc_id = seed_document(&store, "col-1", "a.md", "# H\n\nalpha beta.");
        engine.trigger_sync(&doc_id).unwrap();
        engine.trigger_sync(&doc_id).unwrap();
        engine.trigger_sync(&doc_id).unwrap();
        wait_for_status(&engine, &doc_id, SyncStatus::Synced).await;

        assert_eq!(embedder.calls().len(), 1, "steps must not run twice");
    }

    #[tokio::test]
    async fn empty_document_short_circuits_to_synced() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let embedder = Arc::new(ScriptedEmbedder::always_ok(DIM));
        let vectors = Arc::new(MemoryVectorIndex::new(DIM));
        let engine = engine_with(store.clone(), embedder.clone(), vectors.clone());

        let doc_id = seed_document(&store, "col-1", "empty.md", "   \n\n  ");
        engine.trigger_sync(&doc_id).unwrap();
        let job = wait_for_status(&engine, &doc_id, SyncStatus::Synced).await;

        assert_eq!(job.progress, 100);
        assert!(embedder.calls().is_empty());
        assert_eq!(vectors.point_count(), 0);
        assert_eq!(store.chunks_by_doc(&doc_id).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn recovery_resumes_at_embed_without_duplicating_chunks() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let embedder = Arc::new(ScriptedEmbedder::always_ok(DIM));
        let vectors = Arc::new(MemoryVectorIndex::new(DIM));

        // Simulate a crash after the split step: chunks persisted, job at
        // SPLIT_OK, nothing embedded yet.
        let doc_id = seed_document(&store, "col-1", "a.md", "# H\n\nalpha beta gamma.");
        let chunk = Chunk {
            point_id: point_id(&doc_id, 0),
            doc_id: doc_id.clone(),
            collection_id: "col-1".to_string(),
            chunk_index: 0,
            title: Some("H".to_string()),
            content: "alpha beta gamma.".to_string(),
        };
        let meta = ChunkMeta {
            point_id: chunk.point_id.clone(),
            doc_id: doc_id.clone(),
            collection_id: "col-1".to_string(),
            chunk_index: 0,
            title_chain: Some("H".to_string()),
            content_hash: content_hash("alpha beta gamma."),
            created_at: now_ms(),
        };
        store.replace_chunks(&doc_id, &[chunk], &[meta]).unwrap();
        let mut job = SyncJob::new(&doc_id);
        job.apply(SyncEvent::ChunksSaved).unwrap();
        store.upsert_job(&job).unwrap();

        // Fresh engine, as after restart.
        let engine = engine_with(store.clone(), embedder.clone(), vectors.clone());
        let scheduled = engine.recover().unwrap();
        assert_eq!(scheduled, 1);

        let job = wait_for_status(&engine, &doc_id, SyncStatus::Synced).await;
        assert_eq!(job.progress, 100);
        assert_eq!(store.chunks_by_doc(&doc_id).unwrap().len(), 1, "no duplicate chunks");
        assert_eq!(embedder.calls().len(), 1, "split must be skipped");
        assert!(vectors.contains(&point_id(&doc_id, 0)));
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        // Two transient failures, then success; category maps to the
        // config-default strategy (max_retries 3, base 10ms, no jitter).
        let embedder = Arc::new(ScriptedEmbedder::scripted(
            DIM,
            vec![
                EmbedOutcome::Transient("connection refused".to_string()),
                EmbedOutcome::Transient("connection refused".to_string()),
                EmbedOutcome::Ok,
            ],
        ));
        let vectors = Arc::new(MemoryVectorIndex::new(DIM));
        let engine = engine_with(store.clone(), embedder.clone(), vectors.clone());

        let doc_id = seed_document(&store, "col-1", "a.md", "# H\n\nalpha beta.");
        engine.trigger_sync(&doc_id).unwrap();
        let job = wait_for_status(&engine, &doc_id, SyncStatus::Synced).await;

        assert_eq!(job.retries, 2);
        assert_eq!(embedder.calls().len(), 3);
        assert!(vectors.contains(&point_id(&doc_id, 0)));
        let doc = store.document(&doc_id).unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Completed);
    }

    #[tokio::test]
    async fn permanent_failure_terminates_without_retries() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let embedder = Arc::new(ScriptedEmbedder::scripted(
            DIM,
            vec![EmbedOutcome::Permanent("bad request".to_string())],
        ));
        let vectors = Arc::new(MemoryVectorIndex::new(DIM));
        let engine = engine_with(store.clone(), embedder.clone(), vectors.clone());

        let doc_id = seed_document(&store, "col-1", "a.md", "# H\n\nalpha beta.");
        engine.trigger_sync(&doc_id).unwrap();
        let job = wait_for_status(&engine, &doc_id, SyncStatus::Dead).await;

        assert_eq!(job.retries, 0);
        assert_eq!(engine.pending_retries(), 0);
        assert_eq!(embedder.calls().len(), 1);

        let doc = store.document(&doc_id).unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
    }

    #[tokio::test]
    async fn exhausted_retries_lead_to_dead() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let embedder = Arc::new(ScriptedEmbedder::scripted(
            DIM,
            vec![
                EmbedOutcome::Transient("down".to_string()),
                EmbedOutcome::Transient("down".to_string()),
                EmbedOutcome::Transient("down".to_string()),
                EmbedOutcome::Transient("down".to_string()),
                EmbedOutcome::Transient("down".to_string()),
            ],
        ));
        let vectors = Arc::new(MemoryVectorIndex::new(DIM));
        let engine = engine_with(store.clone(), embedder.clone(), vectors.clone());

        let doc_id = seed_document(&store, "col-1", "a.md", "# H\n\nalpha beta.");
        engine.trigger_sync(&doc_id).unwrap();
        let job = wait_for_status(&engine, &doc_id, SyncStatus::Dead).await;

        // max_retries is 3: attempts at retries 0,1,2,3 then dead.
        assert_eq!(job.retries, 3);
        let doc = store.document(&doc_id).unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
    }

    #[tokio::test]
    async fn recovery_marks_permanent_failures_dead() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let embedder = Arc::new(ScriptedEmbedder::always_ok(DIM));
        let vectors = Arc::new(MemoryVectorIndex::new(DIM));

        let doc_id = seed_document(&store, "col-1", "a.md", "body");
        let mut job = SyncJob::new(&doc_id);
        job.apply(SyncEvent::Error).unwrap();
        job.error = Some("bad auth".to_string());
        job.error_category = Some(ErrorCategory::Auth);
        store.upsert_job(&job).unwrap();

        let engine = engine_with(store.clone(), embedder, vectors);
        engine.recover().unwrap();

        let job = store.job_by_doc(&doc_id).unwrap().unwrap();
        assert_eq!(job.status, SyncStatus::Dead);
        let doc = store.document(&doc_id).unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
    }

    #[tokio::test]
    async fn cancel_removes_pending_retry() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let embedder = Arc::new(ScriptedEmbedder::scripted(
            DIM,
            vec![EmbedOutcome::Transient("down".to_string())],
        ));
        let vectors = Arc::new(MemoryVectorIndex::new(DIM));
        let mut config = sync_config();
        config.default_retry.base_delay_ms = 5_000;
        let engine = SyncEngine::new(
            store.clone(),
            vectors,
            embedder,
            chunker(),
            config,
            Duration::from_secs(30),
        );

        let doc_id = seed_document(&store, "col-1", "a.md", "# H\n\nalpha.");
        engine.trigger_sync(&doc_id).unwrap();
        wait_for_status(&engine, &doc_id, SyncStatus::Retrying).await;
        assert_eq!(engine.pending_retries(), 1);

        assert!(engine.cancel(&doc_id));
        assert_eq!(engine.pending_retries(), 0);
    }

    #[tokio::test]
    async fn cleanup_evicts_terminal_cache_entries() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let embedder = Arc::new(ScriptedEmbedder::always_ok(DIM));
        let vectors = Arc::new(MemoryVectorIndex::new(DIM));
        let engine = engine_with(store.clone(), embedder, vectors);

        let doc_id = seed_document(&store, "col-1", "a.md", "# H\n\nalpha.");
        engine.trigger_sync(&doc_id).unwrap();
        wait_for_status(&engine, &doc_id, SyncStatus::Synced).await;

        // Entries newer than the threshold survive.
        engine.cleanup(1).unwrap();
        assert!(engine.inner.jobs.contains_key(&doc_id));

        // A zero-hour threshold evicts every terminal entry.
        tokio::time::sleep(Duration::from_millis(5)).await;
        engine.cleanup(0).unwrap();
        assert!(!engine.inner.jobs.contains_key(&doc_id));
    }

    #[tokio::test]
    async fn active_count_stays_within_worker_bound() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let embedder = Arc::new(ScriptedEmbedder::always_ok_with_delay(
            DIM,
            Duration::from_millis(60),
        ));
        let vectors = Arc::new(MemoryVectorIndex::new(DIM));
        let mut config = sync_config();
        config.max_parallel_docs = 2;
        let engine = SyncEngine::new(
            store.clone(),
            vectors,
            embedder,
            chunker(),
            config,
            Duration::from_secs(30),
        );

        let doc_ids: Vec<String> = (0..5)
            .map(|i| {
                seed_document(
                    &store,
                    "col-1",
                    &format!("doc-{}.md", i),
                    &format!("# H\n\ncontent number {} with words.", i),
                )
            })
            .collect();
        for doc_id in &doc_ids {
            engine.trigger_sync(doc_id).unwrap();
        }

        for _ in 0..40 {
            assert!(engine.active_count() <= 2);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for doc_id in &doc_ids {
            wait_for_status(&engine, doc_id, SyncStatus::Synced).await;
        }
    }
}
