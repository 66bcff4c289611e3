//! SQLite-backed store: collections, documents, chunks, chunk metadata and
//! sync jobs, plus the FTS5 index maintained by triggers.

use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction,
    TransactionBehavior};

use super::{CollectionCascade, FtsHit, StoreError};
use crate::sync::classifier::ErrorCategory;
use crate::sync::state::{SyncJob, SyncStatus};
use crate::types::{now_ms, Chunk, ChunkMeta, Collection, Document, DocumentStatus};

/// Point-id batch size for IN-list queries, keeps statements bounded.
const ID_BATCH: usize = 200;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS collections (
  collection_id TEXT PRIMARY KEY,
  name          TEXT NOT NULL UNIQUE,
  description   TEXT,
  created_at    INTEGER NOT NULL,
  updated_at    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS docs (
  doc_id        TEXT PRIMARY KEY,
  collection_id TEXT NOT NULL REFERENCES collections(collection_id),
  key           TEXT NOT NULL,
  name          TEXT,
  mime          TEXT,
  size_bytes    INTEGER,
  content       TEXT NOT NULL,
  content_hash  TEXT NOT NULL,
  status        TEXT NOT NULL DEFAULT 'new',
  created_at    INTEGER NOT NULL,
  updated_at    INTEGER NOT NULL,
  is_deleted    INTEGER NOT NULL DEFAULT 0
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_docs_collection_key
  ON docs(collection_id, key) WHERE is_deleted = 0;
CREATE INDEX IF NOT EXISTS idx_docs_collection ON docs(collection_id);

CREATE TABLE IF NOT EXISTS chunks (
  point_id      TEXT PRIMARY KEY,
  doc_id        TEXT NOT NULL REFERENCES docs(doc_id),
  collection_id TEXT NOT NULL REFERENCES collections(collection_id),
  chunk_index   INTEGER NOT NULL,
  title         TEXT,
  content       TEXT NOT NULL,
  UNIQUE (doc_id, chunk_index)
);

CREATE INDEX IF NOT EXISTS idx_chunks_doc ON chunks(doc_id);
CREATE INDEX IF NOT EXISTS idx_chunks_collection ON chunks(collection_id);

CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
  content, title,
  content='chunks', content_rowid='rowid'
);

CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
  INSERT INTO chunks_fts(rowid, content, title)
  VALUES (new.rowid, new.content, new.title);
END;

CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
  INSERT INTO chunks_fts(chunks_fts, rowid, content, title)
  VALUES ('delete', old.rowid, old.content, old.title);
END;

CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE ON chunks BEGIN
  INSERT INTO chunks_fts(chunks_fts, rowid, content, title)
  VALUES ('delete', old.rowid, old.content, old.title);
  INSERT INTO chunks_fts(rowid, content, title)
  VALUES (new.rowid, new.content, new.title);
END;

CREATE TABLE IF NOT EXISTS chunk_meta (
  point_id      TEXT PRIMARY KEY REFERENCES chunks(point_id),
  doc_id        TEXT NOT NULL,
  collection_id TEXT NOT NULL,
  chunk_index   INTEGER NOT NULL,
  title_chain   TEXT,
  content_hash  TEXT NOT NULL,
  created_at    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_jobs (
  id                  TEXT PRIMARY KEY,
  doc_id              TEXT NOT NULL UNIQUE REFERENCES docs(doc_id),
  status              TEXT NOT NULL,
  retries             INTEGER NOT NULL DEFAULT 0,
  last_attempt_at     INTEGER,
  error               TEXT,
  error_category      TEXT,
  last_retry_strategy TEXT,
  started_at          INTEGER,
  completed_at        INTEGER,
  duration_ms         INTEGER,
  progress            INTEGER NOT NULL DEFAULT 0,
  created_at          INTEGER NOT NULL,
  updated_at          INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON sync_jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_updated ON sync_jobs(updated_at);
"#;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path, busy_timeout_ms: u64) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn, busy_timeout_ms)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, 5_000)
    }

    fn init(conn: Connection, busy_timeout_ms: u64) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\n\
             PRAGMA synchronous=NORMAL;\n\
             PRAGMA foreign_keys=ON;",
        )?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` inside an IMMEDIATE transaction; any error rolls back.
    pub fn run_in_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // ── Collections ────────────────────────────────────────────────────────

    pub fn insert_collection(&self, collection: &Collection) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO collections (collection_id, name, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                collection.collection_id,
                collection.name,
                collection.description,
                collection.created_at,
                collection.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn collection(&self, collection_id: &str) -> Result<Option<Collection>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT collection_id, name, description, created_at, updated_at
                 FROM collections WHERE collection_id = ?1",
                params![collection_id],
                row_to_collection,
            )
            .optional()?;
        Ok(row)
    }

    pub fn collection_by_name(&self, name: &str) -> Result<Option<Collection>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT collection_id, name, description, created_at, updated_at
                 FROM collections WHERE name = ?1",
                params![name],
                row_to_collection,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_collections(&self) -> Result<Vec<Collection>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT collection_id, name, description, created_at, updated_at
             FROM collections ORDER BY name",
        )?;
        let rows = stmt
            .query_map([], row_to_collection)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Cascade-remove a collection: chunk metadata, chunks (the FTS index
    /// follows via triggers), sync jobs, documents and the collection row,
    /// all in one transaction.
    pub fn delete_collection(
        &self,
        collection_id: &str,
    ) -> Result<CollectionCascade, StoreError> {
        self.run_in_tx(|tx| {
            tx.execute(
                "DELETE FROM chunk_meta WHERE collection_id = ?1",
                params![collection_id],
            )?;
            let chunks = tx.execute(
                "DELETE FROM chunks WHERE collection_id = ?1",
                params![collection_id],
            )?;
            let jobs = tx.execute(
                "DELETE FROM sync_jobs WHERE doc_id IN
                   (SELECT doc_id FROM docs WHERE collection_id = ?1)",
                params![collection_id],
            )?;
            let documents = tx.execute(
                "DELETE FROM docs WHERE collection_id = ?1",
                params![collection_id],
            )?;
            let removed = tx.execute(
                "DELETE FROM collections WHERE collection_id = ?1",
                params![collection_id],
            )?;
            if removed == 0 {
                return Err(StoreError::NotFound(format!(
                    "collection {}",
                    collection_id
                )));
            }
            Ok(CollectionCascade {
                documents,
                chunks,
                jobs,
            })
        })
    }

    // ── Documents ──────────────────────────────────────────────────────────

    pub fn create_document(&self, doc: &Document, content: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        insert_document(&conn, doc, content)
    }

    /// Replace a document whose content changed: the old doc's chunks,
    /// metadata, job and row are removed and the new row inserted, atomically.
    /// A tombstone already holding the new doc id is purged so revived
    /// content can reclaim it.
    pub fn replace_document(
        &self,
        old_doc_id: &str,
        doc: &Document,
        content: &str,
    ) -> Result<(), StoreError> {
        self.run_in_tx(|tx| {
            delete_doc_rows(tx, old_doc_id)?;
            tx.execute("DELETE FROM docs WHERE doc_id = ?1", params![old_doc_id])?;
            tx.execute(
                "DELETE FROM docs WHERE doc_id = ?1 AND is_deleted = 1",
                params![doc.doc_id],
            )?;
            insert_document(tx, doc, content)
        })
    }

    pub fn document(&self, doc_id: &str) -> Result<Option<Document>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM docs WHERE doc_id = ?1", DOC_COLUMNS),
                params![doc_id],
                row_to_document,
            )
            .optional()?;
        Ok(row)
    }

    /// Live (non-tombstoned) document under `(collection, key)`.
    pub fn document_by_key(
        &self,
        collection_id: &str,
        key: &str,
    ) -> Result<Option<Document>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM docs
                     WHERE collection_id = ?1 AND key = ?2 AND is_deleted = 0",
                    DOC_COLUMNS
                ),
                params![collection_id, key],
                row_to_document,
            )
            .optional()?;
        Ok(row)
    }

    /// The large content column, loaded lazily on demand.
    pub fn document_content(&self, doc_id: &str) -> Result<String, StoreError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT content FROM docs WHERE doc_id = ?1",
            params![doc_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("document {}", doc_id)))
    }

    pub fn list_documents(&self, collection_id: &str) -> Result<Vec<Document>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM docs
             WHERE collection_id = ?1 AND is_deleted = 0 ORDER BY key",
            DOC_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![collection_id], row_to_document)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn document_ids_in_collection(
        &self,
        collection_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT doc_id FROM docs WHERE collection_id = ?1")?;
        let rows = stmt
            .query_map(params![collection_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Same-hash re-import: only the descriptive fields change.
    pub fn touch_document_metadata(
        &self,
        doc_id: &str,
        name: Option<&str>,
        mime: Option<&str>,
        size_bytes: Option<i64>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE docs SET name = ?2, mime = ?3, size_bytes = ?4, updated_at = ?5
             WHERE doc_id = ?1",
            params![doc_id, name, mime, size_bytes, now_ms()],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("document {}", doc_id)));
        }
        Ok(())
    }

    pub fn set_document_status(
        &self,
        doc_id: &str,
        status: DocumentStatus,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE docs SET status = ?2, updated_at = ?3 WHERE doc_id = ?1",
            params![doc_id, status.as_str(), now_ms()],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("document {}", doc_id)));
        }
        Ok(())
    }

    /// Tombstone a document and drop its dependent rows. The row itself stays
    /// (`is_deleted = 1`) so the key can be reused by a later import.
    pub fn delete_document(&self, doc_id: &str) -> Result<(), StoreError> {
        self.run_in_tx(|tx| {
            delete_doc_rows(tx, doc_id)?;
            let updated = tx.execute(
                "UPDATE docs SET is_deleted = 1, status = 'deleted', updated_at = ?2
                 WHERE doc_id = ?1",
                params![doc_id, now_ms()],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("document {}", doc_id)));
            }
            Ok(())
        })
    }

    // ── Chunks ─────────────────────────────────────────────────────────────

    /// Swap a document's chunks and metadata in one transaction. The FTS
    /// index follows through the delete/insert triggers.
    pub fn replace_chunks(
        &self,
        doc_id: &str,
        chunks: &[Chunk],
        metas: &[ChunkMeta],
    ) -> Result<(), StoreError> {
        self.run_in_tx(|tx| {
            tx.execute("DELETE FROM chunk_meta WHERE doc_id = ?1", params![doc_id])?;
            tx.execute("DELETE FROM chunks WHERE doc_id = ?1", params![doc_id])?;

            let mut insert_chunk = tx.prepare(
                "INSERT INTO chunks (point_id, doc_id, collection_id, chunk_index, title, content)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for chunk in chunks {
                insert_chunk.execute(params![
                    chunk.point_id,
                    chunk.doc_id,
                    chunk.collection_id,
                    chunk.chunk_index,
                    chunk.title,
                    chunk.content,
                ])?;
            }

            let mut insert_meta = tx.prepare(
                "INSERT INTO chunk_meta
                   (point_id, doc_id, collection_id, chunk_index, title_chain, content_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for meta in metas {
                insert_meta.execute(params![
                    meta.point_id,
                    meta.doc_id,
                    meta.collection_id,
                    meta.chunk_index,
                    meta.title_chain,
                    meta.content_hash,
                    meta.created_at,
                ])?;
            }
            Ok(())
        })
    }

    pub fn chunks_by_doc(&self, doc_id: &str) -> Result<Vec<Chunk>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT point_id, doc_id, collection_id, chunk_index, title, content
             FROM chunks WHERE doc_id = ?1 ORDER BY chunk_index",
        )?;
        let rows = stmt
            .query_map(params![doc_id], row_to_chunk)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn chunk_metas_by_doc(&self, doc_id: &str) -> Result<Vec<ChunkMeta>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT point_id, doc_id, collection_id, chunk_index, title_chain, content_hash, created_at
             FROM chunk_meta WHERE doc_id = ?1 ORDER BY chunk_index",
        )?;
        let rows = stmt
            .query_map(params![doc_id], row_to_chunk_meta)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Fetch chunks for the given point ids within a collection, ordered by
    /// `(doc_id, chunk_index)`. Unknown ids are silently absent.
    pub fn fetch_chunks_by_point_ids(
        &self,
        point_ids: &[String],
        collection_id: &str,
    ) -> Result<Vec<Chunk>, StoreError> {
        if point_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let mut out = Vec::with_capacity(point_ids.len());

        for batch in point_ids.chunks(ID_BATCH) {
            let placeholders = vec!["?"; batch.len()].join(", ");
            let sql = format!(
                "SELECT point_id, doc_id, collection_id, chunk_index, title, content
                 FROM chunks
                 WHERE collection_id = ? AND point_id IN ({})
                 ORDER BY doc_id, chunk_index",
                placeholders
            );
            let mut stmt = conn.prepare(&sql)?;
            let params_iter =
                std::iter::once(collection_id.to_string()).chain(batch.iter().cloned());
            let rows = stmt
                .query_map(params_from_iter(params_iter), row_to_chunk)?
                .collect::<Result<Vec<_>, _>>()?;
            out.extend(rows);
        }
        Ok(out)
    }

    pub fn count_chunks(&self, collection_id: Option<&str>) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = match collection_id {
            Some(id) => conn.query_row(
                "SELECT COUNT(*) FROM chunks WHERE collection_id = ?1",
                params![id],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?,
        };
        Ok(count as u64)
    }

    pub fn count_documents(&self, collection_id: Option<&str>) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = match collection_id {
            Some(id) => conn.query_row(
                "SELECT COUNT(*) FROM docs WHERE collection_id = ?1 AND is_deleted = 0",
                params![id],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM docs WHERE is_deleted = 0",
                [],
                |row| row.get(0),
            )?,
        };
        Ok(count as u64)
    }

    // ── Full-text search ───────────────────────────────────────────────────

    /// bm25-ranked keyword search within a collection. The query is tokenized
    /// and each token quoted, so FTS5 syntax cannot be injected.
    pub fn fts_search(
        &self,
        query: &str,
        collection_id: &str,
        limit: usize,
    ) -> Result<Vec<FtsHit>, StoreError> {
        let expr = fts_match_expr(query);
        if expr.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT c.point_id, bm25(chunks_fts) AS rank, c.chunk_index
             FROM chunks_fts
             JOIN chunks c ON c.rowid = chunks_fts.rowid
             WHERE chunks_fts MATCH ?1 AND c.collection_id = ?2
             ORDER BY rank, c.chunk_index, c.point_id
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![expr, collection_id, limit as i64], |row| {
                Ok(FtsHit {
                    point_id: row.get(0)?,
                    rank: row.get(1)?,
                    chunk_index: row.get::<_, i64>(2)? as u32,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Sync jobs ──────────────────────────────────────────────────────────

    pub fn upsert_job(&self, job: &SyncJob) -> Result<(), StoreError> {
        let strategy_json = job
            .last_retry_strategy
            .as_ref()
            .map(|s| serde_json::to_string(s))
            .transpose()
            .map_err(|e| StoreError::Corrupt(format!("retry strategy encode: {}", e)))?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_jobs
               (id, doc_id, status, retries, last_attempt_at, error, error_category,
                last_retry_strategy, started_at, completed_at, duration_ms, progress,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(doc_id) DO UPDATE SET
               status = excluded.status,
               retries = excluded.retries,
               last_attempt_at = excluded.last_attempt_at,
               error = excluded.error,
               error_category = excluded.error_category,
               last_retry_strategy = excluded.last_retry_strategy,
               started_at = excluded.started_at,
               completed_at = excluded.completed_at,
               duration_ms = excluded.duration_ms,
               progress = excluded.progress,
               updated_at = excluded.updated_at",
            params![
                job.id,
                job.doc_id,
                job.status.as_str(),
                job.retries,
                job.last_attempt_at,
                job.error,
                job.error_category.map(|c| c.as_str()),
                strategy_json,
                job.started_at,
                job.completed_at,
                job.duration_ms,
                job.progress,
                job.created_at,
                job.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn job_by_doc(&self, doc_id: &str) -> Result<Option<SyncJob>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM sync_jobs WHERE doc_id = ?1", JOB_COLUMNS),
                params![doc_id],
                row_to_job_raw,
            )
            .optional()?;
        row.map(finish_job).transpose()
    }

    pub fn jobs_with_statuses(
        &self,
        statuses: &[SyncStatus],
    ) -> Result<Vec<SyncJob>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM sync_jobs WHERE status IN ({}) ORDER BY updated_at",
            JOB_COLUMNS, placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params_from_iter(statuses.iter().map(|s| s.as_str())),
                row_to_job_raw,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(finish_job).collect()
    }

    pub fn count_jobs_by_status(&self) -> Result<Vec<(SyncStatus, u64)>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM sync_jobs GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(status, count)| {
                SyncStatus::parse(&status)
                    .map(|s| (s, count as u64))
                    .ok_or_else(|| StoreError::Corrupt(format!("unknown job status {}", status)))
            })
            .collect()
    }

    /// Purge historical terminal jobs; returns rows removed.
    pub fn purge_terminal_jobs_older_than(&self, cutoff_ms: i64) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM sync_jobs
             WHERE status IN ('SYNCED', 'DEAD') AND updated_at < ?1",
            params![cutoff_ms],
        )?;
        Ok(removed)
    }
}

// ── Shared helpers (usable inside and outside transactions) ───────────────

fn insert_document(conn: &Connection, doc: &Document, content: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO docs
           (doc_id, collection_id, key, name, mime, size_bytes, content, content_hash,
            status, created_at, updated_at, is_deleted)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            doc.doc_id,
            doc.collection_id,
            doc.key,
            doc.name,
            doc.mime,
            doc.size_bytes,
            content,
            doc.content_hash,
            doc.status.as_str(),
            doc.created_at,
            doc.updated_at,
            doc.is_deleted as i64,
        ],
    )?;
    Ok(())
}

/// Remove a document's dependent rows (chunks, chunk metadata, sync job) but
/// not the document row itself.
fn delete_doc_rows(conn: &Connection, doc_id: &str) -> Result<(), StoreError> {
    conn.execute("DELETE FROM chunk_meta WHERE doc_id = ?1", params![doc_id])?;
    conn.execute("DELETE FROM chunks WHERE doc_id = ?1", params![doc_id])?;
    conn.execute("DELETE FROM sync_jobs WHERE doc_id = ?1", params![doc_id])?;
    Ok(())
}

/// Quote each whitespace token so user text can never be parsed as FTS5
/// operators; tokens are OR-ed for recall, bm25 still ranks tighter matches
/// first.
fn fts_match_expr(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

const DOC_COLUMNS: &str = "doc_id, collection_id, key, name, mime, size_bytes, content_hash, \
                           status, created_at, updated_at, is_deleted";

const JOB_COLUMNS: &str = "id, doc_id, status, retries, last_attempt_at, error, error_category, \
                           last_retry_strategy, started_at, completed_at, duration_ms, progress, \
                           created_at, updated_at";

fn row_to_collection(row: &rusqlite::Row<'_>) -> rusqlite::Result<Collection> {
    Ok(Collection {
        collection_id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    let status: String = row.get(7)?;
    Ok(Document {
        doc_id: row.get(0)?,
        collection_id: row.get(1)?,
        key: row.get(2)?,
        name: row.get(3)?,
        mime: row.get(4)?,
        size_bytes: row.get(5)?,
        content_hash: row.get(6)?,
        status: DocumentStatus::parse(&status).unwrap_or(DocumentStatus::New),
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        is_deleted: row.get::<_, i64>(10)? != 0,
    })
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chunk> {
    Ok(Chunk {
        point_id: row.get(0)?,
        doc_id: row.get(1)?,
        collection_id: row.get(2)?,
        chunk_index: row.get::<_, i64>(3)? as u32,
        title: row.get(4)?,
        content: row.get(5)?,
    })
}

fn row_to_chunk_meta(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkMeta> {
    Ok(ChunkMeta {
        point_id: row.get(0)?,
        doc_id: row.get(1)?,
        collection_id: row.get(2)?,
        chunk_index: row.get::<_, i64>(3)? as u32,
        title_chain: row.get(4)?,
        content_hash: row.get(5)?,
        created_at: row.get(6)?,
    })
}

/// Raw job row before status/category/strategy parsing.
struct RawJob {
    id: String,
    doc_id: String,
    status: String,
    retries: i64,
    last_attempt_at: Option<i64>,
    error: Option<String>,
    error_category: Option<String>,
    last_retry_strategy: Option<String>,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    duration_ms: Option<i64>,
    progress: i64,
    created_at: i64,
    updated_at: i64,
}

fn row_to_job_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawJob> {
    Ok(RawJob {
        id: row.get(0)?,
        doc_id: row.get(1)?,
        status: row.get(2)?,
        retries: row.get(3)?,
        last_attempt_at: row.get(4)?,
        error: row.get(5)?,
        error_category: row.get(6)?,
        last_retry_strategy: row.get(7)?,
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
        duration_ms: row.get(10)?,
        progress: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn finish_job(raw: RawJob) -> Result<SyncJob, StoreError> {
    let status = SyncStatus::parse(&raw.status)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown job status {}", raw.status)))?;
    let error_category = raw
        .error_category
        .as_deref()
        .map(|c| {
            ErrorCategory::parse(c)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown error category {}", c)))
        })
        .transpose()?;
    let last_retry_strategy = raw
        .last_retry_strategy
        .as_deref()
        .map(|s| {
            serde_json::from_str(s)
                .map_err(|e| StoreError::Corrupt(format!("retry strategy decode: {}", e)))
        })
        .transpose()?;

    Ok(SyncJob {
        id: raw.id,
        doc_id: raw.doc_id,
        status,
        retries: raw.retries as u32,
        last_attempt_at: raw.last_attempt_at,
        error: raw.error,
        error_category,
        last_retry_strategy,
        started_at: raw.started_at,
        completed_at: raw.completed_at,
        duration_ms: raw.duration_ms,
        progress: raw.progress as u8,
        created_at: raw.created_at,
        updated_at: raw.updated_at,
    })
}
