//! Relational + full-text store.
//!
//! SQLite with an FTS5 external-content index over chunks, kept in sync by
//! triggers. All multi-row writes go through `run_in_tx`.

use thiserror::Error;

pub mod sqlite;

pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database busy: {0}")]
    Busy(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A stored value failed to parse (unknown status string, bad JSON).
    #[error("invalid stored data: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Sqlite(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(f, _) => match f.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    Self::Busy(e.to_string())
                }
                rusqlite::ErrorCode::ConstraintViolation => Self::Constraint(e.to_string()),
                _ => Self::Sqlite(e.to_string()),
            },
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound("row".to_string()),
            _ => Self::Sqlite(e.to_string()),
        }
    }
}

/// One keyword hit: FTS5 bm25 rank, lower is better.
#[derive(Debug, Clone, PartialEq)]
pub struct FtsHit {
    pub point_id: String,
    pub rank: f64,
    pub chunk_index: u32,
}

/// Row counts removed by a collection cascade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionCascade {
    pub documents: usize,
    pub chunks: usize,
    pub jobs: usize,
}
