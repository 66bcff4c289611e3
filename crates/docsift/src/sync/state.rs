//! Sync job lifecycle: states, events and the legal transition table.
//!
//! The job row in SQLite is the source of truth; the in-memory copy is a
//! read-through cache. Only the transitions listed in `next_status` are
//! permitted; everything else is a wiring bug surfaced as an error.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::classifier::{ErrorCategory, RetryStrategy};
use crate::types::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    New,
    SplitOk,
    EmbedOk,
    Synced,
    Failed,
    Retrying,
    Dead,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::SplitOk => "SPLIT_OK",
            Self::EmbedOk => "EMBED_OK",
            Self::Synced => "SYNCED",
            Self::Failed => "FAILED",
            Self::Retrying => "RETRYING",
            Self::Dead => "DEAD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(Self::New),
            "SPLIT_OK" => Some(Self::SplitOk),
            "EMBED_OK" => Some(Self::EmbedOk),
            "SYNCED" => Some(Self::Synced),
            "FAILED" => Some(Self::Failed),
            "RETRYING" => Some(Self::Retrying),
            "DEAD" => Some(Self::Dead),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Synced | Self::Dead)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    ChunksSaved,
    VectorsInserted,
    MetaUpdated,
    Error,
    Retry,
    RetriesExceeded,
}

#[derive(Debug, thiserror::Error)]
#[error("illegal sync transition: {from:?} on {event:?}")]
pub struct TransitionError {
    pub from: SyncStatus,
    pub event: SyncEvent,
}

/// The transition table. `MetaUpdated` from NEW/RETRYING covers the
/// empty-document short circuit (nothing to split or embed).
pub fn next_status(from: SyncStatus, event: SyncEvent) -> Result<SyncStatus, TransitionError> {
    use SyncEvent::*;
    use SyncStatus::*;

    let to = match (from, event) {
        (New, ChunksSaved) | (Retrying, ChunksSaved) => SplitOk,
        (SplitOk, VectorsInserted) | (Retrying, VectorsInserted) => EmbedOk,
        (EmbedOk, MetaUpdated) | (Retrying, MetaUpdated) | (New, MetaUpdated) => Synced,
        (New, Error) | (SplitOk, Error) | (EmbedOk, Error) | (Retrying, Error)
        | (Failed, Error) => Failed,
        (Failed, Retry) => Retrying,
        (Failed, RetriesExceeded) => Dead,
        _ => return Err(TransitionError { from, event }),
    };
    Ok(to)
}

/// Durable record of a document's ingestion lifecycle; one per document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: String,
    pub doc_id: String,
    pub status: SyncStatus,
    pub retries: u32,
    pub last_attempt_at: Option<i64>,
    pub error: Option<String>,
    pub error_category: Option<ErrorCategory>,
    pub last_retry_strategy: Option<RetryStrategy>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub duration_ms: Option<i64>,
    /// 0..=100; 100 exactly when SYNCED.
    pub progress: u8,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SyncJob {
    pub fn new(doc_id: &str) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4().to_string(),
            doc_id: doc_id.to_string(),
            status: SyncStatus::New,
            retries: 0,
            last_attempt_at: None,
            error: None,
            error_category: None,
            last_retry_strategy: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            progress: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply an event, updating status and bookkeeping. Retries increment on
    /// the FAILED -> RETRYING edge.
    pub fn apply(&mut self, event: SyncEvent) -> Result<SyncStatus, TransitionError> {
        let to = next_status(self.status, event)?;
        if event == SyncEvent::Retry {
            self.retries += 1;
        }
        self.status = to;
        self.progress = match to {
            SyncStatus::New => 0,
            SyncStatus::SplitOk => 40,
            SyncStatus::EmbedOk => 80,
            SyncStatus::Synced => 100,
            // Keep whatever progress the last forward step reached.
            SyncStatus::Failed | SyncStatus::Retrying | SyncStatus::Dead => self.progress,
        };
        self.updated_at = now_ms();
        Ok(to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_path_reaches_synced() {
        let mut job = SyncJob::new("d1");
        job.apply(SyncEvent::ChunksSaved).unwrap();
        assert_eq!(job.status, SyncStatus::SplitOk);
        job.apply(SyncEvent::VectorsInserted).unwrap();
        assert_eq!(job.status, SyncStatus::EmbedOk);
        job.apply(SyncEvent::MetaUpdated).unwrap();
        assert_eq!(job.status, SyncStatus::Synced);
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn empty_document_short_circuit_is_legal() {
        assert_eq!(
            next_status(SyncStatus::New, SyncEvent::MetaUpdated).unwrap(),
            SyncStatus::Synced
        );
        assert_eq!(
            next_status(SyncStatus::Retrying, SyncEvent::MetaUpdated).unwrap(),
            SyncStatus::Synced
        );
    }

    #[test]
    fn retry_edge_increments_retries() {
        let mut job = SyncJob::new("d1");
        job.apply(SyncEvent::Error).unwrap();
        assert_eq!(job.status, SyncStatus::Failed);
        job.apply(SyncEvent::Retry).unwrap();
        assert_eq!(job.status, SyncStatus::Retrying);
        assert_eq!(job.retries, 1);
        job.apply(SyncEvent::Error).unwrap();
        job.apply(SyncEvent::Retry).unwrap();
        assert_eq!(job.retries, 2);
    }

    #[test]
    fn exceeded_retries_lead_to_dead() {
        let mut job = SyncJob::new("d1");
        job.apply(SyncEvent::Error).unwrap();
        job.apply(SyncEvent::RetriesExceeded).unwrap();
        assert_eq!(job.status, SyncStatus::Dead);
        assert!(job.status.is_terminal());
    }

    #[test]
    fn terminal_states_reject_all_events() {
        for terminal in [SyncStatus::Synced, SyncStatus::Dead] {
            for event in [
                SyncEvent::ChunksSaved,
                SyncEvent::VectorsInserted,
                SyncEvent::MetaUpdated,
                SyncEvent::Error,
                SyncEvent::Retry,
                SyncEvent::RetriesExceeded,
            ] {
                assert!(next_status(terminal, event).is_err());
            }
        }
    }

    #[test]
    fn retrying_resumes_at_any_forward_step() {
        assert_eq!(
            next_status(SyncStatus::Retrying, SyncEvent::ChunksSaved).unwrap(),
            SyncStatus::SplitOk
        );
        assert_eq!(
            next_status(SyncStatus::Retrying, SyncEvent::VectorsInserted).unwrap(),
            SyncStatus::EmbedOk
        );
    }

    #[test]
    fn status_strings_round_trip() {
        for s in [
            SyncStatus::New,
            SyncStatus::SplitOk,
            SyncStatus::EmbedOk,
            SyncStatus::Synced,
            SyncStatus::Failed,
            SyncStatus::Retrying,
            SyncStatus::Dead,
        ] {
            assert_eq!(SyncStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(SyncStatus::parse("bogus"), None);
    }
}
