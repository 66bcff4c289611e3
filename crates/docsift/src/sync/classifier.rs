//! Error classification and retry strategy selection.
//!
//! Every error raised inside a sync step is mapped to a category; temporary
//! categories get a bounded, jittered exponential backoff, permanent ones
//! terminate the job.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::embedding::EmbeddingError;
use crate::error::EngineError;
use crate::store::StoreError;
use crate::vector::VectorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Network,
    Timeout,
    RateLimit,
    Server5xx,
    Validation,
    Auth,
    NotFound,
    DbConstraint,
    DbBusy,
    DependencyUnavailable,
    Unknown,
}

impl ErrorCategory {
    /// Temporary categories may succeed on retry without operator
    /// intervention; everything else is permanent.
    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            Self::Network
                | Self::Timeout
                | Self::RateLimit
                | Self::Server5xx
                | Self::DbBusy
                | Self::DependencyUnavailable
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "NETWORK",
            Self::Timeout => "TIMEOUT",
            Self::RateLimit => "RATE_LIMIT",
            Self::Server5xx => "SERVER_5XX",
            Self::Validation => "VALIDATION",
            Self::Auth => "AUTH",
            Self::NotFound => "NOT_FOUND",
            Self::DbConstraint => "DB_CONSTRAINT",
            Self::DbBusy => "DB_BUSY",
            Self::DependencyUnavailable => "DEPENDENCY_UNAVAILABLE",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NETWORK" => Some(Self::Network),
            "TIMEOUT" => Some(Self::Timeout),
            "RATE_LIMIT" => Some(Self::RateLimit),
            "SERVER_5XX" => Some(Self::Server5xx),
            "VALIDATION" => Some(Self::Validation),
            "AUTH" => Some(Self::Auth),
            "NOT_FOUND" => Some(Self::NotFound),
            "DB_CONSTRAINT" => Some(Self::DbConstraint),
            "DB_BUSY" => Some(Self::DbBusy),
            "DEPENDENCY_UNAVAILABLE" => Some(Self::DependencyUnavailable),
            "UNKNOWN" => Some(Self::Unknown),
            _ => None,
        }
    }
}

pub fn classify(err: &EngineError) -> ErrorCategory {
    match err {
        EngineError::Validation(_) => ErrorCategory::Validation,
        EngineError::NotFound(_) => ErrorCategory::NotFound,
        EngineError::Conflict(_) => ErrorCategory::DbConstraint,
        EngineError::RateLimited { .. } => ErrorCategory::RateLimit,
        EngineError::Timeout(_) => ErrorCategory::Timeout,
        EngineError::Internal(_) => ErrorCategory::Unknown,
        EngineError::Embedding(e) => match e {
            EmbeddingError::Network(_) => ErrorCategory::Network,
            EmbeddingError::Unavailable(_) => ErrorCategory::DependencyUnavailable,
            EmbeddingError::Timeout(_) => ErrorCategory::Timeout,
            EmbeddingError::RateLimited(_) => ErrorCategory::RateLimit,
            EmbeddingError::Server { .. } => ErrorCategory::Server5xx,
            EmbeddingError::Permanent { status, .. } => permanent_http_category(*status),
        },
        EngineError::Vector(e) => match e {
            VectorError::Network(_) => ErrorCategory::Network,
            VectorError::Unavailable(_) => ErrorCategory::DependencyUnavailable,
            VectorError::Timeout(_) => ErrorCategory::Timeout,
            VectorError::RateLimited(_) => ErrorCategory::RateLimit,
            VectorError::Server { .. } => ErrorCategory::Server5xx,
            VectorError::DimensionMismatch { .. } => ErrorCategory::Validation,
            VectorError::Permanent { status, .. } => permanent_http_category(*status),
        },
        EngineError::Store(e) => match e {
            StoreError::Busy(_) => ErrorCategory::DbBusy,
            StoreError::Constraint(_) => ErrorCategory::DbConstraint,
            StoreError::NotFound(_) => ErrorCategory::NotFound,
            StoreError::Corrupt(_) | StoreError::Sqlite(_) => ErrorCategory::Unknown,
        },
    }
}

fn permanent_http_category(status: Option<u16>) -> ErrorCategory {
    match status {
        Some(401) | Some(403) => ErrorCategory::Auth,
        Some(404) => ErrorCategory::NotFound,
        _ => ErrorCategory::Validation,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryStrategy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
    /// Relative jitter in [0, 1]; the delay is scaled by (1 ± rand * jitter).
    pub jitter: f64,
}

impl RetryStrategy {
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: 0,
            max_delay_ms: 0,
            factor: 1.0,
            jitter: 0.0,
        }
    }

    /// Delay for 1-indexed attempt `k`: min(max, base * factor^(k-1)),
    /// scaled by the jitter band.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.saturating_sub(1) as i32);
        let raw = (self.base_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        let scaled = if self.jitter > 0.0 {
            let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            raw * factor
        } else {
            raw
        };
        Duration::from_millis(scaled.max(0.0) as u64)
    }
}

/// Per-category strategy table. `fallback` covers temporary categories
/// without an entry of their own (config `sync.default_retry`).
pub fn strategy_for(category: ErrorCategory, fallback: &RetryStrategy) -> RetryStrategy {
    match category {
        ErrorCategory::Network | ErrorCategory::Timeout => RetryStrategy {
            max_retries: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            factor: 2.0,
            jitter: 0.2,
        },
        ErrorCategory::RateLimit => RetryStrategy {
            max_retries: 8,
            base_delay_ms: 2_000,
            max_delay_ms: 120_000,
            factor: 2.0,
            jitter: 0.3,
        },
        ErrorCategory::Server5xx => RetryStrategy {
            max_retries: 4,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
            factor: 2.0,
            jitter: 0.2,
        },
        ErrorCategory::DbBusy => RetryStrategy {
            max_retries: 10,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
            factor: 2.0,
            jitter: 0.1,
        },
        ErrorCategory::DependencyUnavailable => *fallback,
        _ => RetryStrategy::none(),
    }
}
