use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::chunking::ChunkStrategy;
use crate::ratelimit::{TierConfig, TierScope};
use crate::sync::classifier::RetryStrategy;
use crate::vector::Metric;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub vector: VectorConfig,
    pub embedding: EmbeddingConfig,
    pub sync: SyncConfig,
    pub chunking: ChunkingConfig,
    pub search: SearchConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path. Journaling (WAL), synchronous=NORMAL and
    /// foreign-key enforcement are fixed pragmas, not options.
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    pub url: String,
    /// Physical vector collection name. Logical collections share it and are
    /// isolated through a payload filter.
    pub collection: String,
    pub vector_size: usize,
    pub metric: Metric,
    pub timeout_ms: u64,
    /// Points per upsert request; larger batches are split.
    pub upsert_batch: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    /// Inputs per remote call.
    pub batch_size: usize,
    pub dimension: usize,
    pub timeout_ms: u64,
    /// Concurrently issued batches within one `embed` call.
    pub max_in_flight: usize,
    /// In-call retries on 429/5xx before surfacing a transient error.
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub max_parallel_docs: usize,
    /// Fallback strategy for temporary error categories without a table
    /// entry of their own.
    pub default_retry: RetryStrategy,
    pub cleanup_after_hours: u64,
    pub job_retention_days: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub strategy: ChunkStrategy,
    pub max_chunk_size: usize,
    pub overlap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub default_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub tiers: Vec<TierConfig>,
}

impl EngineConfig {
    /// Load config from a JSON file, validating before returning.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file: {}", e))?;
        let config: Self =
            serde_json::from_str(&content).map_err(|e| format!("failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.embedding.dimension == 0 {
            return Err("embedding.dimension must be > 0".into());
        }
        if self.embedding.batch_size == 0 {
            return Err("embedding.batch_size must be > 0".into());
        }
        if self.embedding.max_in_flight == 0 {
            return Err("embedding.max_in_flight must be > 0".into());
        }
        if self.vector.vector_size != self.embedding.dimension {
            return Err("vector.vector_size must equal embedding.dimension".into());
        }
        if self.vector.upsert_batch == 0 {
            return Err("vector.upsert_batch must be > 0".into());
        }
        if self.chunking.max_chunk_size < 50 {
            return Err("chunking.max_chunk_size must be >= 50".into());
        }
        if self.chunking.overlap >= self.chunking.max_chunk_size {
            return Err("chunking.overlap must be < max_chunk_size".into());
        }
        if self.sync.max_parallel_docs == 0 {
            return Err("sync.max_parallel_docs must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.sync.default_retry.jitter) {
            return Err("sync.default_retry.jitter must be in [0.0, 1.0]".into());
        }
        if self.search.default_limit == 0 {
            return Err("search.default_limit must be > 0".into());
        }
        for tier in &self.rate_limit.tiers {
            if tier.enabled && tier.refill_per_sec <= 0.0 {
                return Err(format!("rate_limit tier '{}' needs refill_per_sec > 0", tier.name));
            }
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("docsift.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6333".to_string(),
            collection: "docsift".to_string(),
            vector_size: 1536,
            metric: Metric::Cosine,
            timeout_ms: 30_000,
            upsert_batch: 256,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "text-embedding-3-small".to_string(),
            batch_size: 200,
            dimension: 1536,
            timeout_ms: 30_000,
            max_in_flight: 4,
            max_retries: 3,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_parallel_docs: 4,
            default_retry: RetryStrategy {
                max_retries: 5,
                base_delay_ms: 1_000,
                max_delay_ms: 60_000,
                factor: 2.0,
                jitter: 0.2,
            },
            cleanup_after_hours: 24,
            job_retention_days: 14,
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkStrategy::ByHeadings,
            max_chunk_size: 1000,
            overlap: 100,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self { default_limit: 10 }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                TierConfig {
                    name: "global".to_string(),
                    scope: TierScope::Global,
                    max_tokens: 200.0,
                    refill_per_sec: 50.0,
                    whitelist: Vec::new(),
                    priority: 0,
                    enabled: true,
                },
                TierConfig {
                    name: "ip".to_string(),
                    scope: TierScope::PerIp,
                    max_tokens: 60.0,
                    refill_per_sec: 10.0,
                    whitelist: Vec::new(),
                    priority: 1,
                    enabled: true,
                },
                TierConfig {
                    name: "search".to_string(),
                    scope: TierScope::EndpointClass,
                    max_tokens: 30.0,
                    refill_per_sec: 10.0,
                    whitelist: Vec::new(),
                    priority: 2,
                    enabled: true,
                },
                TierConfig {
                    name: "upload".to_string(),
                    scope: TierScope::EndpointClass,
                    max_tokens: 10.0,
                    refill_per_sec: 2.0,
                    whitelist: Vec::new(),
                    priority: 2,
                    enabled: true,
                },
                TierConfig {
                    name: "default".to_string(),
                    scope: TierScope::EndpointClass,
                    max_tokens: 60.0,
                    refill_per_sec: 20.0,
                    whitelist: Vec::new(),
                    priority: 2,
                    enabled: true,
                },
            ],
        }
    }
}
