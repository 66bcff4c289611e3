//! OpenAI-compatible embedding client.
//!
//! Inputs are split into batches of `batch_size` per remote call; batches are
//! issued with bounded concurrency while preserving input order. 429 and 5xx
//! responses are retried in-call with exponential backoff and jitter; other
//! 4xx responses are permanent.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{EmbeddingError, EmbeddingProvider};
use crate::config::EmbeddingConfig;

const RETRY_BASE_DELAY_MS: u64 = 500;
const RETRY_MAX_DELAY_MS: u64 = 8_000;

pub struct HttpEmbeddingClient {
    http: Client,
    config: EmbeddingConfig,
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbeddingClient {
    pub fn new(config: EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| EmbeddingError::Permanent {
                status: None,
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self { http, config })
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let url = format!(
            "{}/embeddings",
            self.config.base_url.trim_end_matches('/')
        );

        let mut attempt: u32 = 0;
        loop {
            match self.send_once(&url, batch).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let delay = backoff_delay(attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "embedding batch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(&self, url: &str, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let request = EmbeddingsRequest {
            model: &self.config.model,
            input: batch,
        };

        let response = self
            .http
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| map_transport_error(&e, self.config.timeout_ms))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let preview: String = body.chars().take(300).collect();
            return Err(classify_status(status.as_u16(), preview));
        }

        let parsed: EmbeddingsResponse =
            response.json().await.map_err(|e| EmbeddingError::Permanent {
                status: None,
                message: format!("invalid embeddings response body: {}", e),
            })?;

        let mut data = parsed.data;
        // The index field is authoritative for ordering.
        data.sort_by_key(|d| d.index);

        if data.len() != batch.len() {
            return Err(EmbeddingError::Permanent {
                status: None,
                message: format!(
                    "embedding count mismatch: sent {} inputs, got {} vectors",
                    batch.len(),
                    data.len()
                ),
            });
        }
        for item in &data {
            if item.embedding.len() != self.config.dimension {
                return Err(EmbeddingError::Permanent {
                    status: None,
                    message: format!(
                        "embedding dimension mismatch: expected {}, got {}",
                        self.config.dimension,
                        item.embedding.len()
                    ),
                });
            }
        }

        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let batches: Vec<&[String]> = texts.chunks(self.config.batch_size).collect();
        let batch_count = batches.len();

        // `buffered` preserves submission order, so flattening keeps vectors
        // aligned with the input texts.
        let futures: Vec<_> = batches
            .into_iter()
            .map(|batch| self.embed_batch(batch))
            .collect();
        let results: Vec<Vec<Vec<f32>>> = stream::iter(futures)
            .buffered(self.config.max_in_flight)
            .try_collect()
            .await?;

        tracing::debug!(
            inputs = texts.len(),
            batches = batch_count,
            "embedded texts"
        );

        Ok(results.into_iter().flatten().collect())
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }
}

fn map_transport_error(e: &reqwest::Error, timeout_ms: u64) -> EmbeddingError {
    if e.is_timeout() {
        EmbeddingError::Timeout(timeout_ms)
    } else if e.is_connect() {
        EmbeddingError::Unavailable(e.to_string())
    } else {
        EmbeddingError::Network(e.to_string())
    }
}

fn classify_status(status: u16, message: String) -> EmbeddingError {
    match status {
        429 => EmbeddingError::RateLimited(message),
        s if s >= 500 => EmbeddingError::Server { status: s, message },
        s => EmbeddingError::Permanent {
            status: Some(s),
            message,
        },
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = RETRY_BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(10));
    let capped = base.min(RETRY_MAX_DELAY_MS);
    // ±20% jitter so concurrent batches don't retry in lockstep.
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    Duration::from_millis((capped as f64 * jitter) as u64)
}
