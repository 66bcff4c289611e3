//! Multi-tier token-bucket rate limiting.
//!
//! Tiers (global, per-ip, endpoint-class) refill continuously on a monotonic
//! clock. A request consumes one token from every applicable tier in priority
//! order; if any tier rejects, earlier consumptions are refunded so per-tier
//! admission bounds stay exact. Whitelisted keys bypass their tier.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::RateLimitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierScope {
    /// One shared bucket for the whole process.
    Global,
    /// One bucket per client address.
    PerIp,
    /// One bucket per endpoint class; the tier applies when its name matches
    /// the request's class (a tier named "default" catches the rest).
    EndpointClass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,
    pub scope: TierScope,
    pub max_tokens: f64,
    pub refill_per_sec: f64,
    pub whitelist: Vec<String>,
    pub priority: u32,
    pub enabled: bool,
}

/// Why a request was rejected: the tier that ran dry and how long until one
/// token is available again.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitRejection {
    pub tier: String,
    pub retry_after: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    /// Sorted by priority at construction.
    tiers: Vec<TierConfig>,
    buckets: Mutex<HashMap<(String, String), Bucket>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let mut tiers: Vec<TierConfig> = config
            .tiers
            .iter()
            .filter(|t| t.enabled)
            .cloned()
            .collect();
        tiers.sort_by_key(|t| t.priority);
        Self {
            tiers,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject a request tagged with `(ip, endpoint_class)`.
    pub fn check(&self, ip: &str, endpoint_class: &str) -> Result<(), RateLimitRejection> {
        self.check_at(ip, endpoint_class, Instant::now())
    }

    fn check_at(
        &self,
        ip: &str,
        endpoint_class: &str,
        now: Instant,
    ) -> Result<(), RateLimitRejection> {
        let mut buckets = self.buckets.lock();
        let mut consumed: Vec<(String, String)> = Vec::new();

        for tier in self.applicable_tiers(endpoint_class) {
            let key = match tier.scope {
                TierScope::Global => "global".to_string(),
                TierScope::PerIp => ip.to_string(),
                TierScope::EndpointClass => endpoint_class.to_string(),
            };
            if tier.whitelist.iter().any(|w| w == &key) {
                continue;
            }

            let bucket_key = (tier.name.clone(), key);
            let bucket = buckets.entry(bucket_key.clone()).or_insert(Bucket {
                tokens: tier.max_tokens,
                last_refill: now,
            });

            refill(bucket, tier, now);

            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                consumed.push(bucket_key);
            } else {
                let deficit = 1.0 - bucket.tokens;
                let retry_after = Duration::from_secs_f64(deficit / tier.refill_per_sec);
                // Refund what earlier tiers already paid for this request.
                for refund_key in consumed {
                    if let Some(refund) = buckets.get_mut(&refund_key) {
                        refund.tokens += 1.0;
                    }
                }
                tracing::debug!(
                    tier = %tier.name,
                    ip = %ip,
                    endpoint_class = %endpoint_class,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "request rate limited"
                );
                return Err(RateLimitRejection {
                    tier: tier.name.clone(),
                    retry_after,
                });
            }
        }
        Ok(())
    }

    /// Clear the bucket for `(tier, key)`; the next request starts from a
    /// full bucket. Returns whether a bucket existed.
    pub fn reset(&self, tier: &str, key: &str) -> bool {
        let existed = self
            .buckets
            .lock()
            .remove(&(tier.to_string(), key.to_string()))
            .is_some();
        tracing::info!(tier = %tier, key = %key, existed, "rate limit bucket reset");
        existed
    }

    /// Tiers that apply to a request of this endpoint class, in priority
    /// order. Global and per-ip tiers always apply; endpoint-class tiers
    /// apply on a name match, with "default" as the fallback.
    fn applicable_tiers<'a>(
        &'a self,
        endpoint_class: &'a str,
    ) -> impl Iterator<Item = &'a TierConfig> + 'a {
        let has_exact = self
            .tiers
            .iter()
            .any(|t| t.scope == TierScope::EndpointClass && t.name == endpoint_class);
        self.tiers.iter().filter(move |tier| match tier.scope {
            TierScope::Global | TierScope::PerIp => true,
            TierScope::EndpointClass => {
                if has_exact {
                    tier.name == endpoint_class
                } else {
                    tier.name == "default"
                }
            }
        })
    }
}

fn refill(bucket: &mut Bucket, tier: &TierConfig, now: Instant) {
    let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
    bucket.tokens = (bucket.tokens + elapsed * tier.refill_per_sec).min(tier.max_tokens);
    bucket.last_refill = now;
}
