//! Per-domain rate limiting and per-user quota gates.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

/// Token bucket refilled continuously from a per-minute rate.
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_min: u64, burst: u64) -> Self {
        Self {
            tokens: burst as f64,
            capacity: burst as f64,
            refill_per_sec: rate_per_min as f64 / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// One bucket per domain. Handshakes bypass this gate; only proxied
/// requests consume tokens.
pub struct DomainRateLimiter {
    buckets: DashMap<String, Mutex<TokenBucket>>,
    rate_per_min: u64,
    burst: u64,
}

impl DomainRateLimiter {
    pub fn new(rate_per_min: u64, burst: u64) -> Self {
        Self {
            buckets: DashMap::new(),
            rate_per_min,
            burst,
        }
    }

    pub fn allow(&self, domain: &str) -> bool {
        self.allow_at(domain, Instant::now())
    }

    fn allow_at(&self, domain: &str, now: Instant) -> bool {
        let bucket = self
            .buckets
            .entry(domain.to_string())
            .or_insert_with(|| Mutex::new(TokenBucket::new(self.rate_per_min, self.burst)));
        let mut bucket = bucket.lock();
        bucket.try_take(now)
    }

    /// Drop the bucket for a disconnected domain.
    pub fn forget(&self, domain: &str) {
        self.buckets.remove(domain);
    }
}

/// Verdict from the quota backend for one user.
#[derive(Debug, Clone, Copy, Default, serde::Deserialize)]
pub struct QuotaDecision {
    pub allow: bool,
    pub warn: bool,
    pub block: bool,
    pub used_bytes: u64,
    pub limit_bytes: u64,
}

impl QuotaDecision {
    pub fn allow_all() -> Self {
        Self {
            allow: true,
            ..Default::default()
        }
    }
}

/// Quota backend contract, keyed by user.
#[async_trait]
pub trait QuotaChecker: Send + Sync {
    async fn check(&self, user_id: i64) -> QuotaDecision;
}

/// Usage accounting contract. Bytes are attributed by the originating
/// session identity, never parsed back out of response headers.
#[async_trait]
pub trait UsageRecorder: Send + Sync {
    async fn record(&self, tunnel_id: i64, user_id: i64, bytes_in: u64, bytes_out: u64);
}

/// Default quota backend: everything is allowed.
pub struct AllowAllQuota;

#[async_trait]
impl QuotaChecker for AllowAllQuota {
    async fn check(&self, _user_id: i64) -> QuotaDecision {
        QuotaDecision::allow_all()
    }
}

/// Default usage backend: counters only, nothing persisted.
#[derive(Default)]
pub struct NoopUsage;

#[async_trait]
impl UsageRecorder for NoopUsage {
    async fn record(&self, _tunnel_id: i64, _user_id: i64, _bytes_in: u64, _bytes_out: u64) {}
}

/// HTTP-backed quota and usage client against the tunnel API service.
pub struct ApiQuotaClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ApiQuotaClient {
    pub fn new(base_url: &str, api_token: &str, timeout: Duration) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .expect("failed to build quota client");
        Arc::new(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: api_token.to_string(),
        })
    }
}

#[async_trait]
impl QuotaChecker for ApiQuotaClient {
    async fn check(&self, user_id: i64) -> QuotaDecision {
        let url = format!("{}/v1/quota/{}", self.base_url, user_id);
        match self.http.get(&url).bearer_auth(&self.token).send().await {
            Ok(resp) if resp.status().is_success() => {
                resp.json().await.unwrap_or_else(|_| QuotaDecision::allow_all())
            }
            // quota backend down must not take tunnels with it
            _ => QuotaDecision::allow_all(),
        }
    }
}

#[async_trait]
impl UsageRecorder for ApiQuotaClient {
    async fn record(&self, tunnel_id: i64, user_id: i64, bytes_in: u64, bytes_out: u64) {
        let url = format!("{}/v1/usage", self.base_url);
        let body = serde_json::json!({
            "tunnel_id": tunnel_id,
            "user_id": user_id,
            "bytes_in": bytes_in,
            "bytes_out": bytes_out,
        });
        let _ = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_empty() {
        let limiter = DomainRateLimiter::new(60, 3);
        let now = Instant::now();
        assert!(limiter.allow_at("a.example", now));
        assert!(limiter.allow_at("a.example", now));
        assert!(limiter.allow_at("a.example", now));
        assert!(!limiter.allow_at("a.example", now));
    }

    #[test]
    fn test_refill_over_time() {
        let limiter = DomainRateLimiter::new(60, 1); // 1 token/sec
        let now = Instant::now();
        assert!(limiter.allow_at("a.example", now));
        assert!(!limiter.allow_at("a.example", now));
        assert!(limiter.allow_at("a.example", now + Duration::from_secs(2)));
    }

    #[test]
    fn test_domains_are_independent() {
        let limiter = DomainRateLimiter::new(60, 1);
        let now = Instant::now();
        assert!(limiter.allow_at("a.example", now));
        assert!(!limiter.allow_at("a.example", now));
        assert!(limiter.allow_at("b.example", now));
    }

    #[tokio::test]
    async fn test_allow_all_quota() {
        let decision = AllowAllQuota.check(7).await;
        assert!(decision.allow);
        assert!(!decision.warn);
        assert!(!decision.block);
    }
}
