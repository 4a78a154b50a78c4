//! Per-model token-rate admission control.
//!
//! Each model has a bucket holding up to `burst_tpm` tokens that refills
//! continuously at `target_tpm / 60` tokens per second. A request is
//! granted when the bucket covers it; otherwise the caller learns how long
//! to wait.
//!
//! Priority classes bias who gets refilled tokens first. A denied request
//! leaves a claim for its class; lower classes cannot spend tokens that
//! unexpired higher-priority claims are waiting for. Claims expire after
//! `claim_ttl_factor` times the wait they were given, so an abandoned claim
//! cannot starve lower classes indefinitely.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokengov_core::{BucketConfig, GovernorConfig, ModelConfig, Priority};
use tokio::time::Instant;

use crate::error::GovernorError;

/// Outcome of a token request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub model: String,
    pub tokens_requested: u32,
    pub granted: bool,

    /// Suggested wait before retrying (0 when granted)
    pub wait_ms: u64,
}

impl TokenGrant {
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

/// Running counters for one bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketMetrics {
    pub total_requests: u64,
    pub granted: u64,
    pub denied: u64,
    pub tokens_consumed: u64,
    pub refill_count: u64,
}

impl BucketMetrics {
    /// Fraction of requests denied (0 when there were none).
    pub fn rejection_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.denied as f64 / self.total_requests as f64
        }
    }
}

/// Snapshot of a bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketStatus {
    pub model: String,
    pub available_tokens: f64,
    pub capacity: f64,
    pub refill_per_sec: f64,

    /// Share of capacity currently spent
    pub utilization_percent: f64,

    pub metrics: BucketMetrics,
}

/// A model whose denial ratio crossed the alert threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionAlert {
    pub model: String,
    pub rejection_rate: f64,
    pub denied: u64,
    pub total_requests: u64,
}

#[derive(Debug, Clone, Copy)]
struct Claim {
    tokens: f64,
    expires_at: Instant,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    claims: HashMap<Priority, Claim>,
    metrics: BucketMetrics,
}

/// Token bucket for a single model.
#[derive(Debug)]
pub struct TokenBucket {
    model: String,
    capacity: f64,
    refill_per_sec: f64,
    claim_ttl_factor: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(model: impl Into<String>, limits: &ModelConfig, config: &BucketConfig) -> Self {
        let capacity = f64::from(limits.burst_tpm);
        Self {
            model: model.into(),
            capacity,
            refill_per_sec: limits.refill_per_sec(),
            claim_ttl_factor: config.claim_ttl_factor,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
                claims: HashMap::new(),
                metrics: BucketMetrics::default(),
            }),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    /// Request `tokens` for a call of the given priority.
    pub fn acquire(&self, tokens: u32, priority: Priority) -> TokenGrant {
        let mut state = self.state.lock();
        let now = Instant::now();
        self.refill(&mut state, now);
        state.claims.retain(|_, claim| claim.expires_at > now);
        state.metrics.total_requests += 1;

        let requested = f64::from(tokens);
        let reserved: f64 = state
            .claims
            .iter()
            .filter(|(class, _)| **class < priority)
            .map(|(_, claim)| claim.tokens)
            .sum();
        let available = (state.tokens - reserved).max(0.0);

        if requested <= available {
            state.tokens -= requested;
            state.metrics.granted += 1;
            state.metrics.tokens_consumed += u64::from(tokens);

            if let Some(claim) = state.claims.get_mut(&priority) {
                claim.tokens -= requested;
                if claim.tokens <= 0.0 {
                    state.claims.remove(&priority);
                }
            }

            return TokenGrant {
                model: self.model.clone(),
                tokens_requested: tokens,
                granted: true,
                wait_ms: 0,
            };
        }

        let shortfall = requested - available;
        let wait_ms = ((shortfall / self.refill_per_sec.max(f64::MIN_POSITIVE)) * 1000.0).ceil();
        let wait_ms = if wait_ms.is_finite() {
            (wait_ms as u64).max(1)
        } else {
            u64::MAX
        };

        // A request the bucket can never hold leaves no claim behind
        if requested <= self.capacity {
            let ttl = Duration::try_from_secs_f64(wait_ms as f64 / 1000.0 * self.claim_ttl_factor)
                .unwrap_or(Duration::MAX);
            let expires_at = now.checked_add(ttl).unwrap_or(now);
            let claim = state.claims.entry(priority).or_insert(Claim {
                tokens: 0.0,
                expires_at,
            });
            claim.tokens = claim.tokens.max(requested);
            claim.expires_at = claim.expires_at.max(expires_at);
        }

        state.metrics.denied += 1;

        tracing::debug!(
            model = %self.model,
            tokens,
            priority = %priority,
            wait_ms,
            "Token request denied"
        );

        TokenGrant {
            model: self.model.clone(),
            tokens_requested: tokens,
            granted: false,
            wait_ms,
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.last_refill = now;
        if elapsed <= 0.0 || state.tokens >= self.capacity {
            return;
        }
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.metrics.refill_count += 1;
    }

    /// Current bucket status.
    pub fn status(&self) -> BucketStatus {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        let utilization_percent = if self.capacity > 0.0 {
            (1.0 - state.tokens / self.capacity) * 100.0
        } else {
            0.0
        };
        BucketStatus {
            model: self.model.clone(),
            available_tokens: state.tokens,
            capacity: self.capacity,
            refill_per_sec: self.refill_per_sec,
            utilization_percent,
            metrics: state.metrics.clone(),
        }
    }
}

/// Token buckets for every configured model.
#[derive(Debug)]
pub struct TokenBucketSet {
    buckets: BTreeMap<String, TokenBucket>,
    config: BucketConfig,
}

impl TokenBucketSet {
    pub fn new(models: &BTreeMap<String, ModelConfig>, config: BucketConfig) -> Self {
        let buckets = models
            .iter()
            .map(|(name, limits)| (name.clone(), TokenBucket::new(name.clone(), limits, &config)))
            .collect();
        Self { buckets, config }
    }

    pub fn from_config(config: &GovernorConfig) -> Self {
        Self::new(&config.models, config.bucket.clone())
    }

    fn bucket(&self, model: &str) -> Result<&TokenBucket, GovernorError> {
        self.buckets
            .get(model)
            .ok_or_else(|| GovernorError::UnknownModel(model.to_string()))
    }

    /// Request tokens from a model's bucket.
    pub fn acquire(&self, model: &str, tokens: u32, priority: Priority) -> Result<TokenGrant, GovernorError> {
        Ok(self.bucket(model)?.acquire(tokens, priority))
    }

    /// Bucket capacity of a model.
    pub fn capacity(&self, model: &str) -> Result<u32, GovernorError> {
        Ok(self.bucket(model)?.capacity())
    }

    pub fn contains(&self, model: &str) -> bool {
        self.buckets.contains_key(model)
    }

    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.buckets.keys().map(String::as_str)
    }

    pub fn status(&self, model: &str) -> Result<BucketStatus, GovernorError> {
        Ok(self.bucket(model)?.status())
    }

    /// Status of every bucket, sorted by model.
    pub fn statuses(&self) -> Vec<BucketStatus> {
        self.buckets.values().map(TokenBucket::status).collect()
    }

    /// Models whose denial ratio exceeds `rejection_alert_ratio`.
    pub fn rejection_alerts(&self) -> Vec<RejectionAlert> {
        let threshold = self.config.rejection_alert_ratio;
        let alerts: Vec<RejectionAlert> = self
            .statuses()
            .into_iter()
            .filter(|s| s.metrics.total_requests > 0 && s.metrics.rejection_rate() > threshold)
            .map(|s| RejectionAlert {
                rejection_rate: s.metrics.rejection_rate(),
                denied: s.metrics.denied,
                total_requests: s.metrics.total_requests,
                model: s.model,
            })
            .collect();

        for alert in &alerts {
            tracing::warn!(
                model = %alert.model,
                rejection_rate = alert.rejection_rate,
                denied = alert.denied,
                total = alert.total_requests,
                "Token bucket rejection rate above threshold"
            );
        }

        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(target_tpm: u32, burst_tpm: u32) -> ModelConfig {
        ModelConfig::new(target_tpm, burst_tpm)
    }

    fn bucket_set(target_tpm: u32, burst_tpm: u32) -> TokenBucketSet {
        let mut models = BTreeMap::new();
        models.insert("model-a".to_string(), limits(target_tpm, burst_tpm));
        TokenBucketSet::new(&models, BucketConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_bucket_grants() {
        let set = bucket_set(6000, 1000);
        let grant = set.acquire("model-a", 400, Priority::Interactive).unwrap();
        assert!(grant.granted);
        assert_eq!(grant.wait_ms, 0);
        assert!((set.status("model-a").unwrap().available_tokens - 600.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denial_reports_wait() {
        // 6000 tpm = 100 tokens/sec
        let set = bucket_set(6000, 1000);
        assert!(set.acquire("model-a", 1000, Priority::Batch).unwrap().granted);

        let grant = set.acquire("model-a", 250, Priority::Batch).unwrap();
        assert!(!grant.granted);
        assert_eq!(grant.wait_ms, 2500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_continuous_and_capped() {
        let set = bucket_set(6000, 1000);
        set.acquire("model-a", 1000, Priority::Batch).unwrap();

        tokio::time::advance(Duration::from_millis(1500)).await;
        let status = set.status("model-a").unwrap();
        assert!((status.available_tokens - 150.0).abs() < 1e-6);

        tokio::time::advance(Duration::from_secs(3600)).await;
        let status = set.status("model-a").unwrap();
        assert_eq!(status.available_tokens, 1000.0);
        assert_eq!(status.utilization_percent, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_suggested_time_succeeds() {
        let set = bucket_set(6000, 1000);
        set.acquire("model-a", 1000, Priority::Batch).unwrap();

        let denied = set.acquire("model-a", 300, Priority::Batch).unwrap();
        tokio::time::advance(denied.wait()).await;
        assert!(set.acquire("model-a", 300, Priority::Batch).unwrap().granted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_higher_priority_claim_blocks_lower() {
        let set = bucket_set(6000, 1000);
        set.acquire("model-a", 1000, Priority::Batch).unwrap();

        // Realtime is denied and claims the next 500 tokens
        let realtime = set.acquire("model-a", 500, Priority::Realtime).unwrap();
        assert!(!realtime.granted);

        tokio::time::advance(Duration::from_secs(3)).await; // 300 tokens refilled

        // Batch cannot take tokens that realtime is waiting for
        assert!(!set.acquire("model-a", 100, Priority::Batch).unwrap().granted);

        tokio::time::advance(Duration::from_secs(2)).await; // 500 available
        assert!(set.acquire("model-a", 500, Priority::Realtime).unwrap().granted);

        // Claim satisfied: batch competes normally again
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(set.acquire("model-a", 100, Priority::Batch).unwrap().granted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claims_do_not_block_higher_or_equal_classes() {
        let set = bucket_set(6000, 1000);
        set.acquire("model-a", 1000, Priority::Realtime).unwrap();

        assert!(!set.acquire("model-a", 500, Priority::Batch).unwrap().granted);
        tokio::time::advance(Duration::from_secs(2)).await;

        // Batch's claim never holds back realtime or other batch requests
        assert!(set.acquire("model-a", 100, Priority::Realtime).unwrap().granted);
        assert!(set.acquire("model-a", 100, Priority::Batch).unwrap().granted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claims_expire() {
        let set = bucket_set(6000, 1000);
        set.acquire("model-a", 1000, Priority::Batch).unwrap();

        // Claim for 200 tokens: wait 2s, expires after 4s
        assert!(!set.acquire("model-a", 200, Priority::Realtime).unwrap().granted);

        tokio::time::advance(Duration::from_secs(5)).await;
        // Realtime never came back; batch may use the refill
        assert!(set.acquire("model-a", 450, Priority::Batch).unwrap().granted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_never_bypasses_rate() {
        let set = bucket_set(6000, 1000);
        set.acquire("model-a", 1000, Priority::Realtime).unwrap();
        let grant = set.acquire("model-a", 1, Priority::Realtime).unwrap();
        assert!(!grant.granted);
        assert!(grant.wait_ms > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_above_capacity_is_denied_with_wait() {
        let set = bucket_set(6000, 1000);
        let grant = set.acquire("model-a", 1001, Priority::Batch).unwrap();
        assert!(!grant.granted);
        assert!(grant.wait_ms > 0);
        assert_eq!(set.status("model-a").unwrap().available_tokens, 1000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_request_does_not_block_lower_classes() {
        let set = bucket_set(6000, 1000);
        let grant = set.acquire("model-a", 5000, Priority::Realtime).unwrap();
        assert!(!grant.granted);

        // Full bucket: a lower class still gets tokens immediately
        let batch = set.acquire("model-a", 100, Priority::Batch).unwrap();
        assert!(batch.granted);
        assert_eq!(batch.wait_ms, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_model() {
        let set = bucket_set(6000, 1000);
        assert!(matches!(
            set.acquire("nope", 1, Priority::Batch),
            Err(GovernorError::UnknownModel(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_and_rejection_alerts() {
        let set = bucket_set(6000, 1000);
        for _ in 0..10 {
            set.acquire("model-a", 100, Priority::Interactive).unwrap();
        }
        assert!(set.rejection_alerts().is_empty());

        set.acquire("model-a", 100, Priority::Interactive).unwrap();
        let status = set.status("model-a").unwrap();
        assert_eq!(status.metrics.total_requests, 11);
        assert_eq!(status.metrics.granted, 10);
        assert_eq!(status.metrics.denied, 1);
        assert_eq!(status.metrics.tokens_consumed, 1000);

        let alerts = set.rejection_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].model, "model-a");
        assert!(alerts[0].rejection_rate > 0.05);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_grants_never_exceed_capacity() {
        let set = std::sync::Arc::new(bucket_set(60, 1000));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let set = set.clone();
            handles.push(tokio::spawn(async move {
                (0..50)
                    .filter(|_| set.acquire("model-a", 10, Priority::Batch).unwrap().granted)
                    .count()
            }));
        }
        let mut granted = 0;
        for handle in handles {
            granted += handle.await.unwrap();
        }
        // Refill is 1 token/sec and time is paused, so only the burst is available
        assert_eq!(granted, 100);
    }
}
