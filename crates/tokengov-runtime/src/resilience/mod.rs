//! Resilience patterns for tokengov-runtime.
//!
//! This module provides:
//! - Token buckets for per-model admission control
//! - Circuit breaker with retry and backoff
//! - Error classification for mapper failures
//! - Advisory health monitoring

mod backoff;
mod circuit_breaker;
mod classify;
mod health;
mod token_bucket;

pub use backoff::{BackoffPolicy, ExponentialJitter};
pub use circuit_breaker::{BreakerPhase, BreakerState, CircuitBreaker, CircuitState};
pub use classify::{MapError, RETRYABLE_STATUS};
pub use health::{HealthAlert, HealthCheck, HealthMonitor, ModelHealth};
pub use token_bucket::{
    BucketMetrics, BucketStatus, RejectionAlert, TokenBucket, TokenBucketSet, TokenGrant,
};
