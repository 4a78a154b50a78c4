//! Circuit breaker to prevent cascade failures.
//!
//! Each model has its own circuit. When calls to a model fail repeatedly the
//! circuit opens and later calls fail fast until the cooldown elapses; a
//! half-open probe then decides whether to close it again.

use backon::Retryable;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokengov_core::{BreakerConfig, GovernorConfig};
use tokio::time::Instant;

use super::backoff::BackoffPolicy;
use super::classify::MapError;
use crate::error::GovernorError;

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// All calls fail fast
    Open { opened_at: Instant },

    /// Probing whether the model recovered
    HalfOpen { successes: u32 },
}

/// Serializable name of a circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

impl From<CircuitState> for BreakerPhase {
    fn from(state: CircuitState) -> Self {
        match state {
            CircuitState::Closed => BreakerPhase::Closed,
            CircuitState::Open { .. } => BreakerPhase::Open,
            CircuitState::HalfOpen { .. } => BreakerPhase::HalfOpen,
        }
    }
}

/// Point-in-time view of one model's circuit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerState {
    pub model: String,
    pub state: BreakerPhase,
    pub consecutive_failures: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct ModelCircuit {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<DateTime<Utc>>,
}

impl Default for ModelCircuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
        }
    }
}

/// Per-model circuit breaker with retry and backoff.
pub struct CircuitBreaker {
    states: RwLock<HashMap<String, ModelCircuit>>,
    config: BreakerConfig,
    backoff: BackoffPolicy,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(config: BreakerConfig, backoff: BackoffPolicy) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            config,
            backoff,
        }
    }

    /// Create a breaker from the `breaker` and `retry` sections.
    pub fn from_config(config: &GovernorConfig) -> Self {
        Self::new(config.breaker.clone(), BackoffPolicy::from(&config.retry))
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Check whether a call to `model` may proceed.
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open and
    /// admits the call. Otherwise returns the cooldown remaining.
    pub fn admit(&self, model: &str) -> Result<(), Duration> {
        {
            let states = self.states.read();
            match states.get(model).map(|c| c.state) {
                Some(CircuitState::Open { opened_at }) => {
                    let elapsed = opened_at.elapsed();
                    if elapsed < self.config.cooldown {
                        return Err(self.config.cooldown - elapsed);
                    }
                }
                _ => return Ok(()),
            }
        }

        self.transition_to_half_open(model);
        Ok(())
    }

    /// Whether calls to `model` currently fail fast.
    pub fn is_open(&self, model: &str) -> bool {
        self.admit(model).is_err()
    }

    /// Record a successful call.
    pub fn record_success(&self, model: &str) {
        let mut states = self.states.write();
        let circuit = states.entry(model.to_string()).or_default();
        circuit.consecutive_failures = 0;

        match circuit.state {
            CircuitState::HalfOpen { successes } => {
                if successes + 1 >= self.config.success_threshold {
                    circuit.state = CircuitState::Closed;
                    tracing::info!(model = %model, "Circuit closed after successful recovery");
                } else {
                    circuit.state = CircuitState::HalfOpen {
                        successes: successes + 1,
                    };
                }
            }
            CircuitState::Closed => {}
            // A call admitted before the circuit opened finished late
            CircuitState::Open { .. } => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self, model: &str) {
        let mut states = self.states.write();
        let circuit = states.entry(model.to_string()).or_default();
        circuit.consecutive_failures += 1;
        circuit.last_failure = Some(Utc::now());

        match circuit.state {
            CircuitState::Closed => {
                if circuit.consecutive_failures >= self.config.failure_threshold {
                    circuit.state = CircuitState::Open {
                        opened_at: Instant::now(),
                    };
                    tracing::warn!(
                        model = %model,
                        failures = circuit.consecutive_failures,
                        "Circuit opened after repeated failures"
                    );
                }
            }
            CircuitState::HalfOpen { .. } => {
                circuit.state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                tracing::warn!(model = %model, "Circuit reopened after failed recovery attempt");
            }
            CircuitState::Open { .. } => {}
        }
    }

    fn transition_to_half_open(&self, model: &str) {
        let mut states = self.states.write();
        if let Some(circuit) = states.get_mut(model) {
            if let CircuitState::Open { opened_at } = circuit.state {
                if opened_at.elapsed() >= self.config.cooldown {
                    circuit.state = CircuitState::HalfOpen { successes: 0 };
                    tracing::info!(model = %model, "Circuit transitioning to half-open for recovery test");
                }
            }
        }
    }

    /// Get current state of a circuit.
    pub fn state(&self, model: &str) -> CircuitState {
        self.states
            .read()
            .get(model)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Serializable snapshot of a circuit.
    pub fn snapshot(&self, model: &str) -> BreakerState {
        let circuit = self.states.read().get(model).cloned().unwrap_or_default();
        BreakerState {
            model: model.to_string(),
            state: circuit.state.into(),
            consecutive_failures: circuit.consecutive_failures,
            last_failure_time: circuit.last_failure,
        }
    }

    /// Snapshots of every circuit that has seen traffic, sorted by model.
    pub fn snapshots(&self) -> Vec<BreakerState> {
        let mut models: Vec<String> = self.states.read().keys().cloned().collect();
        models.sort();
        models.iter().map(|m| self.snapshot(m)).collect()
    }

    /// Reset one circuit to closed.
    pub fn reset(&self, model: &str) {
        self.states.write().remove(model);
    }

    /// Reset all circuits to closed.
    pub fn reset_all(&self) {
        self.states.write().clear();
    }

    /// Run `op` against `model` with fault isolation and retries.
    ///
    /// `op` receives the 1-based attempt number. Retryable errors are
    /// retried up to `max_retries` times with exponential backoff, waiting
    /// at least as long as a rate-limit hint asks (capped at `max_delay`).
    /// The circuit is checked once before the first attempt and the call
    /// counts as one success or one failure toward its state.
    pub async fn execute<T, F, Fut>(&self, model: &str, mut op: F) -> Result<T, GovernorError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, MapError>>,
    {
        if let Err(remaining) = self.admit(model) {
            return Err(GovernorError::CircuitOpen {
                model: model.to_string(),
                remaining,
            });
        }

        let attempts = AtomicU32::new(0);
        let max_delay = self.backoff.max_delay;

        let result = (|| {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            op(attempt)
        })
        .retry(self.backoff)
        .sleep(tokio::time::sleep)
        .when(MapError::is_retryable)
        .adjust(|e: &MapError, delay: Option<Duration>| {
            let delay = delay?;
            Some(match e.retry_after() {
                Some(hint) => delay.max(hint.min(max_delay)),
                None => delay,
            })
        })
        .notify(|e: &MapError, delay: Duration| {
            tracing::debug!(
                model = %model,
                attempt = attempts.load(Ordering::Relaxed),
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "Retrying after failure"
            );
        })
        .await;

        let attempts = attempts.load(Ordering::Relaxed);
        match result {
            Ok(value) => {
                self.record_success(model);
                Ok(value)
            }
            Err(source) if source.is_retryable() => {
                self.record_failure(model);
                tracing::warn!(model = %model, attempts, error = %source, "Retries exhausted");
                Err(GovernorError::RetriesExhausted {
                    model: model.to_string(),
                    attempts,
                    source,
                })
            }
            Err(source) => {
                self.record_failure(model);
                Err(GovernorError::NonRetryable {
                    model: model.to_string(),
                    source,
                })
            }
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default(), BackoffPolicy::default())
    }
}
