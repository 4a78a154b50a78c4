//! Advisory health monitoring for model backends.
//!
//! The monitor polls registered checks on a fixed interval and raises an
//! alert after `failure_threshold` consecutive failed checks, then a single
//! recovery notice once a check passes again. A check that outlives
//! `timeout` counts as failed. It never changes circuit
//! state; callers decide what to do with alerts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokengov_core::HealthConfig;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// A probe for one model backend.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Return true if the backend is healthy.
    async fn check(&self) -> bool;
}

#[async_trait]
impl<F, Fut> HealthCheck for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    async fn check(&self) -> bool {
        (self)().await
    }
}

/// Alert emitted on the monitor's channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "alert", rename_all = "snake_case")]
pub enum HealthAlert {
    Critical {
        model: String,
        consecutive_failures: u32,
        at: DateTime<Utc>,
    },
    Recovered {
        model: String,
        at: DateTime<Utc>,
    },
}

impl HealthAlert {
    pub fn model(&self) -> &str {
        match self {
            HealthAlert::Critical { model, .. } | HealthAlert::Recovered { model, .. } => model,
        }
    }
}

/// Latest health of one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHealth {
    pub model: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_check: Option<DateTime<Utc>>,

    /// A critical alert is outstanding
    pub alerting: bool,
}

impl ModelHealth {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            healthy: true,
            consecutive_failures: 0,
            last_check: None,
            alerting: false,
        }
    }
}

/// Polls health checks and publishes alerts.
pub struct HealthMonitor {
    config: HealthConfig,
    checks: RwLock<BTreeMap<String, Arc<dyn HealthCheck>>>,
    health: Mutex<HashMap<String, ModelHealth>>,
    alerts: mpsc::UnboundedSender<HealthAlert>,
}

impl HealthMonitor {
    /// Create a monitor and the receiving end of its alert channel.
    pub fn new(config: HealthConfig) -> (Self, mpsc::UnboundedReceiver<HealthAlert>) {
        let (alerts, rx) = mpsc::unbounded_channel();
        let monitor = Self {
            config,
            checks: RwLock::new(BTreeMap::new()),
            health: Mutex::new(HashMap::new()),
            alerts,
        };
        (monitor, rx)
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Register (or replace) the check for a model.
    pub fn register(&self, model: impl Into<String>, check: impl HealthCheck + 'static) {
        let model = model.into();
        self.health.lock().insert(model.clone(), ModelHealth::new(&model));
        self.checks.write().insert(model, Arc::new(check));
    }

    /// Latest health of a model.
    pub fn status(&self, model: &str) -> Option<ModelHealth> {
        self.health.lock().get(model).cloned()
    }

    /// Run every check once and return the alerts raised.
    pub async fn poll_once(&self) -> Vec<HealthAlert> {
        let checks: Vec<(String, Arc<dyn HealthCheck>)> = self
            .checks
            .read()
            .iter()
            .map(|(model, check)| (model.clone(), check.clone()))
            .collect();

        let timeout = self.config.timeout;
        let results = futures::future::join_all(checks.iter().map(|(model, check)| async move {
            let healthy = match tokio::time::timeout(timeout, check.check()).await {
                Ok(healthy) => healthy,
                Err(_) => {
                    tracing::warn!(model = %model, timeout = ?timeout, "Health check timed out");
                    false
                }
            };
            (model.clone(), healthy)
        }))
        .await;

        let now = Utc::now();
        let mut raised = Vec::new();
        {
            let mut health = self.health.lock();
            for (model, healthy) in results {
                let entry = health
                    .entry(model.clone())
                    .or_insert_with(|| ModelHealth::new(&model));
                entry.healthy = healthy;
                entry.last_check = Some(now);

                if healthy {
                    entry.consecutive_failures = 0;
                    if entry.alerting {
                        entry.alerting = false;
                        raised.push(HealthAlert::Recovered { model, at: now });
                    }
                    continue;
                }

                entry.consecutive_failures += 1;
                if !entry.alerting && entry.consecutive_failures >= self.config.failure_threshold {
                    entry.alerting = true;
                    raised.push(HealthAlert::Critical {
                        model,
                        consecutive_failures: entry.consecutive_failures,
                        at: now,
                    });
                }
            }
        }

        for alert in &raised {
            match alert {
                HealthAlert::Critical {
                    model,
                    consecutive_failures,
                    ..
                } => tracing::error!(
                    model = %model,
                    consecutive_failures,
                    "Health check failing"
                ),
                HealthAlert::Recovered { model, .. } => {
                    tracing::info!(model = %model, "Health check recovered")
                }
            }
            if self.alerts.send(alert.clone()).is_err() {
                tracing::debug!("Health alert receiver dropped");
            }
        }

        raised
    }

    /// Poll on the configured interval until `shutdown` turns true.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.poll_once().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::debug!("Health monitor stopped");
        })
    }
}
