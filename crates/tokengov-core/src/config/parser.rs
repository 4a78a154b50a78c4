//! Governor configuration parsing from YAML/JSON.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use super::duration_str;
use super::schema::validate_config_schema;
use crate::types::{ChunkOptions, Priority};

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Config does not match schema: {}", .0.join("; "))]
    SchemaError(Vec<String>),

    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

/// Rate and context limits for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Sustained tokens per minute (refill rate)
    pub target_tpm: u32,

    /// Burst tokens per minute (bucket capacity)
    pub burst_tpm: u32,

    /// Context window in tokens
    #[serde(default = "default_context_window")]
    pub context_window: u32,

    /// Tokens reserved for the model's response
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

fn default_context_window() -> u32 {
    200_000
}

fn default_max_output_tokens() -> u32 {
    8_192
}

impl ModelConfig {
    /// Create a model entry with default context limits.
    pub fn new(target_tpm: u32, burst_tpm: u32) -> Self {
        Self {
            target_tpm,
            burst_tpm,
            context_window: default_context_window(),
            max_output_tokens: default_max_output_tokens(),
        }
    }

    /// Refill rate in tokens per second.
    pub fn refill_per_sec(&self) -> f64 {
        f64::from(self.target_tpm) / 60.0
    }
}

/// Token bucket behaviour shared by all models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// A denied request's claim on refill expires after this multiple of its wait
    #[serde(default = "default_claim_ttl_factor")]
    pub claim_ttl_factor: f64,

    /// Denial ratio above which a bucket is reported as overloaded
    #[serde(default = "default_rejection_alert_ratio")]
    pub rejection_alert_ratio: f64,
}

fn default_claim_ttl_factor() -> f64 {
    2.0
}

fn default_rejection_alert_ratio() -> f64 {
    0.05
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            claim_ttl_factor: default_claim_ttl_factor(),
            rejection_alert_ratio: default_rejection_alert_ratio(),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before opening circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time before attempting recovery
    #[serde(default = "default_cooldown", with = "duration_str")]
    pub cooldown: Duration,

    /// Successes in half-open needed to close circuit
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown() -> Duration {
    Duration::from_secs(60)
}

fn default_success_threshold() -> u32 {
    1
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown: default_cooldown(),
            success_threshold: default_success_threshold(),
        }
    }
}

/// Retry and backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(default = "default_base_delay", with = "duration_str")]
    pub base_delay: Duration,

    /// Upper bound for any single delay
    #[serde(default = "default_max_delay", with = "duration_str")]
    pub max_delay: Duration,

    /// Maximum jitter as a fraction of the exponential term
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_max_retries() -> u32 {
    7
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_jitter_ratio() -> f64 {
    0.1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

/// Health monitor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Polling interval
    #[serde(default = "default_health_interval", with = "duration_str")]
    pub interval: Duration,

    /// Consecutive failed checks before a critical alert
    #[serde(default = "default_health_failure_threshold")]
    pub failure_threshold: u32,

    /// A check that has not answered after this long counts as failed
    #[serde(default = "default_health_timeout", with = "duration_str")]
    pub timeout: Duration,
}

fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_health_failure_threshold() -> u32 {
    3
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: default_health_interval(),
            failure_threshold: default_health_failure_threshold(),
            timeout: default_health_timeout(),
        }
    }
}

/// Context compressor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressorConfig {
    /// Minimum cosine similarity for a chunk to be considered relevant
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    /// Maximum number of chunks selected
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_similarity_threshold() -> f64 {
    0.5
}

fn default_top_k() -> usize {
    10
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            top_k: default_top_k(),
        }
    }
}

/// Job runner configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Number of parallel workers
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Longest the runner sleeps before its single token retry
    #[serde(default = "default_max_token_wait", with = "duration_str")]
    pub max_token_wait: Duration,

    /// Default priority class for jobs
    #[serde(default)]
    pub priority: Priority,
}

fn default_worker_count() -> usize {
    4
}

fn default_max_token_wait() -> Duration {
    Duration::from_secs(60)
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            max_token_wait: default_max_token_wait(),
            priority: Priority::default(),
        }
    }
}

/// Checkpoint persistence configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory for file-backed checkpoint stores
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    /// Successful chunks between metadata snapshots
    #[serde(default = "default_interval_chunks")]
    pub interval_chunks: u32,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./checkpoints")
}

fn default_interval_chunks() -> u32 {
    10
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            interval_chunks: default_interval_chunks(),
        }
    }
}

/// Complete governor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Per-model rate and context limits
    #[serde(default = "default_models")]
    pub models: BTreeMap<String, ModelConfig>,

    #[serde(default)]
    pub bucket: BucketConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub compressor: CompressorConfig,

    #[serde(default)]
    pub chunking: ChunkOptions,

    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

fn default_models() -> BTreeMap<String, ModelConfig> {
    let mut models = BTreeMap::new();
    models.insert("claude-sonnet-4-5".to_string(), ModelConfig::new(80_000, 100_000));
    models
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            models: default_models(),
            bucket: BucketConfig::default(),
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            health: HealthConfig::default(),
            compressor: CompressorConfig::default(),
            chunking: ChunkOptions::default(),
            runner: RunnerConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl GovernorConfig {
    /// Parse a config from YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_yaml::from_str(yaml)?;
        Self::from_value(value)
    }

    /// Parse a config from JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Parse a config from a file, choosing the format by extension.
    ///
    /// `.json` files are parsed as JSON; anything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }

    /// Build a config from an already-parsed document.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        // An empty YAML document means "all defaults"
        let value = match value {
            serde_json::Value::Null => serde_json::json!({}),
            other => other,
        };

        validate_config_schema(&value).map_err(ConfigError::SchemaError)?;

        let config: GovernorConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the config as YAML.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Look up a model's limits.
    pub fn model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.get(name)
    }

    /// Names of all configured models, in sorted order.
    pub fn model_names(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    /// Check cross-field constraints the schema cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.models.is_empty() {
            return invalid("at least one model must be configured");
        }

        for (name, model) in &self.models {
            if model.target_tpm == 0 || model.burst_tpm == 0 {
                return invalid(format!("model '{}' must have non-zero token rates", name));
            }
            if model.max_output_tokens >= model.context_window {
                return invalid(format!(
                    "model '{}' reserves {} output tokens of a {} token window",
                    name, model.max_output_tokens, model.context_window
                ));
            }
        }

        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return invalid("breaker thresholds must be at least 1");
        }

        if self.retry.base_delay > self.retry.max_delay {
            return invalid("retry.base_delay must not exceed retry.max_delay");
        }

        if !(0.0..1.0).contains(&self.retry.jitter_ratio) {
            return invalid("retry.jitter_ratio must be in [0, 1)");
        }

        if !(0.0..=1.0).contains(&self.compressor.similarity_threshold) {
            return invalid("compressor.similarity_threshold must be in [0, 1]");
        }

        if self.compressor.top_k == 0 {
            return invalid("compressor.top_k must be at least 1");
        }

        if self.chunking.target_tokens == 0 {
            return invalid("chunking.target_tokens must be at least 1");
        }

        if self.chunking.overlap_tokens >= self.chunking.target_tokens {
            return invalid("chunking.overlap_tokens must be smaller than target_tokens");
        }

        if self.runner.worker_count == 0 {
            return invalid("runner.worker_count must be at least 1");
        }

        if self.health.failure_threshold == 0 {
            return invalid("health.failure_threshold must be at least 1");
        }

        if self.health.timeout.is_zero() {
            return invalid("health.timeout must be positive");
        }

        if self.bucket.claim_ttl_factor <= 0.0 {
            return invalid("bucket.claim_ttl_factor must be positive");
        }

        if !(0.0..=1.0).contains(&self.bucket.rejection_alert_ratio) {
            return invalid("bucket.rejection_alert_ratio must be in [0, 1]");
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> Result<(), ConfigError> {
    Err(ConfigError::ValidationError(message.into()))
}
