//! Governor configuration.
//!
//! Configuration is structured data validated against JSON Schema and then
//! checked for cross-field constraints. Every section is optional; missing
//! sections take documented defaults.

mod parser;
mod schema;

pub use parser::{
    BreakerConfig, BucketConfig, CheckpointConfig, CompressorConfig, ConfigError,
    GovernorConfig, HealthConfig, ModelConfig, RetryConfig, RunnerConfig,
};
pub use schema::validate_config_schema;

/// Serde adapter for durations written as "250ms", "30s", "1m" or whole seconds.
pub mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Secs(u64),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom),
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
        }
    }
}
