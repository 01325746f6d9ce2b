//! Engine configuration, loaded from TOML.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Policy values for the group lifecycle and its storage retries.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimum trust score a user needs to join a group.
    pub min_trust_score: f64,
    /// Largest accepted `target_size`.
    pub max_target_size: u32,
    pub handoff: HandoffConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    /// Number of decimal digits in a handoff code.
    pub code_digits: u32,
    /// Wrong codes tolerated per member before the code is revoked.
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_trust_score: 30.0,
            max_target_size: 50,
            handoff: HandoffConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            code_digits: 4,
            max_attempts: 5,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 5,
            max_backoff_ms: 200,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.min_trust_score.is_finite() || self.min_trust_score < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "min_trust_score must be a non-negative number, got {}",
                self.min_trust_score
            )));
        }
        if self.max_target_size < 2 {
            return Err(ConfigError::Invalid(format!(
                "max_target_size must be at least 2, got {}",
                self.max_target_size
            )));
        }
        if !(4..=9).contains(&self.handoff.code_digits) {
            return Err(ConfigError::Invalid(format!(
                "handoff.code_digits must be within 4..=9, got {}",
                self.handoff.code_digits
            )));
        }
        if self.handoff.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "handoff.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "retry.base_backoff_ms exceeds retry.max_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}
