use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Bounded exponential backoff applied to transient staging and load failures.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

impl RetryConfig {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

    pub const DEFAULT_INITIAL_DELAY_MS: u64 = 500;

    pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

    pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

    pub fn validate(&self, field: &str) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: format!("{field}.max_attempts"),
                constraint: "must be greater than 0".to_string(),
            });
        }

        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ValidationError::InvalidFieldValue {
                field: format!("{field}.backoff_factor"),
                constraint: "must be a finite number >= 1.0".to_string(),
            });
        }

        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ValidationError::InvalidFieldValue {
                field: format!("{field}.initial_delay_ms"),
                constraint: "must not exceed max_delay_ms".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

fn default_max_attempts() -> u32 {
    RetryConfig::DEFAULT_MAX_ATTEMPTS
}

fn default_initial_delay_ms() -> u64 {
    RetryConfig::DEFAULT_INITIAL_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    RetryConfig::DEFAULT_MAX_DELAY_MS
}

fn default_backoff_factor() -> f64 {
    RetryConfig::DEFAULT_BACKOFF_FACTOR
}
