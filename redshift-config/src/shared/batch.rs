use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Per-stream flush thresholds. A stream is flushed as soon as any one of them is reached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BatchConfig {
    /// Buffered record count that triggers a flush.
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    /// Buffered encoded size, in bytes, that triggers a flush.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    /// Time since the last flush, in milliseconds, after which a non-empty buffer is flushed.
    #[serde(default = "default_max_fill_ms")]
    pub max_fill_ms: u64,
}

impl BatchConfig {
    pub const DEFAULT_MAX_ROWS: usize = 100_000;

    pub const DEFAULT_MAX_BYTES: usize = 64 * 1024 * 1024;

    pub const DEFAULT_MAX_FILL_MS: u64 = 60_000;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_rows == 0 {
            return Err(ValidationError::invalid(
                "loader.batch.max_rows",
                "must be greater than 0",
            ));
        }

        if self.max_bytes == 0 {
            return Err(ValidationError::invalid(
                "loader.batch.max_bytes",
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_rows: default_max_rows(),
            max_bytes: default_max_bytes(),
            max_fill_ms: default_max_fill_ms(),
        }
    }
}

fn default_max_rows() -> usize {
    BatchConfig::DEFAULT_MAX_ROWS
}

fn default_max_bytes() -> usize {
    BatchConfig::DEFAULT_MAX_BYTES
}

fn default_max_fill_ms() -> u64 {
    BatchConfig::DEFAULT_MAX_FILL_MS
}
