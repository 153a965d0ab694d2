use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::shared::{BatchConfig, RetryConfig, ValidationError};

/// What happens to a record field whose value cannot be coerced to the declared type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// The field is loaded as null.
    Null,
    /// The record is dropped and written to the dead-letter location.
    Reject,
    /// The run fails.
    #[default]
    Abort,
}

/// What happens to record fields that the stream's schema does not declare.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownColumnsPolicy {
    #[default]
    Drop,
    /// The field's type is inferred from its value and added to the schema.
    Evolve,
}

/// Target placement for every stream extracted from one source schema.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMappingEntry {
    pub target_schema: String,
    #[serde(default)]
    pub select_permissions: Vec<String>,
}

/// Per-stream overrides, keyed by stream name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOverride {
    #[serde(default)]
    pub target_schema: Option<String>,
    #[serde(default)]
    pub table_name: Option<String>,
    /// Replaces the `key_properties` announced by the stream's SCHEMA messages.
    #[serde(default)]
    pub primary_keys: Option<Vec<String>>,
}

/// Behaviour of the loading engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
    #[serde(default)]
    pub batch: BatchConfig,
    /// Aggregate buffered bytes across all streams above which the largest stream is flushed.
    #[serde(default = "default_memory_limit_bytes")]
    pub memory_limit_bytes: usize,
    /// Number of batches that can be staged and merged at the same time.
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
    /// Batches queued per stream before the reader waits for that stream's worker.
    #[serde(default = "default_stream_queue_capacity")]
    pub stream_queue_capacity: usize,
    #[serde(default)]
    pub validation: ValidationMode,
    #[serde(default)]
    pub unknown_columns: UnknownColumnsPolicy,
    #[serde(default)]
    pub hard_delete: bool,
    #[serde(default)]
    pub add_metadata_columns: bool,
    #[serde(default)]
    pub flush_all_streams: bool,
    #[serde(default)]
    pub skip_updates: bool,
    #[serde(default)]
    pub primary_key_required: bool,
    /// Depth up to which nested objects are flattened into `parent__child` columns.
    #[serde(default)]
    pub data_flattening_max_level: u8,
    #[serde(default = "default_target_schema")]
    pub default_target_schema: String,
    #[serde(default)]
    pub default_select_permissions: Vec<String>,
    #[serde(default)]
    pub schema_mapping: HashMap<String, SchemaMappingEntry>,
    #[serde(default)]
    pub streams: HashMap<String, StreamOverride>,
    /// Options appended verbatim to every `COPY` statement.
    #[serde(default = "default_copy_options")]
    pub copy_options: String,
    #[serde(default)]
    pub staging_retry: RetryConfig,
    #[serde(default)]
    pub load_retry: RetryConfig,
    /// Key prefix, inside the staging store, for batches and records that could not be loaded.
    #[serde(default = "default_dead_letter_prefix")]
    pub dead_letter_prefix: String,
    #[serde(default)]
    pub keep_staged_objects: bool,
}

impl LoaderConfig {
    pub const DEFAULT_MEMORY_LIMIT_BYTES: usize = 512 * 1024 * 1024;

    pub const DEFAULT_MAX_PARALLELISM: usize = 4;

    pub const DEFAULT_STREAM_QUEUE_CAPACITY: usize = 2;

    pub const DEFAULT_TARGET_SCHEMA: &'static str = "public";

    pub const DEFAULT_COPY_OPTIONS: &'static str =
        "TRUNCATECOLUMNS TIMEFORMAT 'auto' COMPUPDATE OFF STATUPDATE OFF";

    pub const DEFAULT_DEAD_LETTER_PREFIX: &'static str = "dead_letter/";

    /// Whether `_sdc_*` metadata columns are added to every table.
    pub fn metadata_columns_enabled(&self) -> bool {
        self.add_metadata_columns || self.hard_delete
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.batch.validate()?;
        self.staging_retry.validate("loader.staging_retry")?;
        self.load_retry.validate("loader.load_retry")?;

        if self.max_parallelism == 0 {
            return Err(ValidationError::invalid(
                "loader.max_parallelism",
                "must be greater than 0",
            ));
        }

        if self.stream_queue_capacity == 0 {
            return Err(ValidationError::invalid(
                "loader.stream_queue_capacity",
                "must be greater than 0",
            ));
        }

        if self.memory_limit_bytes == 0 {
            return Err(ValidationError::invalid(
                "loader.memory_limit_bytes",
                "must be greater than 0",
            ));
        }

        if self.default_target_schema.trim().is_empty() {
            return Err(ValidationError::MissingField(
                "loader.default_target_schema".to_string(),
            ));
        }

        for (source_schema, entry) in &self.schema_mapping {
            if entry.target_schema.trim().is_empty() {
                return Err(ValidationError::MissingField(format!(
                    "loader.schema_mapping.{source_schema}.target_schema"
                )));
            }
        }

        for (stream, stream_override) in &self.streams {
            let has_empty_key = stream_override
                .primary_keys
                .as_ref()
                .is_some_and(|keys| keys.iter().any(|key| key.trim().is_empty()));
            if has_empty_key {
                return Err(ValidationError::InvalidFieldValue {
                    field: format!("loader.streams.{stream}.primary_keys"),
                    constraint: "must not contain empty names".to_string(),
                });
            }
        }

        Ok(())
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            memory_limit_bytes: default_memory_limit_bytes(),
            max_parallelism: default_max_parallelism(),
            stream_queue_capacity: default_stream_queue_capacity(),
            validation: ValidationMode::default(),
            unknown_columns: UnknownColumnsPolicy::default(),
            hard_delete: false,
            add_metadata_columns: false,
            flush_all_streams: false,
            skip_updates: false,
            primary_key_required: false,
            data_flattening_max_level: 0,
            default_target_schema: default_target_schema(),
            default_select_permissions: Vec::new(),
            schema_mapping: HashMap::new(),
            streams: HashMap::new(),
            copy_options: default_copy_options(),
            staging_retry: RetryConfig::default(),
            load_retry: RetryConfig::default(),
            dead_letter_prefix: default_dead_letter_prefix(),
            keep_staged_objects: false,
        }
    }
}

fn default_memory_limit_bytes() -> usize {
    LoaderConfig::DEFAULT_MEMORY_LIMIT_BYTES
}

fn default_max_parallelism() -> usize {
    LoaderConfig::DEFAULT_MAX_PARALLELISM
}

fn default_stream_queue_capacity() -> usize {
    LoaderConfig::DEFAULT_STREAM_QUEUE_CAPACITY
}

fn default_target_schema() -> String {
    LoaderConfig::DEFAULT_TARGET_SCHEMA.to_string()
}

fn default_copy_options() -> String {
    LoaderConfig::DEFAULT_COPY_OPTIONS.to_string()
}

fn default_dead_letter_prefix() -> String {
    LoaderConfig::DEFAULT_DEAD_LETTER_PREFIX.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: LoaderConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(config, LoaderConfig::default());
        assert_eq!(config.validation, ValidationMode::Abort);
        assert_eq!(config.batch.max_rows, BatchConfig::DEFAULT_MAX_ROWS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn hard_delete_implies_metadata_columns() {
        let config = LoaderConfig {
            hard_delete: true,
            ..LoaderConfig::default()
        };

        assert!(config.metadata_columns_enabled());
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        let config = LoaderConfig {
            max_parallelism: 0,
            ..LoaderConfig::default()
        };

        assert_eq!(
            config.validate(),
            Err(ValidationError::InvalidFieldValue {
                field: "loader.max_parallelism".to_string(),
                constraint: "must be greater than 0".to_string(),
            })
        );
    }

    #[test]
    fn retry_with_zero_attempts_is_rejected() {
        let mut config = LoaderConfig::default();
        config.load_retry.max_attempts = 0;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("loader.load_retry.max_attempts"));
    }

    #[test]
    fn parses_modes_and_overrides() {
        let config: LoaderConfig = serde_json::from_str(
            r#"{
                "validation": "reject",
                "unknown_columns": "evolve",
                "schema_mapping": {"crm": {"target_schema": "analytics", "select_permissions": ["bi"]}},
                "streams": {"crm-users": {"primary_keys": ["user_id"]}}
            }"#,
        )
        .unwrap();

        assert_eq!(config.validation, ValidationMode::Reject);
        assert_eq!(config.unknown_columns, UnknownColumnsPolicy::Evolve);
        assert_eq!(config.schema_mapping["crm"].target_schema, "analytics");
        assert_eq!(
            config.streams["crm-users"].primary_keys,
            Some(vec!["user_id".to_string()])
        );
    }
}
