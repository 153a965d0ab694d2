//! Metric names recorded by the engine through the `metrics` facade.

/// Label for the stream name.
pub const STREAM_LABEL: &str = "stream";

/// Label for an error kind.
pub const ERROR_KIND_LABEL: &str = "error_kind";

/// Label for the protocol message type.
pub const MESSAGE_TYPE_LABEL: &str = "message_type";

/// Counter of decoded protocol messages.
pub const TARGET_MESSAGES_RECEIVED_TOTAL: &str = "target_messages_received_total";

/// Counter of records accepted into a buffer.
pub const TARGET_RECORDS_BUFFERED_TOTAL: &str = "target_records_buffered_total";

/// Counter of records rejected by coercion.
pub const TARGET_RECORDS_REJECTED_TOTAL: &str = "target_records_rejected_total";

/// Gauge of bytes buffered across all streams.
pub const TARGET_BUFFERED_BYTES: &str = "target_buffered_bytes";

/// Counter of flush batches produced.
pub const TARGET_BATCHES_FLUSHED_TOTAL: &str = "target_batches_flushed_total";

/// Counter of flush batches that failed and were dead-lettered.
pub const TARGET_BATCHES_FAILED_TOTAL: &str = "target_batches_failed_total";

/// Counter of rows merged into target tables.
pub const TARGET_ROWS_LOADED_TOTAL: &str = "target_rows_loaded_total";

/// Histogram of the time spent staging and merging one batch.
pub const TARGET_BATCH_LOAD_DURATION_SECONDS: &str = "target_batch_load_duration_seconds";

/// Counter of DDL operations applied to the warehouse.
pub const TARGET_SCHEMA_CHANGES_TOTAL: &str = "target_schema_changes_total";

/// Counter of STATE messages forwarded downstream.
pub const TARGET_CHECKPOINTS_EMITTED_TOTAL: &str = "target_checkpoints_emitted_total";

/// Counter of retried staging and load attempts.
pub const TARGET_RETRIES_TOTAL: &str = "target_retries_total";
