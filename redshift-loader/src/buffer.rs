use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, gauge};
use redshift_config::shared::{LoaderConfig, ValidationMode};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::batch::{BatchId, BufferedRecord, FlushBatch, RejectedRecord};
use crate::bail;
use crate::error::{ErrorKind, LoaderResult};
use crate::metrics::{STREAM_LABEL, TARGET_BUFFERED_BYTES, TARGET_RECORDS_BUFFERED_TOTAL};
use crate::naming::TableName;
use crate::protocol::RecordMessage;
use crate::registry::StreamState;
use crate::schema::{ColumnSource, StreamSchema};
use crate::types::coercion::coerce;
use crate::types::{SizeHint, Value};

/// Why a stream buffer was sealed into a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    RowLimit,
    ByteLimit,
    FillTimeout,
    MemoryLimit,
    AllStreams,
    SchemaChange,
    VersionChange,
    Drain,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            FlushReason::RowLimit => "row_limit",
            FlushReason::ByteLimit => "byte_limit",
            FlushReason::FillTimeout => "fill_timeout",
            FlushReason::MemoryLimit => "memory_limit",
            FlushReason::AllStreams => "all_streams",
            FlushReason::SchemaChange => "schema_change",
            FlushReason::VersionChange => "version_change",
            FlushReason::Drain => "drain",
        };
        f.write_str(reason)
    }
}

/// Result of offering a record to the buffer.
#[derive(Debug)]
pub enum Admission {
    Buffered,
    /// The record failed coercion in `reject` mode and was not buffered.
    Rejected(RejectedRecord),
}

/// Records of one stream accumulated since its last flush.
#[derive(Debug)]
struct OpenBatch {
    id: BatchId,
    table: TableName,
    select_permissions: Vec<String>,
    schema: Arc<StreamSchema>,
    records: Vec<BufferedRecord>,
    bytes: usize,
    opened_at: Instant,
}

#[derive(Debug, Default)]
struct StreamBuffer {
    open: Option<OpenBatch>,
    next_sequence: u64,
    next_ordinal: u64,
}

/// Per-stream record buffers with size, count and time triggers plus a process-wide memory
/// ceiling.
///
/// Sealed batches queue up inside the buffer and are taken with [`RecordBuffer::drain_ready`].
#[derive(Debug)]
pub struct RecordBuffer {
    config: Arc<LoaderConfig>,
    streams: HashMap<String, StreamBuffer>,
    total_bytes: usize,
    next_batch_id: u64,
    ready: VecDeque<FlushBatch>,
}

impl RecordBuffer {
    pub fn new(config: Arc<LoaderConfig>) -> Self {
        Self {
            config,
            streams: HashMap::new(),
            total_bytes: 0,
            next_batch_id: 1,
            ready: VecDeque::new(),
        }
    }

    /// Coerces a record to its stream's schema and appends it to the stream's open batch.
    ///
    /// Flush triggers are evaluated afterwards: the stream's row, byte and fill-time limits,
    /// then the process-wide memory ceiling, which seals the largest buffers first.
    pub fn add(
        &mut self,
        state: &StreamState,
        message: &RecordMessage,
        now: Instant,
    ) -> LoaderResult<Admission> {
        let schema = state.schema();
        let record = state.flatten(&message.record, self.config.data_flattening_max_level);

        let mut values = Vec::with_capacity(schema.columns().len());
        let mut failures = Vec::new();
        for column in schema.columns() {
            let value = match &column.source {
                ColumnSource::Property(key) => match record.get(key) {
                    None | Some(JsonValue::Null) => Value::Null,
                    Some(raw) => match coerce(raw, &column.ty) {
                        Ok(value) => value,
                        Err(err) => {
                            failures.push(format!("column `{}`: {err}", column.name));
                            Value::Null
                        }
                    },
                },
                ColumnSource::ExtractedAt => message
                    .time_extracted
                    .map_or(Value::Null, Value::Timestamp),
                // Filled when the batch is sealed.
                ColumnSource::BatchedAt => Value::Null,
            };
            values.push(value);
        }

        let missing_keys = schema
            .primary_key_indices()
            .into_iter()
            .filter(|index| values[*index].is_null())
            .map(|index| format!("primary key `{}` is null", schema.columns()[index].name))
            .collect::<Vec<_>>();

        if !failures.is_empty() || !missing_keys.is_empty() {
            let detail = failures
                .iter()
                .chain(missing_keys.iter())
                .cloned()
                .collect::<Vec<_>>()
                .join("; ");

            match self.config.validation {
                ValidationMode::Null if missing_keys.is_empty() => {
                    warn!(
                        stream = %state.name(),
                        %detail,
                        "loading fields that failed coercion as null"
                    );
                }
                ValidationMode::Reject => {
                    return Ok(Admission::Rejected(RejectedRecord {
                        stream: state.name().to_string(),
                        record: message.record.clone(),
                        error: detail,
                        rejected_at: Utc::now(),
                    }));
                }
                ValidationMode::Null | ValidationMode::Abort => {
                    bail!(
                        ErrorKind::RecordCoercionError,
                        "Record does not match the stream schema",
                        format!("stream `{}`: {detail}", state.name())
                    );
                }
            }
        }

        let table = state.table_for_version(message.version);
        self.seal_if_incompatible(state.name(), schema, &table);

        let next_batch_id = &mut self.next_batch_id;
        let buffer = self.streams.entry(state.name().to_string()).or_default();
        let open = buffer.open.get_or_insert_with(|| {
            let id = BatchId(*next_batch_id);
            *next_batch_id += 1;
            OpenBatch {
                id,
                table,
                select_permissions: state.target().select_permissions.clone(),
                schema: schema.clone(),
                records: Vec::new(),
                bytes: 0,
                opened_at: now,
            }
        });

        let record = BufferedRecord {
            ordinal: buffer.next_ordinal,
            values,
        };
        buffer.next_ordinal += 1;

        let size = record.size_hint();
        open.bytes += size;
        open.records.push(record);
        self.total_bytes += size;

        counter!(TARGET_RECORDS_BUFFERED_TOTAL, STREAM_LABEL => state.name().to_string())
            .increment(1);

        if let Some(reason) = self.trigger(open_ref(&self.streams, state.name()), now) {
            if self.config.flush_all_streams {
                self.flush_all(FlushReason::AllStreams);
            } else {
                self.flush_stream(state.name(), reason);
            }
        }

        self.enforce_memory_limit();
        gauge!(TARGET_BUFFERED_BYTES).set(self.total_bytes as f64);

        Ok(Admission::Buffered)
    }

    /// Seals the open batch of a stream, if any.
    pub fn flush_stream(&mut self, stream: &str, reason: FlushReason) {
        let Some(buffer) = self.streams.get_mut(stream) else {
            return;
        };
        let Some(open) = buffer.open.take() else {
            return;
        };

        buffer.next_sequence += 1;
        let sequence = buffer.next_sequence;
        self.total_bytes = self.total_bytes.saturating_sub(open.bytes);

        let batched_at = Utc::now();
        let mut records = open.records;
        if let Some(index) = open
            .schema
            .columns()
            .iter()
            .position(|column| column.source == ColumnSource::BatchedAt)
        {
            for record in &mut records {
                record.values[index] = Value::Timestamp(batched_at);
            }
        }

        debug!(
            stream,
            batch_id = %open.id,
            sequence,
            rows = records.len(),
            bytes = open.bytes,
            %reason,
            "sealed batch"
        );

        self.ready.push_back(FlushBatch {
            id: open.id,
            stream: stream.to_string(),
            sequence,
            table: open.table,
            select_permissions: open.select_permissions,
            schema: open.schema,
            records,
            bytes: open.bytes,
            batched_at,
        });
    }

    /// Seals every open batch.
    pub fn flush_all(&mut self, reason: FlushReason) {
        let mut streams = self
            .streams
            .iter()
            .filter(|(_, buffer)| buffer.open.is_some())
            .map(|(stream, _)| stream.clone())
            .collect::<Vec<_>>();
        streams.sort();

        for stream in streams {
            self.flush_stream(&stream, reason);
        }
        gauge!(TARGET_BUFFERED_BYTES).set(self.total_bytes as f64);
    }

    /// Seals batches that have been open for longer than the fill timeout.
    pub fn flush_expired(&mut self, now: Instant) {
        let max_fill = Duration::from_millis(self.config.batch.max_fill_ms);
        let mut expired = self
            .streams
            .iter()
            .filter(|(_, buffer)| {
                buffer
                    .open
                    .as_ref()
                    .is_some_and(|open| now.saturating_duration_since(open.opened_at) >= max_fill)
            })
            .map(|(stream, _)| stream.clone())
            .collect::<Vec<_>>();
        expired.sort();

        if expired.is_empty() {
            return;
        }

        if self.config.flush_all_streams {
            self.flush_all(FlushReason::AllStreams);
            return;
        }
        for stream in expired {
            self.flush_stream(&stream, FlushReason::FillTimeout);
        }
        gauge!(TARGET_BUFFERED_BYTES).set(self.total_bytes as f64);
    }

    /// Takes every sealed batch, oldest first.
    pub fn drain_ready(&mut self) -> Vec<FlushBatch> {
        self.ready.drain(..).collect()
    }

    /// Reserves an id for work tracked like a batch, such as writing rejected records.
    pub fn allocate_batch_id(&mut self) -> BatchId {
        let id = BatchId(self.next_batch_id);
        self.next_batch_id += 1;
        id
    }

    /// Ids of batches that are buffered but not sealed yet.
    pub fn open_batch_ids(&self) -> impl Iterator<Item = BatchId> + '_ {
        self.streams
            .values()
            .filter_map(|buffer| buffer.open.as_ref().map(|open| open.id))
    }

    pub fn buffered_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn buffered_records(&self, stream: &str) -> usize {
        open_ref(&self.streams, stream).map_or(0, |open| open.records.len())
    }

    /// Seals the open batch of a stream when it was built for another schema or table.
    fn seal_if_incompatible(
        &mut self,
        stream: &str,
        schema: &Arc<StreamSchema>,
        table: &TableName,
    ) {
        let reason = match open_ref(&self.streams, stream) {
            Some(open) if !Arc::ptr_eq(&open.schema, schema) && *open.schema != **schema => {
                FlushReason::SchemaChange
            }
            Some(open) if open.table != *table => FlushReason::VersionChange,
            _ => return,
        };

        self.flush_stream(stream, reason);
    }

    fn trigger(&self, open: Option<&OpenBatch>, now: Instant) -> Option<FlushReason> {
        let open = open?;
        let batch = &self.config.batch;

        if open.records.len() >= batch.max_rows {
            Some(FlushReason::RowLimit)
        } else if open.bytes >= batch.max_bytes {
            Some(FlushReason::ByteLimit)
        } else if now.saturating_duration_since(open.opened_at)
            >= Duration::from_millis(batch.max_fill_ms)
        {
            Some(FlushReason::FillTimeout)
        } else {
            None
        }
    }

    fn enforce_memory_limit(&mut self) {
        while self.total_bytes > self.config.memory_limit_bytes {
            let largest = self
                .streams
                .iter()
                .filter_map(|(stream, buffer)| {
                    buffer.open.as_ref().map(|open| (stream, open.bytes))
                })
                .max_by(|(a_stream, a_bytes), (b_stream, b_bytes)| {
                    a_bytes.cmp(b_bytes).then_with(|| b_stream.cmp(a_stream))
                })
                .map(|(stream, _)| stream.clone());

            let Some(stream) = largest else {
                break;
            };

            warn!(
                stream = %stream,
                buffered_bytes = self.total_bytes,
                limit = self.config.memory_limit_bytes,
                "buffer memory limit exceeded, flushing largest stream"
            );
            self.flush_stream(&stream, FlushReason::MemoryLimit);
        }
    }
}

fn open_ref<'a>(streams: &'a HashMap<String, StreamBuffer>, stream: &str) -> Option<&'a OpenBatch> {
    streams.get(stream).and_then(|buffer| buffer.open.as_ref())
}

#[cfg(test)]
mod tests {
    use redshift_config::shared::BatchConfig;
    use serde_json::json;

    use super::*;
    use crate::protocol::SchemaMessage;
    use crate::registry::StreamRegistry;

    fn config(update: impl FnOnce(&mut LoaderConfig)) -> Arc<LoaderConfig> {
        let mut config = LoaderConfig::default();
        update(&mut config);
        Arc::new(config)
    }

    fn registry(config: &Arc<LoaderConfig>, streams: &[&str]) -> StreamRegistry {
        let mut registry = StreamRegistry::new(config.clone());
        for stream in streams {
            registry
                .register_or_update_schema(&SchemaMessage {
                    stream: stream.to_string(),
                    schema: json!({"properties": {
                        "id": {"type": "integer"},
                        "name": {"type": ["null", "string"]}
                    }}),
                    key_properties: vec!["id".to_string()],
                })
                .unwrap();
        }
        registry
    }

    fn record(stream: &str, record: JsonValue) -> RecordMessage {
        RecordMessage {
            stream: stream.to_string(),
            record: record.as_object().cloned().unwrap(),
            version: None,
            time_extracted: None,
        }
    }

    #[test]
    fn row_limit_seals_a_batch() {
        let config = config(|config| {
            config.batch = BatchConfig {
                max_rows: 2,
                ..BatchConfig::default()
            }
        });
        let registry = registry(&config, &["users"]);
        let mut buffer = RecordBuffer::new(config);
        let state = registry.get("users").unwrap();
        let now = Instant::now();

        buffer
            .add(state, &record("users", json!({"id": 1, "name": "a"})), now)
            .unwrap();
        assert!(buffer.drain_ready().is_empty());
        buffer
            .add(state, &record("users", json!({"id": 2, "name": "b"})), now)
            .unwrap();

        let ready = buffer.drain_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].len(), 2);
        assert_eq!(ready[0].sequence, 1);
        assert_eq!(buffer.buffered_bytes(), 0);
        assert_eq!(buffer.open_batch_ids().count(), 0);
    }

    #[test]
    fn flush_all_streams_seals_every_open_batch() {
        let config = config(|config| {
            config.batch.max_rows = 2;
            config.flush_all_streams = true;
        });
        let registry = registry(&config, &["orders", "users"]);
        let mut buffer = RecordBuffer::new(config);
        let now = Instant::now();

        buffer
            .add(
                registry.get("orders").unwrap(),
                &record("orders", json!({"id": 1})),
                now,
            )
            .unwrap();
        for id in [1, 2] {
            buffer
                .add(
                    registry.get("users").unwrap(),
                    &record("users", json!({"id": id})),
                    now,
                )
                .unwrap();
        }

        let streams = buffer
            .drain_ready()
            .into_iter()
            .map(|batch| batch.stream)
            .collect::<Vec<_>>();
        assert_eq!(streams, vec!["orders".to_string(), "users".to_string()]);
        assert_eq!(buffer.buffered_bytes(), 0);
    }

    #[test]
    fn fill_timeout_seals_idle_streams() {
        let config = config(|config| config.batch.max_fill_ms = 1_000);
        let registry = registry(&config, &["users"]);
        let mut buffer = RecordBuffer::new(config);
        let start = Instant::now();

        buffer
            .add(
                registry.get("users").unwrap(),
                &record("users", json!({"id": 1})),
                start,
            )
            .unwrap();
        buffer.flush_expired(start + Duration::from_millis(500));
        assert!(buffer.drain_ready().is_empty());

        buffer.flush_expired(start + Duration::from_millis(1_000));
        assert_eq!(buffer.drain_ready().len(), 1);
    }

    #[test]
    fn memory_limit_flushes_the_largest_stream() {
        let config = config(|config| config.memory_limit_bytes = 20_000);
        let streams = ["s1", "s2", "s3", "s4", "s5"];
        let registry = registry(&config, &streams);
        let mut buffer = RecordBuffer::new(config);
        let now = Instant::now();

        for (position, stream) in streams.iter().enumerate() {
            let name = "x".repeat(1_000 * (position + 1));
            buffer
                .add(
                    registry.get(stream).unwrap(),
                    &record(stream, json!({"id": 1, "name": name})),
                    now,
                )
                .unwrap();
        }
        assert!(buffer.drain_ready().is_empty());

        buffer
            .add(
                registry.get("s1").unwrap(),
                &record("s1", json!({"id": 2, "name": "y".repeat(10_000)})),
                now,
            )
            .unwrap();

        let ready = buffer.drain_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].stream, "s1");
        assert!(buffer.buffered_bytes() <= 20_000);
    }

    #[test]
    fn schema_changes_seal_the_previous_batch() {
        let config = config(|_| {});
        let mut registry = registry(&config, &["users"]);
        let mut buffer = RecordBuffer::new(config);
        let now = Instant::now();

        buffer
            .add(
                registry.get("users").unwrap(),
                &record("users", json!({"id": 1})),
                now,
            )
            .unwrap();
        registry
            .register_or_update_schema(&SchemaMessage {
                stream: "users".to_string(),
                schema: json!({"properties": {
                    "id": {"type": "integer"},
                    "name": {"type": ["null", "string"]},
                    "email": {"type": "string"}
                }}),
                key_properties: vec!["id".to_string()],
            })
            .unwrap();
        buffer
            .add(
                registry.get("users").unwrap(),
                &record("users", json!({"id": 2, "email": "a@b"})),
                now,
            )
            .unwrap();

        let ready = buffer.drain_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].schema.columns().len(), 2);
        assert_eq!(buffer.buffered_records("users"), 1);
    }

    #[test]
    fn coercion_failures_follow_the_validation_mode() {
        let bad = json!({"id": "not a number"});

        let abort = config(|_| {});
        let registry_abort = registry(&abort, &["users"]);
        let mut buffer = RecordBuffer::new(abort);
        let err = buffer
            .add(
                registry_abort.get("users").unwrap(),
                &record("users", bad.clone()),
                Instant::now(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RecordCoercionError);

        let reject = config(|config| config.validation = ValidationMode::Reject);
        let registry_reject = registry(&reject, &["users"]);
        let mut buffer = RecordBuffer::new(reject);
        let admission = buffer
            .add(
                registry_reject.get("users").unwrap(),
                &record("users", bad),
                Instant::now(),
            )
            .unwrap();
        assert!(matches!(admission, Admission::Rejected(_)));
        assert_eq!(buffer.buffered_records("users"), 0);
    }

    #[test]
    fn null_mode_keeps_records_with_failed_fields() {
        let config = config(|config| config.validation = ValidationMode::Null);
        let registry = registry(&config, &["users"]);
        let mut buffer = RecordBuffer::new(config);

        let admission = buffer
            .add(
                registry.get("users").unwrap(),
                &record("users", json!({"id": 1, "name": {"nested": true}})),
                Instant::now(),
            )
            .unwrap();

        assert!(matches!(admission, Admission::Buffered));
        buffer.flush_all(FlushReason::Drain);
        let ready = buffer.drain_ready();
        assert_eq!(ready[0].records[0].values[1], Value::Null);
    }

    #[test]
    fn unknown_keys_are_dropped() {
        let config = config(|_| {});
        let registry = registry(&config, &["users"]);
        let mut buffer = RecordBuffer::new(config);

        buffer
            .add(
                registry.get("users").unwrap(),
                &record("users", json!({"id": 1, "surprise": 42})),
                Instant::now(),
            )
            .unwrap();
        buffer.flush_all(FlushReason::Drain);

        let ready = buffer.drain_ready();
        assert_eq!(ready[0].records[0].values.len(), 2);
    }
}
