use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use crate::naming::TableName;
use crate::schema::StreamSchema;
use crate::types::{SizeHint, Value};

/// Identifier of a flush batch, unique and increasing across all streams of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A coerced record waiting in a stream buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedRecord {
    /// Arrival position of the record within its stream.
    pub ordinal: u64,
    /// One value per schema column, in column order.
    pub values: Vec<Value>,
}

impl SizeHint for BufferedRecord {
    fn size_hint(&self) -> usize {
        self.values.size_hint() + size_of::<u64>()
    }
}

/// Immutable snapshot of a stream buffer, released for staging and loading.
#[derive(Debug, Clone)]
pub struct FlushBatch {
    pub id: BatchId,
    pub stream: String,
    /// Position of the batch within its stream, starting at 1.
    pub sequence: u64,
    /// Table the batch is merged into. A shadow table for inactive versions.
    pub table: TableName,
    pub select_permissions: Vec<String>,
    /// Schema the records were coerced with.
    pub schema: Arc<StreamSchema>,
    pub records: Vec<BufferedRecord>,
    pub bytes: usize,
    /// Flush time, stored in `_sdc_batched_at`.
    pub batched_at: DateTime<Utc>,
}

impl FlushBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns the rows to load.
    ///
    /// For keyed streams only the record with the highest ordinal survives for each key, in
    /// the position of that last record. Append-only streams keep every record.
    pub fn deduplicated_rows(&self) -> Vec<&BufferedRecord> {
        let key_indices = self.schema.primary_key_indices();
        if key_indices.is_empty() {
            return self.records.iter().collect();
        }

        let mut last_by_key: HashMap<Vec<Option<String>>, usize> =
            HashMap::with_capacity(self.records.len());
        for (position, record) in self.records.iter().enumerate() {
            let key = key_indices
                .iter()
                .map(|index| record.values.get(*index).and_then(Value::to_text))
                .collect::<Vec<_>>();

            match last_by_key.get(&key) {
                Some(previous) if self.records[*previous].ordinal > record.ordinal => {}
                _ => {
                    last_by_key.insert(key, position);
                }
            }
        }

        let mut positions = last_by_key.into_values().collect::<Vec<_>>();
        positions.sort_unstable();

        positions
            .into_iter()
            .map(|position| &self.records[position])
            .collect()
    }
}

/// A record refused by coercion in `reject` mode.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedRecord {
    pub stream: String,
    pub record: Map<String, JsonValue>,
    pub error: String,
    pub rejected_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, SemanticType};

    fn batch(keys: Vec<String>, records: Vec<(u64, i64, &str)>) -> FlushBatch {
        let schema = StreamSchema::new(
            vec![
                Column::property("id", "id", SemanticType::Integer),
                Column::property("name", "name", SemanticType::String { max_length: None }),
            ],
            keys,
        )
        .unwrap();

        FlushBatch {
            id: BatchId(1),
            stream: "users".to_string(),
            sequence: 1,
            table: TableName::new("public", "users"),
            select_permissions: vec![],
            schema: Arc::new(schema),
            records: records
                .into_iter()
                .map(|(ordinal, id, name)| BufferedRecord {
                    ordinal,
                    values: vec![Value::Integer(id), Value::String(name.to_string())],
                })
                .collect(),
            bytes: 0,
            batched_at: Utc::now(),
        }
    }

    fn names(rows: &[&BufferedRecord]) -> Vec<String> {
        rows.iter()
            .map(|row| row.values[1].to_text().unwrap())
            .collect()
    }

    #[test]
    fn last_writer_wins_per_key() {
        let batch = batch(
            vec!["id".to_string()],
            vec![(1, 1, "a"), (2, 2, "x"), (3, 1, "b")],
        );

        assert_eq!(names(&batch.deduplicated_rows()), vec!["x", "b"]);
    }

    #[test]
    fn ordinals_break_ties_regardless_of_position() {
        let batch = batch(vec!["id".to_string()], vec![(5, 1, "newer"), (4, 1, "older")]);

        assert_eq!(names(&batch.deduplicated_rows()), vec!["newer"]);
    }

    #[test]
    fn append_only_batches_keep_duplicates() {
        let batch = batch(vec![], vec![(1, 1, "a"), (2, 1, "b")]);

        assert_eq!(batch.deduplicated_rows().len(), 2);
    }
}
