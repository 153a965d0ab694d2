//! Dead-letter storage for batches that could not be merged and records refused by coercion.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use redshift_config::shared::RetryConfig;
use serde::Serialize;
use tracing::{error, warn};
use uuid::Uuid;

use crate::batch::{BatchId, FlushBatch, RejectedRecord};
use crate::error::{LoaderError, LoaderResult};
use crate::retry::with_retries;
use crate::staging::encoding::encode_batch;
use crate::staging::{StagingClient, key_segment};

/// Sidecar describing a dead-lettered batch.
#[derive(Debug, Serialize)]
struct DeadLetterManifest<'a> {
    stream: &'a str,
    batch_id: BatchId,
    sequence: u64,
    table: String,
    columns: Vec<&'a str>,
    rows: usize,
    error_kind: String,
    error: String,
    failed_at: DateTime<Utc>,
}

/// Writes failed batches and rejected records under the dead-letter prefix of the staging
/// store.
#[derive(Debug, Clone)]
pub struct DeadLetterWriter<S> {
    client: S,
    prefix: String,
    retry: RetryConfig,
    run_id: Uuid,
}

impl<S> DeadLetterWriter<S>
where
    S: StagingClient,
{
    pub fn new(client: S, prefix: impl Into<String>, retry: RetryConfig, run_id: Uuid) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            retry,
            run_id,
        }
    }

    /// Stores the rows of a batch that failed to merge next to a JSON manifest with the error.
    ///
    /// Returns the key of the stored rows.
    pub async fn write_batch(&self, batch: &FlushBatch, err: &LoaderError) -> LoaderResult<String> {
        let base = format!(
            "{}{}/{:010}-{}",
            self.prefix,
            key_segment(&batch.stream),
            batch.sequence,
            batch.id
        );
        let rows_key = format!("{base}.csv");
        let manifest_key = format!("{base}.json");

        let manifest = DeadLetterManifest {
            stream: &batch.stream,
            batch_id: batch.id,
            sequence: batch.sequence,
            table: batch.table.to_string(),
            columns: batch.schema.column_names().collect(),
            rows: batch.len(),
            error_kind: format!("{:?}", err.kind()),
            error: error_summary(err),
            failed_at: Utc::now(),
        };
        let manifest = Bytes::from(serde_json::to_vec_pretty(&manifest)?);

        self.put(&rows_key, encode_batch(batch)).await?;
        self.put(&manifest_key, manifest).await?;

        error!(
            stream = %batch.stream,
            batch_id = %batch.id,
            key = %rows_key,
            "batch moved to dead letter storage"
        );

        Ok(rows_key)
    }

    /// Stores rejected records of one stream as JSON lines. `chunk` numbers the files written
    /// for the stream during this run.
    pub async fn write_rejected(
        &self,
        stream: &str,
        chunk: u64,
        records: &[RejectedRecord],
    ) -> LoaderResult<Option<String>> {
        if records.is_empty() {
            return Ok(None);
        }

        let mut body = BytesMut::new();
        for record in records {
            body.put_slice(&serde_json::to_vec(record)?);
            body.put_u8(b'\n');
        }

        let key = format!(
            "{}{}/rejected-{}-{:06}.jsonl",
            self.prefix,
            key_segment(stream),
            self.run_id.simple(),
            chunk
        );
        self.put(&key, body.freeze()).await?;

        warn!(
            stream,
            key = %key,
            count = records.len(),
            "rejected records written to dead letter storage"
        );

        Ok(Some(key))
    }

    async fn put(&self, key: &str, body: Bytes) -> LoaderResult<()> {
        with_retries(&self.retry, "dead_letter", |_| {
            let body = body.clone();
            async move { self.client.put(key, body).await }
        })
        .await?;

        Ok(())
    }
}

fn error_summary(err: &LoaderError) -> String {
    match err.detail() {
        Some(detail) => format!("{}: {detail}", err.description()),
        None => err.description().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{Map, Value as JsonValue, json};

    use super::*;
    use crate::batch::BufferedRecord;
    use crate::error::ErrorKind;
    use crate::loader_error;
    use crate::naming::TableName;
    use crate::schema::{Column, SemanticType, StreamSchema};
    use crate::staging::MemoryStagingClient;
    use crate::types::Value;

    fn retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            initial_delay_ms: 1,
            max_delay_ms: 1,
            backoff_factor: 1.0,
        }
    }

    fn batch() -> FlushBatch {
        FlushBatch {
            id: BatchId(3),
            stream: "orders".to_string(),
            sequence: 2,
            table: TableName::new("public", "orders"),
            select_permissions: vec![],
            schema: Arc::new(
                StreamSchema::new(
                    vec![Column::property("id", "id", SemanticType::Integer)],
                    vec!["id".to_string()],
                )
                .unwrap(),
            ),
            records: vec![BufferedRecord {
                ordinal: 0,
                values: vec![Value::Integer(9)],
            }],
            bytes: 8,
            batched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn failed_batches_keep_rows_and_error() {
        let client = MemoryStagingClient::new();
        let writer = DeadLetterWriter::new(client.clone(), "dead/", retry(), Uuid::new_v4());
        let err = loader_error!(ErrorKind::LoadError, "Failed to merge batch", "relation missing");

        let key = writer.write_batch(&batch(), &err).await.unwrap();

        assert_eq!(key, "dead/orders/0000000002-3.csv");
        assert_eq!(client.get(&key).await.unwrap().as_ref(), b"9\n");

        let manifest = client.get("dead/orders/0000000002-3.json").await.unwrap();
        let manifest: JsonValue = serde_json::from_slice(&manifest).unwrap();
        assert_eq!(manifest["batch_id"], json!(3));
        assert_eq!(manifest["error_kind"], json!("LoadError"));
        assert_eq!(
            manifest["error"],
            json!("Failed to merge batch: relation missing")
        );
    }

    #[tokio::test]
    async fn rejected_records_are_json_lines() {
        let client = MemoryStagingClient::new();
        let writer = DeadLetterWriter::new(client.clone(), "dead/", retry(), Uuid::new_v4());

        let mut record = Map::new();
        record.insert("id".to_string(), json!("not a number"));
        let rejected = RejectedRecord {
            stream: "orders".to_string(),
            record,
            error: "column `id`: invalid integer".to_string(),
            rejected_at: Utc::now(),
        };

        assert!(writer.write_rejected("orders", 1, &[]).await.unwrap().is_none());

        let key = writer
            .write_rejected("orders", 1, &[rejected.clone(), rejected])
            .await
            .unwrap()
            .unwrap();

        let body = client.get(&key).await.unwrap();
        let lines = std::str::from_utf8(&body).unwrap().lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        let first: JsonValue = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["record"]["id"], json!("not a number"));
        assert!(key.starts_with("dead/orders/rejected-"));
    }
}
