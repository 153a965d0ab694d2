use redshift_config::shared::RetryConfig;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::batch::FlushBatch;
use crate::error::{ErrorKind, LoaderResult};
use crate::retry::with_retries;
use crate::staging::client::{StagedObject, StagingClient};
use crate::staging::encoding::encode_batch;

/// Serializes flush batches and uploads them to staging storage.
#[derive(Debug, Clone)]
pub struct StagingWriter<S> {
    client: S,
    retry: RetryConfig,
    run_id: Uuid,
}

impl<S> StagingWriter<S>
where
    S: StagingClient,
{
    pub fn new(client: S, retry: RetryConfig, run_id: Uuid) -> Self {
        Self {
            client,
            retry,
            run_id,
        }
    }

    /// Encodes `batch` and writes it under a key unique to this batch and run.
    ///
    /// Upload failures are retried with backoff. Once retries are exhausted the error is a
    /// [`ErrorKind::StagingWriteError`].
    pub async fn stage(&self, batch: &FlushBatch) -> LoaderResult<StagedObject> {
        let body = encode_batch(batch);
        let key = staging_key(batch, self.run_id);

        let object = with_retries(&self.retry, "stage_batch", |attempt| {
            let body = body.clone();
            let key = key.clone();
            async move {
                debug!(key = %key, attempt, size = body.len(), "uploading staged batch");
                self.client.put(&key, body).await
            }
        })
        .await
        .map_err(|err| {
            if err.kind() == ErrorKind::StagingWriteError {
                err
            } else {
                err.reclassify(ErrorKind::StagingWriteError, "Failed to stage batch")
            }
        })?;

        Ok(object)
    }

    /// Removes a staged object after its batch was merged. Failures only leave garbage behind
    /// and are logged.
    pub async fn discard(&self, object: &StagedObject) {
        if let Err(err) = self.client.delete(&object.key).await {
            warn!(key = %object.key, error = %err, "failed to delete staged object");
        }
    }
}

/// Key of a staged batch: `{stream}/{sequence}-{batch id}-{timestamp}-{run id}.csv`.
///
/// The sequence is zero padded so keys of one stream sort in merge order.
pub fn staging_key(batch: &FlushBatch, run_id: Uuid) -> String {
    format!(
        "{}/{:010}-{}-{}-{}.csv",
        key_segment(&batch.stream),
        batch.sequence,
        batch.id,
        batch.batched_at.format("%Y%m%dT%H%M%S%3fZ"),
        run_id.simple()
    )
}

/// Makes a stream name safe to use as one path segment.
pub(crate) fn key_segment(stream: &str) -> String {
    stream
        .chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => ch,
            _ => '_',
        })
        .collect()
}
