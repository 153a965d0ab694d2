//! Staging and merging of flush batches, with schema evolution applied first.

use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{debug, error, info, warn};

use crate::batch::{BatchId, FlushBatch, RejectedRecord};
use crate::context::EngineContext;
use crate::dead_letter::DeadLetterWriter;
use crate::error::{ErrorKind, LoaderError, LoaderResult};
use crate::evolution::{SchemaChange, resolve};
use crate::metrics::{
    ERROR_KIND_LABEL, STREAM_LABEL, TARGET_BATCH_LOAD_DURATION_SECONDS,
    TARGET_BATCHES_FAILED_TOTAL, TARGET_BATCHES_FLUSHED_TOTAL, TARGET_ROWS_LOADED_TOTAL,
    TARGET_SCHEMA_CHANGES_TOTAL,
};
use crate::naming::TableName;
use crate::retry::with_retries;
use crate::staging::{StagingClient, StagingWriter};
use crate::warehouse::{LoadRequest, MergeMode, Warehouse};

/// A batch that reached its target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedBatch {
    pub batch_id: BatchId,
    pub rows_loaded: u64,
    pub schema_changes: usize,
}

/// Takes a flush batch through schema evolution, staging and the merge transaction.
///
/// Batches that fail for good are moved to dead-letter storage before the error is returned.
#[derive(Debug, Clone)]
pub struct BatchLoader<W, S> {
    ctx: EngineContext<W, S>,
    staging: StagingWriter<S>,
    dead_letter: DeadLetterWriter<S>,
}

impl<W, S> BatchLoader<W, S>
where
    W: Warehouse,
    S: StagingClient,
{
    pub fn new(ctx: EngineContext<W, S>) -> Self {
        let staging = StagingWriter::new(
            ctx.staging.clone(),
            ctx.config.staging_retry.clone(),
            ctx.run_id,
        );
        let dead_letter = DeadLetterWriter::new(
            ctx.staging.clone(),
            ctx.config.dead_letter_prefix.clone(),
            ctx.config.staging_retry.clone(),
            ctx.run_id,
        );

        Self {
            ctx,
            staging,
            dead_letter,
        }
    }

    /// Merges `batch` into its table.
    pub async fn process(&self, batch: &FlushBatch) -> LoaderResult<MergedBatch> {
        let started = Instant::now();

        match self.merge(batch).await {
            Ok(merged) => {
                let elapsed = started.elapsed().as_secs_f64();
                counter!(TARGET_BATCHES_FLUSHED_TOTAL, STREAM_LABEL => batch.stream.clone())
                    .increment(1);
                counter!(TARGET_ROWS_LOADED_TOTAL, STREAM_LABEL => batch.stream.clone())
                    .increment(merged.rows_loaded);
                histogram!(TARGET_BATCH_LOAD_DURATION_SECONDS, STREAM_LABEL => batch.stream.clone())
                    .record(elapsed);

                info!(
                    stream = %batch.stream,
                    batch_id = %batch.id,
                    table = %batch.table,
                    rows = merged.rows_loaded,
                    duration_secs = elapsed,
                    "merged batch"
                );

                Ok(merged)
            }
            Err(err) => {
                counter!(
                    TARGET_BATCHES_FAILED_TOTAL,
                    STREAM_LABEL => batch.stream.clone(),
                    ERROR_KIND_LABEL => format!("{:?}", err.kind())
                )
                .increment(1);
                error!(stream = %batch.stream, batch_id = %batch.id, error = %err, "batch failed");

                if let Err(dead_letter_err) = self.dead_letter.write_batch(batch, &err).await {
                    return Err(LoaderError::from(vec![err, dead_letter_err]));
                }

                Err(err)
            }
        }
    }

    /// Writes a batch that will not be merged to dead-letter storage, with `err` as the reason.
    pub async fn abandon(&self, batch: &FlushBatch, err: &LoaderError) -> LoaderResult<()> {
        counter!(
            TARGET_BATCHES_FAILED_TOTAL,
            STREAM_LABEL => batch.stream.clone(),
            ERROR_KIND_LABEL => format!("{:?}", err.kind())
        )
        .increment(1);
        warn!(stream = %batch.stream, batch_id = %batch.id, error = %err, "batch abandoned");

        self.dead_letter.write_batch(batch, err).await?;

        Ok(())
    }

    /// Writes records refused by coercion to dead-letter storage.
    pub async fn reject(
        &self,
        stream: &str,
        chunk: u64,
        records: &[RejectedRecord],
    ) -> LoaderResult<()> {
        self.dead_letter
            .write_rejected(stream, chunk, records)
            .await?;

        Ok(())
    }

    /// Replaces `table` with the shadow table of a newly activated version.
    ///
    /// Returns `false` when no record of that version was loaded and the shadow table does not
    /// exist.
    pub async fn activate(&self, table: &TableName, shadow: &TableName) -> LoaderResult<bool> {
        let mut entry = self.ctx.schema_cache.lock(table).await;

        let swapped = with_retries(&self.ctx.config.load_retry, "swap_table", |_| {
            self.ctx.warehouse.swap_table(table, shadow)
        })
        .await?;

        entry.invalidate();
        drop(entry);
        self.ctx.schema_cache.remove(shadow).await;

        if swapped {
            info!(%table, %shadow, "activated table version");
        } else {
            info!(%table, %shadow, "no rows for the activated version, keeping the current table");
        }

        Ok(swapped)
    }

    async fn merge(&self, batch: &FlushBatch) -> LoaderResult<MergedBatch> {
        let schema_changes = self.evolve(batch).await?;

        if batch.is_empty() {
            return Ok(MergedBatch {
                batch_id: batch.id,
                rows_loaded: 0,
                schema_changes,
            });
        }

        let object = self.staging.stage(batch).await?;

        let columns = batch
            .schema
            .column_names()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let mode = if batch.schema.has_primary_key() {
            MergeMode::Upsert {
                hard_delete: self.ctx.config.hard_delete,
                skip_updates: self.ctx.config.skip_updates,
            }
        } else {
            MergeMode::Append
        };
        let request = LoadRequest {
            batch_id: batch.id,
            table: &batch.table,
            columns: &columns,
            primary_keys: batch.schema.primary_keys(),
            object: &object,
            mode,
        };

        let result = with_retries(&self.ctx.config.load_retry, "load_batch", |attempt| {
            debug!(batch_id = %batch.id, attempt, "loading staged batch");
            self.ctx.warehouse.load(request)
        })
        .await
        .map_err(|err| err.reclassify(ErrorKind::LoadError, "Failed to merge batch"));

        if !self.ctx.config.keep_staged_objects {
            self.staging.discard(&object).await;
        }

        let outcome = result?;

        Ok(MergedBatch {
            batch_id: batch.id,
            rows_loaded: outcome.rows_loaded,
            schema_changes,
        })
    }

    /// Brings the batch's table in line with the batch schema and returns the number of
    /// applied changes.
    ///
    /// The cache entry of the table stays locked until every change is applied, so concurrent
    /// batches of streams sharing a table evolve it one at a time.
    async fn evolve(&self, batch: &FlushBatch) -> LoaderResult<usize> {
        let mut entry = self.ctx.schema_cache.lock(&batch.table).await;

        let persisted = match entry.get() {
            Some(persisted) => persisted.cloned(),
            None => {
                let persisted = with_retries(&self.ctx.config.load_retry, "describe_table", |_| {
                    self.ctx.warehouse.describe_table(&batch.table)
                })
                .await?;
                entry.store(persisted.clone());
                persisted
            }
        };

        let changes = resolve(&batch.table, &batch.schema, persisted.as_ref())?;
        if changes.is_empty() {
            return Ok(0);
        }

        for change in &changes {
            debug!(
                stream = %batch.stream,
                table = %change.table(),
                ?change,
                "applying schema change"
            );
            let applied = with_retries(&self.ctx.config.load_retry, "apply_schema_change", |_| {
                self.ctx
                    .warehouse
                    .apply_schema_change(change, &batch.select_permissions)
            })
            .await;

            // The table may have changed even when a later step failed.
            entry.invalidate();
            applied?;

            counter!(
                TARGET_SCHEMA_CHANGES_TOTAL,
                STREAM_LABEL => batch.stream.clone(),
                "change" => change_label(change)
            )
            .increment(1);
        }

        info!(
            stream = %batch.stream,
            table = %batch.table,
            changes = changes.len(),
            "evolved table"
        );

        Ok(changes.len())
    }
}

fn change_label(change: &SchemaChange) -> &'static str {
    match change {
        SchemaChange::CreateTable { .. } => "create_table",
        SchemaChange::AddColumn { .. } => "add_column",
        SchemaChange::AlterColumnType { .. } => "alter_column_type",
        SchemaChange::RebuildTable { .. } => "rebuild_table",
    }
}
