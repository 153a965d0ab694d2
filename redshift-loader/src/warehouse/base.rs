use std::future::Future;

use crate::batch::BatchId;
use crate::error::LoaderResult;
use crate::evolution::SchemaChange;
use crate::evolution::type_map::PersistedTable;
use crate::naming::TableName;
use crate::staging::StagedObject;

/// How staged rows are reconciled with the target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Insert every row.
    Append,
    /// Replace rows by primary key.
    Upsert {
        /// Rows whose deletion marker is set are removed instead of inserted.
        hard_delete: bool,
        /// Rows of keys already present are left untouched.
        skip_updates: bool,
    },
}

/// A staged batch ready to be merged.
#[derive(Debug, Clone, Copy)]
pub struct LoadRequest<'a> {
    pub batch_id: BatchId,
    pub table: &'a TableName,
    /// Staged columns, in file order.
    pub columns: &'a [String],
    pub primary_keys: &'a [String],
    pub object: &'a StagedObject,
    pub mode: MergeMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOutcome {
    /// Rows inserted into the target table.
    pub rows_loaded: u64,
}

/// A warehouse that tables are evolved in and batches are merged into.
///
/// Every operation is expected to be atomic: a failed call leaves the warehouse as it was.
pub trait Warehouse: Clone + Send + Sync + 'static {
    /// Reads the persisted definition of `table`, or `None` when it does not exist.
    fn describe_table(
        &self,
        table: &TableName,
    ) -> impl Future<Output = LoaderResult<Option<PersistedTable>>> + Send;

    /// Applies one DDL change. Newly created or rebuilt tables are granted to
    /// `select_permissions`.
    fn apply_schema_change(
        &self,
        change: &SchemaChange,
        select_permissions: &[String],
    ) -> impl Future<Output = LoaderResult<()>> + Send;

    /// Copies a staged batch into the target table in a single transaction.
    fn load(
        &self,
        request: LoadRequest<'_>,
    ) -> impl Future<Output = LoaderResult<LoadOutcome>> + Send;

    /// Replaces `table` with `shadow` atomically. Returns `false` when `shadow` does not exist.
    fn swap_table(
        &self,
        table: &TableName,
        shadow: &TableName,
    ) -> impl Future<Output = LoaderResult<bool>> + Send;
}
