use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tracing::info;

use crate::error::{ErrorKind, LoaderError, LoaderResult};
use crate::evolution::SchemaChange;
use crate::evolution::type_map::{PersistedColumn, PersistedTable};
use crate::naming::TableName;
use crate::schema::DELETED_AT_COLUMN;
use crate::staging::MemoryStagingClient;
use crate::staging::encoding::decode_rows;
use crate::warehouse::base::{LoadOutcome, LoadRequest, MergeMode, Warehouse};
use crate::{bail, loader_error};

/// Contents of one in-memory table. Values are kept in their staged text form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryTable {
    pub columns: Vec<PersistedColumn>,
    pub primary_keys: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub grants: Vec<String>,
}

impl MemoryTable {
    fn index_of(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|column| column.name.eq_ignore_ascii_case(name))
    }

    /// Values of `column` for every row, in row order.
    pub fn column_values(&self, column: &str) -> Vec<Option<String>> {
        match self.index_of(column) {
            Some(index) => self.rows.iter().map(|row| row[index].clone()).collect(),
            None => Vec::new(),
        }
    }

    /// Rows as maps from column name to value, for assertions.
    pub fn records(&self) -> Vec<BTreeMap<String, Option<String>>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row)
                    .map(|(column, value)| (column.name.clone(), value.clone()))
                    .collect()
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<TableName, MemoryTable>,
    schema_changes: Vec<SchemaChange>,
    loads: Vec<(TableName, u64)>,
    injected_failures: VecDeque<ErrorKind>,
    load_gate: Option<Arc<Semaphore>>,
}

/// In-memory warehouse for tests and local development.
///
/// [`MemoryWarehouse`] reads staged objects back from a [`MemoryStagingClient`] and applies
/// merges with the same primary key, hard delete and skip-updates semantics as the SQL
/// warehouse. Failures can be queued to exercise retries and dead-lettering.
#[derive(Debug, Clone)]
pub struct MemoryWarehouse {
    staging: MemoryStagingClient,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryWarehouse {
    pub fn new(staging: MemoryStagingClient) -> Self {
        Self {
            staging,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Makes the next loads fail, one per queued kind, before touching any table.
    pub async fn fail_next_loads(&self, kinds: impl IntoIterator<Item = ErrorKind>) {
        self.inner.lock().await.injected_failures.extend(kinds);
    }

    /// Holds every load until the returned gate is closed.
    pub async fn hold_loads(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.inner.lock().await.load_gate = Some(gate.clone());

        gate
    }

    pub async fn table(&self, table: &TableName) -> Option<MemoryTable> {
        self.inner.lock().await.tables.get(table).cloned()
    }

    pub async fn table_names(&self) -> Vec<TableName> {
        self.inner.lock().await.tables.keys().cloned().collect()
    }

    /// Every schema change applied so far, in order.
    pub async fn schema_changes(&self) -> Vec<SchemaChange> {
        self.inner.lock().await.schema_changes.clone()
    }

    /// Successful loads as `(table, rows loaded)`, in order.
    pub async fn loads(&self) -> Vec<(TableName, u64)> {
        self.inner.lock().await.loads.clone()
    }

    /// Creates a table directly, as if it existed before the run.
    pub async fn insert_table(&self, table: TableName, contents: MemoryTable) {
        self.inner.lock().await.tables.insert(table, contents);
    }
}

impl Warehouse for MemoryWarehouse {
    async fn describe_table(&self, table: &TableName) -> LoaderResult<Option<PersistedTable>> {
        let inner = self.inner.lock().await;

        Ok(inner.tables.get(table).map(|contents| PersistedTable {
            columns: contents.columns.clone(),
        }))
    }

    async fn apply_schema_change(
        &self,
        change: &SchemaChange,
        select_permissions: &[String],
    ) -> LoaderResult<()> {
        let mut inner = self.inner.lock().await;
        info!(table = %change.table(), "applying schema change in memory");

        match change {
            SchemaChange::CreateTable {
                table,
                columns,
                primary_keys,
            } => {
                inner
                    .tables
                    .entry(table.clone())
                    .or_insert_with(|| MemoryTable {
                        columns: columns
                            .iter()
                            .map(|column| PersistedColumn {
                                name: column.name.clone(),
                                ty: column.ty.clone(),
                            })
                            .collect(),
                        primary_keys: primary_keys.clone(),
                        rows: Vec::new(),
                        grants: select_permissions.to_vec(),
                    });
            }
            SchemaChange::AddColumn { table, column } => {
                let contents = table_mut(&mut inner.tables, table)?;
                if contents.index_of(&column.name).is_some() {
                    bail!(
                        ErrorKind::WarehouseQueryFailed,
                        "Column already exists",
                        format!("{table}.{}", column.name)
                    );
                }
                contents.columns.push(PersistedColumn {
                    name: column.name.clone(),
                    ty: column.ty.clone(),
                });
                for row in &mut contents.rows {
                    row.push(None);
                }
            }
            SchemaChange::AlterColumnType { table, column, ty } => {
                let contents = table_mut(&mut inner.tables, table)?;
                let Some(index) = contents.index_of(column) else {
                    bail!(
                        ErrorKind::WarehouseQueryFailed,
                        "Column does not exist",
                        format!("{table}.{column}")
                    );
                };
                contents.columns[index].ty = ty.clone();
            }
            SchemaChange::RebuildTable {
                table,
                columns,
                copied,
                primary_keys,
            } => {
                let contents = table_mut(&mut inner.tables, table)?;
                let sources = columns
                    .iter()
                    .map(|column| {
                        if copied.iter().any(|name| name.eq_ignore_ascii_case(&column.name)) {
                            contents.index_of(&column.name)
                        } else {
                            None
                        }
                    })
                    .collect::<Vec<_>>();

                let rows = contents
                    .rows
                    .iter()
                    .map(|row| {
                        sources
                            .iter()
                            .map(|source| source.and_then(|index| row[index].clone()))
                            .collect()
                    })
                    .collect();

                *contents = MemoryTable {
                    columns: columns
                        .iter()
                        .map(|column| PersistedColumn {
                            name: column.name.clone(),
                            ty: column.ty.clone(),
                        })
                        .collect(),
                    primary_keys: primary_keys.clone(),
                    rows,
                    grants: select_permissions.to_vec(),
                };
            }
        }

        inner.schema_changes.push(change.clone());
        Ok(())
    }

    async fn load(&self, request: LoadRequest<'_>) -> LoaderResult<LoadOutcome> {
        let gate = self.inner.lock().await.load_gate.clone();
        if let Some(gate) = gate {
            // The gate never has permits, so this returns once it is closed.
            let _ = gate.acquire().await;
        }

        let mut inner = self.inner.lock().await;
        if let Some(kind) = inner.injected_failures.pop_front() {
            return Err(loader_error!(kind, "Injected load failure", request.table));
        }

        let Some(data) = self.staging.get(&request.object.key).await else {
            bail!(
                ErrorKind::LoadError,
                "Staged object does not exist",
                &request.object.key
            );
        };
        let staged = decode_rows(&data)?;

        let contents = table_mut(&mut inner.tables, request.table)?;
        let positions = request
            .columns
            .iter()
            .map(|column| {
                contents.index_of(column).ok_or_else(|| {
                    loader_error!(
                        ErrorKind::WarehouseQueryFailed,
                        "Staged column does not exist in the target table",
                        format!("{}.{column}", request.table)
                    )
                })
            })
            .collect::<Result<Vec<_>, LoaderError>>()?;

        let width = contents.columns.len();
        let rows = staged
            .into_iter()
            .map(|values| {
                let mut row = vec![None; width];
                for (position, value) in positions.iter().zip(values) {
                    row[*position] = value;
                }
                row
            })
            .collect::<Vec<_>>();

        let inserted = merge_rows(contents, rows, request.primary_keys, request.mode)?;
        inner.loads.push((request.table.clone(), inserted));

        Ok(LoadOutcome {
            rows_loaded: inserted,
        })
    }

    async fn swap_table(&self, table: &TableName, shadow: &TableName) -> LoaderResult<bool> {
        let mut inner = self.inner.lock().await;

        let Some(contents) = inner.tables.remove(shadow) else {
            return Ok(false);
        };
        inner.tables.insert(table.clone(), contents);

        Ok(true)
    }
}

fn table_mut<'a>(
    tables: &'a mut BTreeMap<TableName, MemoryTable>,
    table: &TableName,
) -> LoaderResult<&'a mut MemoryTable> {
    match tables.get_mut(table) {
        Some(contents) => Ok(contents),
        None => bail!(
            ErrorKind::WarehouseQueryFailed,
            "Table does not exist",
            table
        ),
    }
}

/// Applies staged rows the way the merge transaction does and returns the inserted count.
fn merge_rows(
    contents: &mut MemoryTable,
    rows: Vec<Vec<Option<String>>>,
    primary_keys: &[String],
    mode: MergeMode,
) -> LoaderResult<u64> {
    let MergeMode::Upsert {
        hard_delete,
        skip_updates,
    } = mode
    else {
        let inserted = rows.len() as u64;
        contents.rows.extend(rows);
        return Ok(inserted);
    };

    let key_indices = primary_keys
        .iter()
        .map(|key| {
            contents.index_of(key).ok_or_else(|| {
                loader_error!(
                    ErrorKind::WarehouseQueryFailed,
                    "Primary key column does not exist",
                    key
                )
            })
        })
        .collect::<Result<Vec<_>, LoaderError>>()?;
    let deleted_index = contents
        .index_of(DELETED_AT_COLUMN)
        .filter(|_| hard_delete);
    let key_of = |row: &Vec<Option<String>>| {
        key_indices
            .iter()
            .map(|index| row[*index].clone())
            .collect::<Vec<_>>()
    };

    let mut inserted = 0;
    for row in rows {
        let key = key_of(&row);
        let is_deleted = deleted_index.is_some_and(|index| row[index].is_some());
        let exists = contents.rows.iter().any(|existing| key_of(existing) == key);

        if exists && (is_deleted || !skip_updates) {
            contents.rows.retain(|existing| key_of(existing) != key);
        } else if exists {
            continue;
        }

        if !is_deleted {
            contents.rows.push(row);
            inserted += 1;
        }
    }

    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::batch::BatchId;
    use crate::evolution::ColumnDefinition;
    use crate::evolution::type_map::WarehouseType;
    use crate::staging::StagingClient;

    fn users() -> TableName {
        TableName::new("public", "users")
    }

    async fn warehouse_with_table(staging: &MemoryStagingClient) -> MemoryWarehouse {
        let warehouse = MemoryWarehouse::new(staging.clone());
        warehouse
            .apply_schema_change(
                &SchemaChange::CreateTable {
                    table: users(),
                    columns: vec![
                        ColumnDefinition {
                            name: "id".to_string(),
                            ty: WarehouseType::BigInt,
                        },
                        ColumnDefinition {
                            name: "name".to_string(),
                            ty: WarehouseType::Varchar(10),
                        },
                    ],
                    primary_keys: vec!["id".to_string()],
                },
                &[],
            )
            .await
            .unwrap();
        warehouse
    }

    async fn load(
        warehouse: &MemoryWarehouse,
        staging: &MemoryStagingClient,
        body: &'static [u8],
        mode: MergeMode,
    ) -> LoadOutcome {
        let object = staging
            .put("users/batch.csv", Bytes::from_static(body))
            .await
            .unwrap();
        let columns = vec!["id".to_string(), "name".to_string()];
        let keys = vec!["id".to_string()];

        warehouse
            .load(LoadRequest {
                batch_id: BatchId(1),
                table: &users(),
                columns: &columns,
                primary_keys: &keys,
                object: &object,
                mode,
            })
            .await
            .unwrap()
    }

    const UPSERT: MergeMode = MergeMode::Upsert {
        hard_delete: false,
        skip_updates: false,
    };

    #[tokio::test]
    async fn upserts_replace_rows_by_key() {
        let staging = MemoryStagingClient::new();
        let warehouse = warehouse_with_table(&staging).await;

        load(&warehouse, &staging, b"1,a\n2,b\n", UPSERT).await;
        load(&warehouse, &staging, b"1,c\n", UPSERT).await;

        let table = warehouse.table(&users()).await.unwrap();
        assert_eq!(
            table.rows,
            vec![
                vec![Some("2".to_string()), Some("b".to_string())],
                vec![Some("1".to_string()), Some("c".to_string())],
            ]
        );
    }

    #[tokio::test]
    async fn skip_updates_keeps_existing_rows() {
        let staging = MemoryStagingClient::new();
        let warehouse = warehouse_with_table(&staging).await;
        let skip = MergeMode::Upsert {
            hard_delete: false,
            skip_updates: true,
        };

        load(&warehouse, &staging, b"1,a\n", skip).await;
        let outcome = load(&warehouse, &staging, b"1,b\n2,c\n", skip).await;

        assert_eq!(outcome.rows_loaded, 1);
        let table = warehouse.table(&users()).await.unwrap();
        assert_eq!(
            table.column_values("name"),
            vec![Some("a".to_string()), Some("c".to_string())]
        );
    }

    #[tokio::test]
    async fn injected_failures_leave_tables_untouched() {
        let staging = MemoryStagingClient::new();
        let warehouse = warehouse_with_table(&staging).await;
        warehouse
            .fail_next_loads([ErrorKind::WarehouseConnectionFailed])
            .await;

        let object = staging
            .put("users/batch.csv", Bytes::from_static(b"1,a\n"))
            .await
            .unwrap();
        let columns = vec!["id".to_string(), "name".to_string()];
        let err = warehouse
            .load(LoadRequest {
                batch_id: BatchId(1),
                table: &users(),
                columns: &columns,
                primary_keys: &[],
                object: &object,
                mode: MergeMode::Append,
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::WarehouseConnectionFailed);
        assert!(warehouse.table(&users()).await.unwrap().rows.is_empty());
    }

    #[tokio::test]
    async fn swapping_replaces_the_table() {
        let staging = MemoryStagingClient::new();
        let warehouse = warehouse_with_table(&staging).await;
        let shadow = users().versioned(2);

        assert!(!warehouse.swap_table(&users(), &shadow).await.unwrap());

        warehouse
            .insert_table(shadow.clone(), MemoryTable::default())
            .await;
        assert!(warehouse.swap_table(&users(), &shadow).await.unwrap());
        assert!(warehouse.table(&shadow).await.is_none());
        assert!(warehouse.table(&users()).await.unwrap().columns.is_empty());
    }
}
