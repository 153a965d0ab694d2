use tracing::warn;

use crate::bail;
use crate::error::{ErrorKind, LoaderResult};
use crate::evolution::type_map::{PersistedTable, WarehouseType, warehouse_type};
use crate::naming::TableName;
use crate::schema::StreamSchema;

/// A column as it is created in the warehouse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub name: String,
    pub ty: WarehouseType,
}

/// One DDL step bringing a table in line with a stream schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    CreateTable {
        table: TableName,
        columns: Vec<ColumnDefinition>,
        primary_keys: Vec<String>,
    },
    /// New nullable column.
    AddColumn {
        table: TableName,
        column: ColumnDefinition,
    },
    /// In-place `VARCHAR` length increase. Cannot run inside a transaction block.
    AlterColumnType {
        table: TableName,
        column: String,
        ty: WarehouseType,
    },
    /// Copies the table into a new one with the full column list. `copied` are the existing
    /// columns whose data is carried over, cast to their new types.
    RebuildTable {
        table: TableName,
        columns: Vec<ColumnDefinition>,
        copied: Vec<String>,
        primary_keys: Vec<String>,
    },
}

impl SchemaChange {
    pub fn table(&self) -> &TableName {
        match self {
            SchemaChange::CreateTable { table, .. }
            | SchemaChange::AddColumn { table, .. }
            | SchemaChange::AlterColumnType { table, .. }
            | SchemaChange::RebuildTable { table, .. } => table,
        }
    }

    /// Returns `true` for DDL that Redshift refuses inside a transaction block.
    pub fn requires_autocommit(&self) -> bool {
        matches!(self, SchemaChange::AlterColumnType { .. })
    }
}

/// Computes the DDL that makes `persisted` able to hold rows of `schema`.
///
/// A missing table is created. New columns are added in schema order. `VARCHAR` columns are
/// lengthened in place, while every other widening rebuilds the table once with all pending
/// changes. A column already wider than needed is left alone. Columns are never dropped or
/// narrowed: a change that would need either fails with
/// [`ErrorKind::UnsupportedSchemaChange`].
pub fn resolve(
    table: &TableName,
    schema: &StreamSchema,
    persisted: Option<&PersistedTable>,
) -> LoaderResult<Vec<SchemaChange>> {
    let Some(persisted) = persisted else {
        return Ok(vec![SchemaChange::CreateTable {
            table: table.clone(),
            columns: schema
                .columns()
                .iter()
                .map(|column| ColumnDefinition {
                    name: column.name.clone(),
                    ty: warehouse_type(&column.ty),
                })
                .collect(),
            primary_keys: schema.primary_keys().to_vec(),
        }]);
    };

    let mut added = Vec::new();
    let mut altered = Vec::new();
    let mut needs_rebuild = false;
    let mut widened = Vec::new();

    for column in schema.columns() {
        let desired = warehouse_type(&column.ty);
        let Some(existing) = persisted.column(&column.name) else {
            added.push(ColumnDefinition {
                name: column.name.clone(),
                ty: desired,
            });
            continue;
        };

        if existing.ty == desired || desired.can_widen_to(&existing.ty) {
            continue;
        }

        if !existing.ty.is_known() {
            warn!(
                table = %table,
                column = %existing.name,
                persisted = %existing.ty,
                desired = %desired,
                "column has a type this target does not manage, leaving it unchanged"
            );
            continue;
        }

        if !existing.ty.can_widen_to(&desired) {
            bail!(
                ErrorKind::UnsupportedSchemaChange,
                "Column type cannot be changed without data loss",
                format!(
                    "table `{table}` column `{}`: {} -> {desired}",
                    existing.name, existing.ty
                )
            );
        }

        if existing.ty.is_varchar() && desired.is_varchar() {
            altered.push((existing.name.clone(), desired.clone()));
        } else {
            needs_rebuild = true;
        }
        widened.push((existing.name.clone(), desired));
    }

    if needs_rebuild {
        let mut columns = persisted
            .columns
            .iter()
            .map(|existing| {
                let ty = widened
                    .iter()
                    .find(|(name, _)| *name == existing.name)
                    .map_or_else(|| existing.ty.clone(), |(_, ty)| ty.clone());
                ColumnDefinition {
                    name: existing.name.clone(),
                    ty,
                }
            })
            .collect::<Vec<_>>();
        columns.extend(added);

        return Ok(vec![SchemaChange::RebuildTable {
            table: table.clone(),
            columns,
            copied: persisted
                .columns
                .iter()
                .map(|column| column.name.clone())
                .collect(),
            primary_keys: schema.primary_keys().to_vec(),
        }]);
    }

    let changes = altered
        .into_iter()
        .map(|(column, ty)| SchemaChange::AlterColumnType {
            table: table.clone(),
            column,
            ty,
        })
        .chain(added.into_iter().map(|column| SchemaChange::AddColumn {
            table: table.clone(),
            column,
        }))
        .collect();

    Ok(changes)
}
