//! Rendering of the SQL statements sent to Redshift.

use pg_escape::quote_identifier;

use crate::batch::BatchId;
use crate::evolution::{ColumnDefinition, SchemaChange};
use crate::evolution::type_map::WarehouseType;
use crate::naming::{MAX_IDENTIFIER_LENGTH, TableName};
use crate::schema::DELETED_AT_COLUMN;
use crate::warehouse::base::MergeMode;

/// Credentials Redshift uses to read staged objects from S3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyCredentials {
    IamRole(String),
    AccessKey {
        access_key_id: String,
        secret_access_key: String,
    },
}

/// How staged data reaches the stage table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopySource<'a> {
    S3 {
        uri: &'a str,
        credentials: &'a CopyCredentials,
        region: &'a str,
        options: &'a str,
    },
    Stdin,
}

pub fn create_schema(schema: &str) -> String {
    format!("CREATE SCHEMA IF NOT EXISTS {}", quote_identifier(schema))
}

pub fn create_table(
    table: &TableName,
    columns: &[ColumnDefinition],
    primary_keys: &[String],
) -> String {
    let mut definitions = columns
        .iter()
        .map(|column| format!("{} {}", quote_identifier(&column.name), column.ty))
        .collect::<Vec<_>>();

    if !primary_keys.is_empty() {
        definitions.push(format!("PRIMARY KEY ({})", column_list(primary_keys)));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        table.quoted(),
        definitions.join(", ")
    )
}

pub fn add_column(table: &TableName, column: &ColumnDefinition) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        table.quoted(),
        quote_identifier(&column.name),
        column.ty
    )
}

pub fn alter_column_type(table: &TableName, column: &str, ty: &WarehouseType) -> String {
    format!(
        "ALTER TABLE {} ALTER COLUMN {} TYPE {ty}",
        table.quoted(),
        quote_identifier(column)
    )
}

/// Statements copying `table` into a table with the new definition and swapping it in.
pub fn rebuild_table(
    table: &TableName,
    columns: &[ColumnDefinition],
    copied: &[String],
    primary_keys: &[String],
) -> Vec<String> {
    let rebuilt = table.with_suffix("__rebuild");
    let casts = copied
        .iter()
        .map(|name| {
            let ty = columns
                .iter()
                .find(|column| column.name == *name)
                .map(|column| column.ty.to_string());
            match ty {
                Some(ty) => format!("CAST({} AS {ty})", quote_identifier(name)),
                None => quote_identifier(name).into_owned(),
            }
        })
        .collect::<Vec<_>>()
        .join(", ");

    vec![
        drop_table_if_exists(&rebuilt),
        create_table(&rebuilt, columns, primary_keys),
        format!(
            "INSERT INTO {} ({}) SELECT {casts} FROM {}",
            rebuilt.quoted(),
            column_list(copied),
            table.quoted()
        ),
        format!("DROP TABLE {}", table.quoted()),
        rename_table(&rebuilt, &table.name),
    ]
}

/// DDL of one schema change, for changes that run in a single statement or transaction.
pub fn schema_change(change: &SchemaChange) -> Vec<String> {
    match change {
        SchemaChange::CreateTable {
            table,
            columns,
            primary_keys,
        } => vec![
            create_schema(&table.schema),
            create_table(table, columns, primary_keys),
        ],
        SchemaChange::AddColumn { table, column } => vec![add_column(table, column)],
        SchemaChange::AlterColumnType { table, column, ty } => {
            vec![alter_column_type(table, column, ty)]
        }
        SchemaChange::RebuildTable {
            table,
            columns,
            copied,
            primary_keys,
        } => rebuild_table(table, columns, copied, primary_keys),
    }
}

/// `GRANT SELECT` for each grantee. Entries starting with `group ` grant to a user group.
pub fn grant_select(table: &TableName, grantees: &[String]) -> Vec<String> {
    grantees
        .iter()
        .map(|grantee| {
            let grantee = grantee.trim();
            let rendered = match grantee.split_once(char::is_whitespace) {
                Some((keyword, group)) if keyword.eq_ignore_ascii_case("group") => {
                    format!("GROUP {}", quote_identifier(group.trim()))
                }
                _ => quote_identifier(grantee).into_owned(),
            };
            format!("GRANT SELECT ON {} TO {rendered}", table.quoted())
        })
        .collect()
}

pub fn drop_table_if_exists(table: &TableName) -> String {
    format!("DROP TABLE IF EXISTS {}", table.quoted())
}

pub fn rename_table(table: &TableName, new_name: &str) -> String {
    format!(
        "ALTER TABLE {} RENAME TO {}",
        table.quoted(),
        quote_identifier(new_name)
    )
}

/// Name of the temporary table a batch is copied into.
pub fn stage_table_name(table: &TableName, batch_id: BatchId) -> String {
    let suffix = format!("_stage_{batch_id}");
    let mut name = table.name.clone();
    name.truncate(MAX_IDENTIFIER_LENGTH.saturating_sub(suffix.len()));
    name.push_str(&suffix);
    name
}

/// Statements of the merge transaction of one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub statements: Vec<String>,
    /// Position of the `COPY` into the stage table.
    pub copy_index: usize,
    /// Position of the `INSERT` into the target table.
    pub insert_index: usize,
}

/// Builds the merge transaction of one batch.
///
/// The batch is copied into a temporary table shaped like the target. Keyed streams then
/// delete the target rows of every staged key and insert the staged rows, leaving out rows
/// marked deleted when hard deletes are on. In skip-updates mode only unknown keys are
/// inserted. Append-only streams insert everything.
pub fn merge_statements(
    table: &TableName,
    stage: &str,
    columns: &[String],
    primary_keys: &[String],
    mode: MergeMode,
    source: CopySource<'_>,
) -> MergePlan {
    let stage_ident = quote_identifier(stage).into_owned();
    let target = table.quoted();
    let column_list = column_list(columns);
    let has_deleted_at = columns.iter().any(|column| column == DELETED_AT_COLUMN);

    let mut statements = vec![
        format!("CREATE TEMP TABLE {stage_ident} (LIKE {target})"),
        copy_into(&stage_ident, &column_list, source),
    ];

    let deleted = format!("{stage_ident}.{}", quote_identifier(DELETED_AT_COLUMN));
    match mode {
        MergeMode::Append => {
            statements.push(format!(
                "INSERT INTO {target} ({column_list}) SELECT {column_list} FROM {stage_ident}"
            ));
        }
        MergeMode::Upsert {
            hard_delete,
            skip_updates,
        } => {
            let key_match = primary_keys
                .iter()
                .map(|key| {
                    let key = quote_identifier(key);
                    format!("{target}.{key} = {stage_ident}.{key}")
                })
                .collect::<Vec<_>>()
                .join(" AND ");
            let hard_delete = hard_delete && has_deleted_at;

            if !skip_updates {
                statements.push(format!(
                    "DELETE FROM {target} USING {stage_ident} WHERE {key_match}"
                ));
            } else if hard_delete {
                statements.push(format!(
                    "DELETE FROM {target} USING {stage_ident} WHERE {key_match} AND {deleted} IS NOT NULL"
                ));
            }

            let select_list = columns
                .iter()
                .map(|column| format!("{stage_ident}.{}", quote_identifier(column)))
                .collect::<Vec<_>>()
                .join(", ");
            let mut filters = Vec::new();
            if hard_delete {
                filters.push(format!("{deleted} IS NULL"));
            }

            if skip_updates {
                let first_key = primary_keys
                    .first()
                    .map(|key| quote_identifier(key).into_owned())
                    .unwrap_or_default();
                filters.push(format!("{target}.{first_key} IS NULL"));
                statements.push(format!(
                    "INSERT INTO {target} ({column_list}) SELECT {select_list} FROM {stage_ident} LEFT JOIN {target} ON {key_match}{}",
                    where_clause(&filters)
                ));
            } else {
                statements.push(format!(
                    "INSERT INTO {target} ({column_list}) SELECT {select_list} FROM {stage_ident}{}",
                    where_clause(&filters)
                ));
            }
        }
    }

    let insert_index = statements.len() - 1;
    statements.push(format!("DROP TABLE {stage_ident}"));

    MergePlan {
        statements,
        copy_index: 1,
        insert_index,
    }
}

fn copy_into(stage: &str, column_list: &str, source: CopySource<'_>) -> String {
    match source {
        CopySource::S3 {
            uri,
            credentials,
            region,
            options,
        } => {
            let credentials = match credentials {
                CopyCredentials::IamRole(role) => format!("IAM_ROLE {}", string_literal(role)),
                CopyCredentials::AccessKey {
                    access_key_id,
                    secret_access_key,
                } => format!(
                    "ACCESS_KEY_ID {} SECRET_ACCESS_KEY {}",
                    string_literal(access_key_id),
                    string_literal(secret_access_key)
                ),
            };

            let mut sql = format!(
                "COPY {stage} ({column_list}) FROM {} {credentials} REGION {} CSV NULL AS '\\\\N'",
                string_literal(uri),
                string_literal(region),
            );
            if !options.trim().is_empty() {
                sql.push(' ');
                sql.push_str(options.trim());
            }
            sql
        }
        CopySource::Stdin => {
            format!("COPY {stage} ({column_list}) FROM STDIN WITH (FORMAT csv, NULL '\\N')")
        }
    }
}

/// Redshift string literal. Backslashes are escapes in Redshift literals, so they are doubled
/// along with quotes.
fn string_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|column| quote_identifier(column).into_owned())
        .collect::<Vec<_>>()
        .join(", ")
}

fn where_clause(filters: &[String]) -> String {
    if filters.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", filters.join(" AND "))
    }
}
