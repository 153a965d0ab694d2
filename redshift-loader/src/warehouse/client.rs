use std::future::Future;

use bytes::Bytes;

use crate::error::LoaderResult;
use crate::evolution::type_map::PersistedTable;
use crate::naming::TableName;

/// One statement of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Sql(String),
    /// A `COPY ... FROM STDIN` fed with `data`.
    CopyIn { sql: String, data: Bytes },
}

impl Statement {
    pub fn sql(&self) -> &str {
        match self {
            Statement::Sql(sql) | Statement::CopyIn { sql, .. } => sql,
        }
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Statement::Sql(sql)
    }
}

/// Narrow SQL interface to the warehouse.
///
/// Connections are checked out from a pool per call and released when the call returns,
/// whether it succeeded or not.
pub trait SqlClient: Clone + Send + Sync + 'static {
    /// Runs one statement outside of a transaction block and returns the affected rows.
    fn execute(&self, sql: &str) -> impl Future<Output = LoaderResult<u64>> + Send;

    /// Runs `statements` in one transaction on one connection and returns the rows affected
    /// by each. Nothing is committed if any statement fails.
    fn execute_transaction(
        &self,
        statements: Vec<Statement>,
    ) -> impl Future<Output = LoaderResult<Vec<u64>>> + Send;

    /// Reads the column definitions of `table`, or `None` when it does not exist.
    fn describe_table(
        &self,
        table: &TableName,
    ) -> impl Future<Output = LoaderResult<Option<PersistedTable>>> + Send;
}
