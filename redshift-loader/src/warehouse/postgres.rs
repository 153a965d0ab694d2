use std::time::Duration;

use redshift_config::shared::WarehouseConfig;
use secrecy::ExposeSecret;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::error::LoaderResult;
use crate::evolution::type_map::{PersistedColumn, PersistedTable, WarehouseType};
use crate::naming::TableName;
use crate::warehouse::client::{SqlClient, Statement};

const APPLICATION_NAME: &str = "target-redshift";

/// Columns of a table, with domain types cast so they decode as plain text and integers.
const DESCRIBE_TABLE_QUERY: &str = "SELECT column_name::text AS column_name, \
     data_type::text AS data_type, \
     character_maximum_length::int AS character_maximum_length, \
     numeric_precision::int AS numeric_precision, \
     numeric_scale::int AS numeric_scale \
     FROM information_schema.columns \
     WHERE table_schema = $1 AND table_name = $2 \
     ORDER BY ordinal_position";

/// [`SqlClient`] over a `sqlx` connection pool speaking the Postgres wire protocol.
#[derive(Debug, Clone)]
pub struct PgSqlClient {
    pool: PgPool,
}

impl PgSqlClient {
    /// Creates a lazily connecting pool. Connections are opened on first use.
    pub fn connect_lazy(config: &WarehouseConfig) -> Self {
        let options = PgConnectOptions::new()
            .application_name(APPLICATION_NAME)
            .host(&config.host)
            .port(config.port)
            .username(&config.username)
            .database(&config.name)
            // Redshift rejects the startup parameter sqlx sets by default.
            .extra_float_digits(None::<i8>);
        let options = match &config.password {
            Some(password) => options.password(password.expose_secret()),
            None => options,
        };

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.connect_timeout_ms))
            .connect_lazy_with(options);

        Self { pool }
    }

    /// Checks that a connection can be opened.
    pub async fn ping(&self) -> LoaderResult<()> {
        sqlx::raw_sql("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

impl SqlClient for PgSqlClient {
    async fn execute(&self, sql: &str) -> LoaderResult<u64> {
        debug!(sql, "executing statement");
        let result = sqlx::raw_sql(sql).execute(&self.pool).await?;

        Ok(result.rows_affected())
    }

    async fn execute_transaction(&self, statements: Vec<Statement>) -> LoaderResult<Vec<u64>> {
        let mut transaction = self.pool.begin().await?;
        let mut rows_affected = Vec::with_capacity(statements.len());

        for statement in statements {
            debug!(sql = statement.sql(), "executing statement in transaction");
            match statement {
                Statement::Sql(sql) => {
                    let result = sqlx::query(&sql).execute(&mut *transaction).await?;
                    rows_affected.push(result.rows_affected());
                }
                Statement::CopyIn { sql, data } => {
                    let mut copy = transaction.copy_in_raw(&sql).await?;
                    copy.send(data).await?;
                    rows_affected.push(copy.finish().await?);
                }
            }
        }

        // Dropping the transaction on an early return rolls it back.
        transaction.commit().await?;

        Ok(rows_affected)
    }

    async fn describe_table(&self, table: &TableName) -> LoaderResult<Option<PersistedTable>> {
        let rows = sqlx::query(DESCRIBE_TABLE_QUERY)
            .bind(&table.schema)
            .bind(&table.name)
            .fetch_all(&self.pool)
            .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("column_name")?;
            let data_type: String = row.try_get("data_type")?;
            let ty = WarehouseType::from_information_schema(
                &data_type,
                row.try_get("character_maximum_length")?,
                row.try_get("numeric_precision")?,
                row.try_get("numeric_scale")?,
            );
            columns.push(PersistedColumn { name, ty });
        }

        Ok(Some(PersistedTable { columns }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_sql_client<C: SqlClient>(_client: &C) {}

    #[tokio::test]
    async fn pooled_client_serves_as_a_sql_client() {
        let config = WarehouseConfig {
            host: "localhost".to_string(),
            port: WarehouseConfig::DEFAULT_PORT,
            name: "dev".to_string(),
            username: "loader".to_string(),
            password: Some(secrecy::SecretString::new("secret".to_string())),
            max_connections: 1,
            connect_timeout_ms: 100,
        };

        let client = PgSqlClient::connect_lazy(&config);

        assert_sql_client(&client);
    }
}
