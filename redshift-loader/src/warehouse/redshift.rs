use bytes::Bytes;
use redshift_config::shared::StagingConfig;
use secrecy::ExposeSecret;
use tracing::{debug, info};

use crate::bail;
use crate::error::{ErrorKind, LoaderResult};
use crate::evolution::SchemaChange;
use crate::evolution::type_map::PersistedTable;
use crate::naming::TableName;
use crate::staging::StagedLocation;
use crate::warehouse::base::{LoadOutcome, LoadRequest, Warehouse};
use crate::warehouse::client::{SqlClient, Statement};
use crate::warehouse::sql::{self, CopyCredentials, CopySource};

/// How `COPY` reaches the staged objects.
#[derive(Debug, Clone)]
enum CopySettings {
    S3 {
        credentials: CopyCredentials,
        region: String,
        options: String,
    },
    /// Staged files are read locally and streamed over the connection.
    Stdin,
}

/// [`Warehouse`] rendering Redshift SQL over a [`SqlClient`].
#[derive(Debug, Clone)]
pub struct RedshiftWarehouse<C> {
    client: C,
    copy: CopySettings,
}

impl<C> RedshiftWarehouse<C>
where
    C: SqlClient,
{
    pub fn new(client: C, staging: &StagingConfig, copy_options: &str) -> LoaderResult<Self> {
        let copy = match staging {
            StagingConfig::S3 {
                region,
                access_key_id,
                secret_access_key,
                iam_role,
                ..
            } => {
                let credentials = match (iam_role, access_key_id, secret_access_key) {
                    (Some(role), _, _) => CopyCredentials::IamRole(role.clone()),
                    (None, Some(access_key_id), Some(secret_access_key)) => {
                        CopyCredentials::AccessKey {
                            access_key_id: access_key_id.clone(),
                            secret_access_key: secret_access_key.expose_secret().to_string(),
                        }
                    }
                    _ => bail!(
                        ErrorKind::ConfigError,
                        "S3 staging needs an IAM role or an access key pair for COPY"
                    ),
                };

                CopySettings::S3 {
                    credentials,
                    region: region.clone(),
                    options: copy_options.to_string(),
                }
            }
            StagingConfig::Local { .. } => CopySettings::Stdin,
        };

        Ok(Self { client, copy })
    }

    async fn grant(&self, table: &TableName, select_permissions: &[String]) -> LoaderResult<()> {
        for statement in sql::grant_select(table, select_permissions) {
            self.client.execute(&statement).await?;
        }
        Ok(())
    }
}

impl<C> Warehouse for RedshiftWarehouse<C>
where
    C: SqlClient,
{
    async fn describe_table(&self, table: &TableName) -> LoaderResult<Option<PersistedTable>> {
        self.client.describe_table(table).await
    }

    async fn apply_schema_change(
        &self,
        change: &SchemaChange,
        select_permissions: &[String],
    ) -> LoaderResult<()> {
        let statements = sql::schema_change(change);
        info!(table = %change.table(), ?statements, "applying schema change");

        if change.requires_autocommit() {
            for statement in &statements {
                self.client.execute(statement).await?;
            }
        } else {
            self.client
                .execute_transaction(statements.into_iter().map(Statement::from).collect())
                .await?;
        }

        if matches!(
            change,
            SchemaChange::CreateTable { .. } | SchemaChange::RebuildTable { .. }
        ) {
            self.grant(change.table(), select_permissions).await?;
        }

        Ok(())
    }

    async fn load(&self, request: LoadRequest<'_>) -> LoaderResult<LoadOutcome> {
        let stage = sql::stage_table_name(request.table, request.batch_id);

        let (source, data) = match (&self.copy, &request.object.location) {
            (
                CopySettings::S3 {
                    credentials,
                    region,
                    options,
                },
                StagedLocation::S3 { uri },
            ) => (
                CopySource::S3 {
                    uri,
                    credentials,
                    region,
                    options,
                },
                None,
            ),
            (CopySettings::Stdin, StagedLocation::Local { path }) => {
                (CopySource::Stdin, Some(tokio::fs::read(path).await?))
            }
            (_, location) => bail!(
                ErrorKind::InvalidState,
                "Staged object location does not match the staging mode",
                format!("{location:?}")
            ),
        };

        let plan = sql::merge_statements(
            request.table,
            &stage,
            request.columns,
            request.primary_keys,
            request.mode,
            source,
        );

        let mut data = data.map(Bytes::from);
        let statements = plan
            .statements
            .into_iter()
            .enumerate()
            .map(|(index, sql)| match data.take() {
                Some(data) if index == plan.copy_index => Statement::CopyIn { sql, data },
                pending => {
                    data = pending;
                    Statement::Sql(sql)
                }
            })
            .collect::<Vec<_>>();

        debug!(
            table = %request.table,
            batch_id = %request.batch_id,
            statements = statements.len(),
            "merging staged batch"
        );
        let rows_affected = self.client.execute_transaction(statements).await?;
        let rows_loaded = rows_affected
            .get(plan.insert_index)
            .copied()
            .unwrap_or_default();

        Ok(LoadOutcome { rows_loaded })
    }

    async fn swap_table(&self, table: &TableName, shadow: &TableName) -> LoaderResult<bool> {
        if self.client.describe_table(shadow).await?.is_none() {
            return Ok(false);
        }

        self.client
            .execute_transaction(vec![
                Statement::Sql(sql::drop_table_if_exists(table)),
                Statement::Sql(sql::rename_table(shadow, &table.name)),
            ])
            .await?;
        info!(table = %table, shadow = %shadow, "swapped in activated table version");

        Ok(true)
    }
}
