use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use redshift_config::shared::{LoaderConfig, UnknownColumnsPolicy};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::bail;
use crate::error::{ErrorKind, LoaderResult};
use crate::naming::{StreamTarget, TableName, resolve_stream_target, sanitize_identifier};
use crate::protocol::SchemaMessage;
use crate::schema::json_schema::{flatten_record, parse_properties};
use crate::schema::{
    BATCHED_AT_COLUMN, Column, ColumnSource, DELETED_AT_COLUMN, EXTRACTED_AT_COLUMN,
    SemanticType, StreamSchema,
};

/// What a SCHEMA message or an evolving record did to a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaUpdate {
    /// The stream did not exist before.
    Created,
    /// The schema is identical to the current one.
    Unchanged,
    /// The schema changed. `added` lists new columns in the order they were introduced.
    Changed { added: Vec<String> },
}

/// Current state of one stream.
#[derive(Debug, Clone)]
pub struct StreamState {
    name: String,
    target: StreamTarget,
    schema: Arc<StreamSchema>,
    /// Flattened property keys declared by the tap. Objects under these keys stay whole.
    declared_keys: HashSet<String>,
    active_version: Option<u64>,
}

impl StreamState {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &StreamTarget {
        &self.target
    }

    pub fn schema(&self) -> &Arc<StreamSchema> {
        &self.schema
    }

    pub fn active_version(&self) -> Option<u64> {
        self.active_version
    }

    /// Table receiving records of `version`.
    ///
    /// Records without a version, or with the active one, go to the stream's table. Any other
    /// version goes to its shadow table until it is activated.
    pub fn table_for_version(&self, version: Option<u64>) -> TableName {
        match version {
            Some(version) if self.active_version != Some(version) => {
                self.target.table.versioned(version)
            }
            _ => self.target.table.clone(),
        }
    }

    /// Flattens a record to the key layout of the schema.
    pub fn flatten(
        &self,
        record: &Map<String, JsonValue>,
        max_level: u8,
    ) -> Map<String, JsonValue> {
        flatten_record(record, max_level, &self.declared_keys)
    }
}

/// Registry of every stream seen so far, keyed by stream name.
#[derive(Debug)]
pub struct StreamRegistry {
    config: Arc<LoaderConfig>,
    streams: HashMap<String, StreamState>,
}

impl StreamRegistry {
    pub fn new(config: Arc<LoaderConfig>) -> Self {
        Self {
            config,
            streams: HashMap::new(),
        }
    }

    /// Registers a stream or replaces its schema with a compatible one.
    ///
    /// Columns missing from the new schema are kept, since a column is never dropped from the
    /// warehouse. A column whose type narrows in a way that cannot be widened back fails with
    /// [`ErrorKind::IncompatibleSchemaChange`].
    pub fn register_or_update_schema(
        &mut self,
        message: &SchemaMessage,
    ) -> LoaderResult<SchemaUpdate> {
        let declared = self.build_schema(message)?;
        let declared_keys = declared
            .property_keys()
            .map(str::to_string)
            .collect::<HashSet<_>>();

        let Some(state) = self.streams.get_mut(&message.stream) else {
            let target = resolve_stream_target(&message.stream, &self.config);
            info!(
                stream = %message.stream,
                table = %target.table,
                columns = declared.columns().len(),
                "registered stream"
            );

            self.streams.insert(
                message.stream.clone(),
                StreamState {
                    name: message.stream.clone(),
                    target,
                    schema: Arc::new(declared),
                    declared_keys,
                    active_version: None,
                },
            );

            return Ok(SchemaUpdate::Created);
        };

        let (merged, added) = merge_schemas(&message.stream, &state.schema, declared)?;
        state.declared_keys.extend(declared_keys);

        if merged == *state.schema {
            return Ok(SchemaUpdate::Unchanged);
        }

        info!(
            stream = %message.stream,
            added = ?added,
            "stream schema changed"
        );
        state.schema = Arc::new(merged);

        Ok(SchemaUpdate::Changed { added })
    }

    /// Returns the state of a stream, failing with [`ErrorKind::UnknownStream`] when no SCHEMA
    /// message registered it.
    pub fn get(&self, stream: &str) -> LoaderResult<&StreamState> {
        match self.streams.get(stream) {
            Some(state) => Ok(state),
            None => bail!(
                ErrorKind::UnknownStream,
                "Message references a stream without a prior SCHEMA message",
                format!("stream `{stream}`")
            ),
        }
    }

    /// Adds columns for record keys the schema does not declare, when the loader evolves on
    /// unknown columns.
    ///
    /// Types are inferred from the values. Null values carry no type and are skipped until a
    /// non-null value shows up.
    pub fn evolve_from_record(
        &mut self,
        stream: &str,
        record: &Map<String, JsonValue>,
    ) -> LoaderResult<SchemaUpdate> {
        if self.config.unknown_columns != UnknownColumnsPolicy::Evolve {
            return Ok(SchemaUpdate::Unchanged);
        }

        let Some(state) = self.streams.get_mut(stream) else {
            bail!(
                ErrorKind::UnknownStream,
                "Message references a stream without a prior SCHEMA message",
                format!("stream `{stream}`")
            );
        };

        let mut columns = state.schema.columns().to_vec();
        let mut added = Vec::new();
        for (key, value) in record {
            if state.declared_keys.contains(key) {
                continue;
            }
            let Some(ty) = SemanticType::infer(value) else {
                continue;
            };

            let name = sanitize_identifier(key);
            if columns
                .iter()
                .any(|column| column.name.eq_ignore_ascii_case(&name))
            {
                debug!(
                    stream,
                    key = %key,
                    column = %name,
                    "unknown key collides with a column, dropping it"
                );
                continue;
            }

            columns.push(Column::property(name.clone(), key.clone(), ty));
            state.declared_keys.insert(key.clone());
            added.push(name);
        }

        if added.is_empty() {
            return Ok(SchemaUpdate::Unchanged);
        }

        let schema = StreamSchema::new(columns, state.schema.primary_keys().to_vec())?;
        info!(stream, added = ?added, "evolved stream schema from record keys");
        state.schema = Arc::new(schema);

        Ok(SchemaUpdate::Changed { added })
    }

    /// Marks `version` as the active table version of a stream.
    pub fn set_active_version(&mut self, stream: &str, version: u64) -> LoaderResult<()> {
        let Some(state) = self.streams.get_mut(stream) else {
            bail!(
                ErrorKind::UnknownStream,
                "ACTIVATE_VERSION references a stream without a prior SCHEMA message",
                format!("stream `{stream}`")
            );
        };

        state.active_version = Some(version);
        Ok(())
    }

    /// Translates a SCHEMA message into columns and primary keys.
    fn build_schema(&self, message: &SchemaMessage) -> LoaderResult<StreamSchema> {
        let properties = parse_properties(&message.schema, self.config.data_flattening_max_level)
            .map_err(|err| {
                err.reclassify(ErrorKind::InvalidSchema, "Stream schema cannot be parsed")
            })?;

        let mut columns = properties
            .into_iter()
            .map(|property| {
                Column::property(sanitize_identifier(&property.key), property.key, property.ty)
            })
            .collect::<Vec<_>>();

        if self.config.metadata_columns_enabled() {
            for (name, source) in [
                (EXTRACTED_AT_COLUMN, ColumnSource::ExtractedAt),
                (BATCHED_AT_COLUMN, ColumnSource::BatchedAt),
                (
                    DELETED_AT_COLUMN,
                    ColumnSource::Property(DELETED_AT_COLUMN.to_string()),
                ),
            ] {
                if columns.iter().any(|column| column.name == name) {
                    continue;
                }
                columns.push(Column {
                    name: name.to_string(),
                    ty: SemanticType::Timestamp,
                    source,
                });
            }
        }

        let key_properties = self
            .config
            .streams
            .get(&message.stream)
            .and_then(|stream| stream.primary_keys.clone())
            .unwrap_or_else(|| message.key_properties.clone());

        if self.config.primary_key_required && key_properties.is_empty() {
            bail!(
                ErrorKind::InvalidSchema,
                "Stream has no primary key and primary keys are required",
                format!("stream `{}`", message.stream)
            );
        }

        let primary_keys = key_properties
            .iter()
            .map(|key| sanitize_identifier(key))
            .collect();

        StreamSchema::new(columns, primary_keys)
    }
}

/// Reconciles a new declared schema with the current one.
///
/// Existing columns keep their position. A type that widens is replaced, a type that narrows
/// within the same family keeps the wider existing type, and anything else is incompatible.
/// New columns are appended in declaration order.
fn merge_schemas(
    stream: &str,
    current: &StreamSchema,
    declared: StreamSchema,
) -> LoaderResult<(StreamSchema, Vec<String>)> {
    let mut columns = Vec::with_capacity(current.columns().len() + declared.columns().len());

    for existing in current.columns() {
        let incoming = declared
            .columns()
            .iter()
            .find(|column| column.name.eq_ignore_ascii_case(&existing.name));

        let Some(incoming) = incoming else {
            warn!(
                stream,
                column = %existing.name,
                "column missing from new schema, keeping it as nullable"
            );
            columns.push(existing.clone());
            continue;
        };

        let ty = if existing.ty.can_widen_to(&incoming.ty) {
            incoming.ty.clone()
        } else if existing.ty.same_family(&incoming.ty) && incoming.ty.can_widen_to(&existing.ty) {
            existing.ty.clone()
        } else {
            bail!(
                ErrorKind::IncompatibleSchemaChange,
                "Column type changed in a way that cannot be widened",
                format!(
                    "stream `{stream}` column `{}`: {} -> {}",
                    existing.name, existing.ty, incoming.ty
                )
            );
        };

        columns.push(Column {
            name: existing.name.clone(),
            ty,
            source: incoming.source.clone(),
        });
    }

    let mut added = Vec::new();
    for column in declared.columns() {
        let known = current
            .columns()
            .iter()
            .any(|existing| existing.name.eq_ignore_ascii_case(&column.name));
        if !known {
            added.push(column.name.clone());
            columns.push(column.clone());
        }
    }

    let schema = StreamSchema::new(columns, declared.primary_keys().to_vec())?;
    Ok((schema, added))
}
