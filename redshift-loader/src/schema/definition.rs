use std::collections::HashSet;

use crate::bail;
use crate::error::{ErrorKind, LoaderResult};
use crate::schema::{DELETED_AT_COLUMN, SemanticType};

/// Where a column's value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSource {
    /// A record property, by its flattened source key.
    Property(String),
    /// The `time_extracted` of the RECORD message.
    ExtractedAt,
    /// The flush time of the batch.
    BatchedAt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Sanitized warehouse column name.
    pub name: String,
    pub ty: SemanticType,
    pub source: ColumnSource,
}

impl Column {
    pub fn property(name: impl Into<String>, key: impl Into<String>, ty: SemanticType) -> Self {
        Self {
            name: name.into(),
            ty,
            source: ColumnSource::Property(key.into()),
        }
    }
}

/// Ordered column set of a stream plus its primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSchema {
    columns: Vec<Column>,
    primary_keys: Vec<String>,
}

impl StreamSchema {
    /// Builds a schema, rejecting duplicate column names and unknown primary-key columns.
    pub fn new(columns: Vec<Column>, primary_keys: Vec<String>) -> LoaderResult<Self> {
        let mut seen = HashSet::with_capacity(columns.len());
        for column in &columns {
            if !seen.insert(column.name.to_ascii_lowercase()) {
                bail!(
                    ErrorKind::InvalidSchema,
                    "Duplicate column name after sanitization",
                    format!("column `{}` appears more than once", column.name)
                );
            }
        }

        for key in &primary_keys {
            if !seen.contains(&key.to_ascii_lowercase()) {
                bail!(
                    ErrorKind::InvalidSchema,
                    "Primary key column is not part of the schema",
                    format!("primary key `{key}` is missing from the properties")
                );
            }
        }

        Ok(Self {
            columns,
            primary_keys,
        })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn primary_keys(&self) -> &[String] {
        &self.primary_keys
    }

    pub fn has_primary_key(&self) -> bool {
        !self.primary_keys.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }

    /// Positions of the primary-key columns, in key order.
    pub fn primary_key_indices(&self) -> Vec<usize> {
        self.primary_keys
            .iter()
            .filter_map(|key| self.index_of(key))
            .collect()
    }

    pub fn deleted_at_index(&self) -> Option<usize> {
        self.index_of(DELETED_AT_COLUMN)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|column| column.name.as_str())
    }

    /// Returns the property key feeding each column, if any.
    pub fn property_keys(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().filter_map(|column| match &column.source {
            ColumnSource::Property(key) => Some(key.as_str()),
            _ => None,
        })
    }
}
