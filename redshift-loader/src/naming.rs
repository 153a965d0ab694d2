//! Mapping of stream and property names to warehouse identifiers.

use std::fmt;

use pg_escape::quote_identifier;
use redshift_config::shared::LoaderConfig;

/// Longest identifier Redshift accepts, in bytes.
pub const MAX_IDENTIFIER_LENGTH: usize = 127;

/// Separator joining nested property names when objects are flattened.
pub const FLATTEN_SEPARATOR: &str = "__";

/// Normalizes a name into a Redshift identifier.
///
/// The result is lowercase, contains only `[a-z0-9_]`, does not start with a digit and is
/// at most [`MAX_IDENTIFIER_LENGTH`] bytes long.
pub fn sanitize_identifier(name: &str) -> String {
    let mut sanitized: String = name
        .trim()
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() {
        sanitized.push('_');
    }

    if sanitized.starts_with(|c: char| c.is_ascii_digit()) {
        sanitized.insert(0, '_');
    }

    sanitized.truncate(MAX_IDENTIFIER_LENGTH);
    sanitized
}

/// Schema-qualified table name in the warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Returns `"schema"."name"` quoted for use in SQL.
    pub fn quoted(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.schema),
            quote_identifier(&self.name)
        )
    }

    /// Returns a sibling table whose name carries `suffix`, truncated to the identifier limit.
    pub fn with_suffix(&self, suffix: &str) -> TableName {
        let keep = MAX_IDENTIFIER_LENGTH.saturating_sub(suffix.len());
        let mut name = self.name.clone();
        name.truncate(keep);
        name.push_str(suffix);

        TableName {
            schema: self.schema.clone(),
            name,
        }
    }

    /// Shadow table receiving records of a not yet activated table version.
    pub fn versioned(&self, version: u64) -> TableName {
        self.with_suffix(&format!("__v{version}"))
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Where a stream's records land and who can read them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub table: TableName,
    pub select_permissions: Vec<String>,
}

/// Resolves the target table of a stream.
///
/// Stream names follow `<table>`, `<schema>-<table>` or `<catalog>-<schema>-<table>`. The
/// source schema selects an entry of `schema_mapping`, falling back to
/// `default_target_schema`. A per-stream override wins over both.
pub fn resolve_stream_target(stream: &str, config: &LoaderConfig) -> StreamTarget {
    let parts: Vec<&str> = stream.split('-').collect();
    let (source_schema, table) = match parts.as_slice() {
        [table] => (None, table.to_string()),
        [schema, table] => (Some(*schema), table.to_string()),
        [_catalog, schema, rest @ ..] => (Some(*schema), rest.join("_")),
        [] => (None, stream.to_string()),
    };

    let mapping = source_schema.and_then(|schema| config.schema_mapping.get(schema));
    let stream_override = config.streams.get(stream);

    let schema = stream_override
        .and_then(|o| o.target_schema.clone())
        .or_else(|| mapping.map(|m| m.target_schema.clone()))
        .unwrap_or_else(|| config.default_target_schema.clone());

    let table = stream_override
        .and_then(|o| o.table_name.clone())
        .unwrap_or(table);

    let select_permissions = match mapping {
        Some(mapping) if !mapping.select_permissions.is_empty() => {
            mapping.select_permissions.clone()
        }
        _ => config.default_select_permissions.clone(),
    };

    StreamTarget {
        table: TableName::new(sanitize_identifier(&schema), sanitize_identifier(&table)),
        select_permissions,
    }
}

#[cfg(test)]
mod tests {
    use redshift_config::shared::{SchemaMappingEntry, StreamOverride};

    use super::*;

    #[test]
    fn sanitize_lowercases_and_replaces_invalid_characters() {
        assert_eq!(sanitize_identifier("Order Items"), "order_items");
        assert_eq!(sanitize_identifier("price$usd"), "price_usd");
        assert_eq!(sanitize_identifier("2fa_enabled"), "_2fa_enabled");
        assert_eq!(sanitize_identifier(""), "_");
    }

    #[test]
    fn sanitize_truncates_long_names() {
        let long = "a".repeat(300);
        assert_eq!(sanitize_identifier(&long).len(), MAX_IDENTIFIER_LENGTH);
    }

    #[test]
    fn plain_stream_uses_default_schema() {
        let config = LoaderConfig::default();

        let target = resolve_stream_target("Users", &config);

        assert_eq!(target.table, TableName::new("public", "users"));
    }

    #[test]
    fn schema_mapping_applies_to_prefixed_streams() {
        let mut config = LoaderConfig::default();
        config.default_select_permissions = vec!["readers".to_string()];
        config.schema_mapping.insert(
            "crm".to_string(),
            SchemaMappingEntry {
                target_schema: "analytics".to_string(),
                select_permissions: vec!["bi".to_string()],
            },
        );

        let mapped = resolve_stream_target("crm-accounts", &config);
        assert_eq!(mapped.table, TableName::new("analytics", "accounts"));
        assert_eq!(mapped.select_permissions, vec!["bi".to_string()]);

        let unmapped = resolve_stream_target("erp-invoices", &config);
        assert_eq!(unmapped.table, TableName::new("public", "invoices"));
        assert_eq!(unmapped.select_permissions, vec!["readers".to_string()]);
    }

    #[test]
    fn catalog_prefixed_stream_uses_middle_part_as_schema() {
        let mut config = LoaderConfig::default();
        config.schema_mapping.insert(
            "sales".to_string(),
            SchemaMappingEntry {
                target_schema: "dw".to_string(),
                select_permissions: vec![],
            },
        );

        let target = resolve_stream_target("db-sales-order-lines", &config);

        assert_eq!(target.table, TableName::new("dw", "order_lines"));
    }

    #[test]
    fn stream_override_wins() {
        let mut config = LoaderConfig::default();
        config.streams.insert(
            "crm-accounts".to_string(),
            StreamOverride {
                target_schema: Some("raw".to_string()),
                table_name: Some("Accounts_V2".to_string()),
                primary_keys: None,
            },
        );

        let target = resolve_stream_target("crm-accounts", &config);

        assert_eq!(target.table, TableName::new("raw", "accounts_v2"));
    }

    #[test]
    fn versioned_and_suffixed_names_respect_the_length_limit() {
        let table = TableName::new("public", "x".repeat(MAX_IDENTIFIER_LENGTH));

        let shadow = table.versioned(1700000000000);

        assert_eq!(shadow.name.len(), MAX_IDENTIFIER_LENGTH);
        assert!(shadow.name.ends_with("__v1700000000000"));
    }
}
