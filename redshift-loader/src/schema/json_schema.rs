//! Translation of Singer JSON Schema documents into column types.

use std::collections::HashSet;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use serde_json::{Map, Value as JsonValue};

use crate::error::{ErrorKind, LoaderResult};
use crate::evolution::type_map::MAX_NUMERIC_PRECISION;
use crate::naming::FLATTEN_SEPARATOR;
use crate::schema::SemanticType;
use crate::{bail, loader_error};

/// Precision used for `singer.decimal` properties that do not declare one.
const DEFAULT_DECIMAL_PRECISION: u32 = MAX_NUMERIC_PRECISION;

/// Scale used for `singer.decimal` properties that do not declare one.
const DEFAULT_DECIMAL_SCALE: u32 = 6;

/// A property of the schema after flattening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    /// Source key, with nested names joined by `__`.
    pub key: String,
    pub ty: SemanticType,
}

/// Extracts the properties of a stream schema, in declaration order.
///
/// Objects with declared properties are flattened into `parent__child` keys while their
/// depth is below `max_level`. Deeper objects are kept as JSON.
pub fn parse_properties(schema: &JsonValue, max_level: u8) -> LoaderResult<Vec<Property>> {
    let Some(properties) = schema.get("properties").and_then(JsonValue::as_object) else {
        bail!(
            ErrorKind::InvalidSchema,
            "Schema does not declare a properties object"
        );
    };

    let mut collected = Vec::with_capacity(properties.len());
    collect_properties(properties, None, 0, max_level, &mut collected)?;

    Ok(collected)
}

fn collect_properties(
    properties: &Map<String, JsonValue>,
    prefix: Option<&str>,
    depth: u8,
    max_level: u8,
    collected: &mut Vec<Property>,
) -> LoaderResult<()> {
    for (name, property_schema) in properties {
        let key = match prefix {
            Some(prefix) => format!("{prefix}{FLATTEN_SEPARATOR}{name}"),
            None => name.clone(),
        };

        let nested = if depth < max_level {
            nested_properties(property_schema)
        } else {
            None
        };
        if let Some(nested) = nested {
            collect_properties(nested, Some(&key), depth + 1, max_level, collected)?;
            continue;
        }

        let ty = property_type(property_schema).map_err(|err| {
            loader_error!(
                ErrorKind::InvalidSchema,
                "Property has an unsupported type",
                format!("property `{key}`: {}", err.detail().unwrap_or_default())
            )
        })?;
        collected.push(Property { key, ty });
    }

    Ok(())
}

/// Returns the properties of an object schema that can be flattened.
fn nested_properties(schema: &JsonValue) -> Option<&Map<String, JsonValue>> {
    if !declared_types(schema).contains(&"object") {
        return None;
    }

    schema
        .get("properties")
        .and_then(JsonValue::as_object)
        .filter(|properties| !properties.is_empty())
}

fn declared_types(schema: &JsonValue) -> Vec<&str> {
    match schema.get("type") {
        Some(JsonValue::String(ty)) => vec![ty.as_str()],
        Some(JsonValue::Array(types)) => types.iter().filter_map(JsonValue::as_str).collect(),
        _ => Vec::new(),
    }
}

/// Resolves the type of a single property schema.
pub fn property_type(schema: &JsonValue) -> LoaderResult<SemanticType> {
    if let Some(variants) = schema.get("anyOf").and_then(JsonValue::as_array) {
        let mut candidates = Vec::with_capacity(variants.len());
        for variant in variants {
            if declared_types(variant) == ["null"] {
                continue;
            }
            candidates.push(property_type(variant)?);
        }

        // A date-time variant wins so that `anyOf: [date-time, string]` stays a timestamp.
        if candidates.contains(&SemanticType::Timestamp) {
            return Ok(SemanticType::Timestamp);
        }

        return Ok(candidates
            .into_iter()
            .next()
            .unwrap_or(SemanticType::String { max_length: None }));
    }

    if let Some(ty) = schema
        .get("type")
        .filter(|ty| !ty.is_string() && !ty.is_array())
    {
        bail!(
            ErrorKind::InvalidSchema,
            "Property type must be a string or an array",
            ty.to_string()
        );
    }

    let types: Vec<&str> = declared_types(schema)
        .into_iter()
        .filter(|ty| *ty != "null")
        .collect();

    match types.as_slice() {
        [] => Ok(SemanticType::String { max_length: None }),
        [single] => scalar_type(single, schema),
        many => {
            if many.iter().all(|ty| matches!(*ty, "integer" | "number")) {
                scalar_type("number", schema)
            } else if many.iter().any(|ty| matches!(*ty, "object" | "array")) {
                Ok(SemanticType::Json)
            } else {
                Ok(SemanticType::String { max_length: None })
            }
        }
    }
}

fn scalar_type(name: &str, schema: &JsonValue) -> LoaderResult<SemanticType> {
    let ty = match name {
        "boolean" => SemanticType::Boolean,
        "integer" => SemanticType::Integer,
        "number" => decimal_type(schema).unwrap_or(SemanticType::Float),
        "string" => match schema.get("format").and_then(JsonValue::as_str) {
            Some("date-time") => SemanticType::Timestamp,
            Some("date") => SemanticType::Date,
            Some("time") => SemanticType::Time,
            _ if is_singer_decimal(schema) => singer_decimal(schema),
            _ => SemanticType::String {
                max_length: schema
                    .get("maxLength")
                    .and_then(JsonValue::as_u64)
                    .and_then(|len| u32::try_from(len).ok()),
            },
        },
        "object" => SemanticType::Json,
        "array" => SemanticType::Array,
        other => bail!(
            ErrorKind::InvalidSchema,
            "Unsupported JSON schema type",
            other
        ),
    };

    Ok(ty)
}

fn is_singer_decimal(schema: &JsonValue) -> bool {
    schema.get("format").and_then(JsonValue::as_str) == Some("singer.decimal")
        || schema.get("singer.decimal").and_then(JsonValue::as_bool) == Some(true)
}

fn singer_decimal(schema: &JsonValue) -> SemanticType {
    let read = |field: &str| {
        schema
            .get(field)
            .and_then(JsonValue::as_u64)
            .and_then(|value| u32::try_from(value).ok())
    };

    let precision = read("precision")
        .unwrap_or(DEFAULT_DECIMAL_PRECISION)
        .clamp(1, MAX_NUMERIC_PRECISION);
    let scale = read("scale")
        .unwrap_or(DEFAULT_DECIMAL_SCALE)
        .min(precision.saturating_sub(1));

    SemanticType::Decimal { precision, scale }
}

/// Numbers declare a fixed scale through `multipleOf` (e.g. `0.01`) or `singer.decimal`.
fn decimal_type(schema: &JsonValue) -> Option<SemanticType> {
    if is_singer_decimal(schema) {
        return Some(singer_decimal(schema));
    }

    let multiple_of = schema.get("multipleOf")?.as_number()?;
    let decimal = BigDecimal::from_str(&multiple_of.to_string()).ok()?;
    let (_, exponent) = decimal.normalized().as_bigint_and_exponent();
    let scale = u32::try_from(exponent).ok().filter(|scale| *scale > 0)?;

    if scale >= MAX_NUMERIC_PRECISION {
        return None;
    }

    Some(SemanticType::Decimal {
        precision: MAX_NUMERIC_PRECISION,
        scale,
    })
}

/// Flattens nested record objects the same way [`parse_properties`] flattens the schema.
///
/// Objects whose key is a declared property are kept whole, so a JSON column receives the
/// object instead of its parts.
pub fn flatten_record(
    record: &Map<String, JsonValue>,
    max_level: u8,
    declared: &HashSet<String>,
) -> Map<String, JsonValue> {
    if max_level == 0 {
        return record.clone();
    }

    let mut flattened = Map::with_capacity(record.len());
    flatten_into(record, None, 0, max_level, declared, &mut flattened);
    flattened
}

fn flatten_into(
    object: &Map<String, JsonValue>,
    prefix: Option<&str>,
    depth: u8,
    max_level: u8,
    declared: &HashSet<String>,
    flattened: &mut Map<String, JsonValue>,
) {
    for (name, value) in object {
        let key = match prefix {
            Some(prefix) => format!("{prefix}{FLATTEN_SEPARATOR}{name}"),
            None => name.clone(),
        };

        match value {
            JsonValue::Object(nested) if depth < max_level && !declared.contains(key.as_str()) => {
                flatten_into(nested, Some(&key), depth + 1, max_level, declared, flattened);
            }
            _ => {
                flattened.insert(key, value.clone());
            }
        }
    }
}
