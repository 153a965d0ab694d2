use std::mem;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde_json::Value as JsonValue;

use crate::types::SizeHint;

/// A record field after coercion to its column's declared type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Decimal(BigDecimal),
    String(String),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
    /// Objects and arrays, stored as serialized JSON.
    Json(JsonValue),
}

/// Text format of timestamps in staged files and key comparisons.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Renders the value the way the warehouse parses it back. `None` for nulls.
    pub fn to_text(&self) -> Option<String> {
        let text = match self {
            Value::Null => return None,
            Value::Boolean(value) => value.to_string(),
            Value::Integer(value) => value.to_string(),
            Value::Float(value) => value.to_string(),
            Value::Decimal(value) => value.to_plain_string(),
            Value::String(value) => value.clone(),
            Value::Timestamp(value) => value.format(TIMESTAMP_FORMAT).to_string(),
            Value::Date(value) => value.format("%Y-%m-%d").to_string(),
            Value::Time(value) => value.format("%H:%M:%S%.6f").to_string(),
            Value::Json(value) => value.to_string(),
        };

        Some(text)
    }
}

impl SizeHint for Value {
    fn size_hint(&self) -> usize {
        let heap = match self {
            Value::Decimal(decimal) => decimal.digits() as usize / 2 + 8,
            Value::String(string) => string.len(),
            Value::Json(json) => json_size_hint(json),
            Value::Null
            | Value::Boolean(_)
            | Value::Integer(_)
            | Value::Float(_)
            | Value::Timestamp(_)
            | Value::Date(_)
            | Value::Time(_) => 0,
        };

        mem::size_of::<Value>() + heap
    }
}

fn json_size_hint(json: &JsonValue) -> usize {
    match json {
        JsonValue::Null | JsonValue::Bool(_) | JsonValue::Number(_) => 8,
        JsonValue::String(string) => string.len() + 2,
        JsonValue::Array(items) => items.iter().map(json_size_hint).sum::<usize>() + 2,
        JsonValue::Object(map) => {
            map.iter()
                .map(|(key, value)| key.len() + 3 + json_size_hint(value))
                .sum::<usize>()
                + 2
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn size_grows_with_payload() {
        let small = Value::String("a".to_string());
        let large = Value::String("a".repeat(1024));

        assert!(large.size_hint() >= small.size_hint() + 1023);
        assert!(Value::Json(json!({"k": "value"})).size_hint() > Value::Null.size_hint());
    }

    #[test]
    fn text_rendering_matches_warehouse_formats() {
        let timestamp = DateTime::parse_from_rfc3339("2024-03-01T10:20:30.5Z")
            .unwrap()
            .with_timezone(&Utc);

        assert_eq!(Value::Null.to_text(), None);
        assert_eq!(
            Value::Timestamp(timestamp).to_text().as_deref(),
            Some("2024-03-01 10:20:30.500000")
        );
        assert_eq!(
            Value::Json(json!({"a": [1, 2]})).to_text().as_deref(),
            Some(r#"{"a":[1,2]}"#)
        );
        assert_eq!(Value::Boolean(true).to_text().as_deref(), Some("true"));
    }
}
