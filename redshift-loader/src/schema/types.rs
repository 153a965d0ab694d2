use std::fmt;

use serde_json::Value as JsonValue;

use crate::evolution::type_map::warehouse_type;

/// Declared type of a column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SemanticType {
    Boolean,
    Integer,
    Float,
    Decimal { precision: u32, scale: u32 },
    String { max_length: Option<u32> },
    Timestamp,
    Date,
    Time,
    Json,
    Array,
}

impl SemanticType {
    /// Infers a type from a value that arrived without a declared schema.
    ///
    /// Returns `None` for nulls, which carry no type information.
    pub fn infer(value: &JsonValue) -> Option<SemanticType> {
        match value {
            JsonValue::Null => None,
            JsonValue::Bool(_) => Some(SemanticType::Boolean),
            JsonValue::Number(number) if number.is_i64() || number.is_u64() => {
                Some(SemanticType::Integer)
            }
            JsonValue::Number(_) => Some(SemanticType::Float),
            JsonValue::String(_) => Some(SemanticType::String { max_length: None }),
            JsonValue::Array(_) => Some(SemanticType::Array),
            JsonValue::Object(_) => Some(SemanticType::Json),
        }
    }

    /// Returns `true` when a column of this type can be changed to `target` without loss.
    pub fn can_widen_to(&self, target: &SemanticType) -> bool {
        warehouse_type(self).can_widen_to(&warehouse_type(target))
    }

    /// Returns `true` when both types store the same kind of value and differ at most in
    /// length or precision.
    pub fn same_family(&self, other: &SemanticType) -> bool {
        warehouse_type(self).family() == warehouse_type(other).family()
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SemanticType::Boolean => f.write_str("boolean"),
            SemanticType::Integer => f.write_str("integer"),
            SemanticType::Float => f.write_str("float"),
            SemanticType::Decimal { precision, scale } => {
                write!(f, "decimal({precision},{scale})")
            }
            SemanticType::String {
                max_length: Some(max_length),
            } => write!(f, "string({max_length})"),
            SemanticType::String { max_length: None } => f.write_str("string"),
            SemanticType::Timestamp => f.write_str("timestamp"),
            SemanticType::Date => f.write_str("date"),
            SemanticType::Time => f.write_str("time"),
            SemanticType::Json => f.write_str("json"),
            SemanticType::Array => f.write_str("array"),
        }
    }
}
