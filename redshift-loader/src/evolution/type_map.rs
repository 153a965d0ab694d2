//! Redshift column types and the widening rules between them.

use std::fmt;

use crate::schema::SemanticType;

/// Length used for strings without a declared `maxLength`.
pub const DEFAULT_VARCHAR_LENGTH: u32 = 10_000;

/// Largest `VARCHAR` Redshift supports.
pub const MAX_VARCHAR_LENGTH: u32 = 65_535;

/// Largest `NUMERIC` precision Redshift supports.
pub const MAX_NUMERIC_PRECISION: u32 = 38;

/// A column type as stored in the warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WarehouseType {
    Boolean,
    SmallInt,
    Integer,
    BigInt,
    Real,
    DoublePrecision,
    Numeric { precision: u32, scale: u32 },
    Varchar(u32),
    Char(u32),
    Date,
    Timestamp,
    TimestampTz,
    Time,
    TimeTz,
    /// A type this target never creates, such as `SUPER` or `GEOMETRY`.
    Other(String),
}

/// Coarse grouping used to tell a length or precision change from a change of kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFamily {
    Boolean,
    Integer,
    Float,
    Numeric,
    Text,
    Date,
    Timestamp,
    Time,
    Other,
}

impl WarehouseType {
    /// Builds a type from the columns of `information_schema.columns`.
    pub fn from_information_schema(
        data_type: &str,
        character_maximum_length: Option<i32>,
        numeric_precision: Option<i32>,
        numeric_scale: Option<i32>,
    ) -> WarehouseType {
        let length = character_maximum_length.and_then(|len| u32::try_from(len).ok());

        match data_type.trim().to_ascii_lowercase().as_str() {
            "boolean" => WarehouseType::Boolean,
            "smallint" => WarehouseType::SmallInt,
            "integer" => WarehouseType::Integer,
            "bigint" => WarehouseType::BigInt,
            "real" => WarehouseType::Real,
            "double precision" => WarehouseType::DoublePrecision,
            "numeric" | "decimal" => WarehouseType::Numeric {
                precision: numeric_precision
                    .and_then(|p| u32::try_from(p).ok())
                    .unwrap_or(18),
                scale: numeric_scale
                    .and_then(|s| u32::try_from(s).ok())
                    .unwrap_or(0),
            },
            "character varying" | "varchar" => {
                WarehouseType::Varchar(length.unwrap_or(MAX_VARCHAR_LENGTH))
            }
            "text" => WarehouseType::Varchar(length.unwrap_or(256)),
            "character" | "char" => WarehouseType::Char(length.unwrap_or(1)),
            "date" => WarehouseType::Date,
            "timestamp without time zone" | "timestamp" => WarehouseType::Timestamp,
            "timestamp with time zone" | "timestamptz" => WarehouseType::TimestampTz,
            "time without time zone" | "time" => WarehouseType::Time,
            "time with time zone" | "timetz" => WarehouseType::TimeTz,
            other => WarehouseType::Other(other.to_string()),
        }
    }

    pub fn family(&self) -> TypeFamily {
        match self {
            WarehouseType::Boolean => TypeFamily::Boolean,
            WarehouseType::SmallInt | WarehouseType::Integer | WarehouseType::BigInt => {
                TypeFamily::Integer
            }
            WarehouseType::Real | WarehouseType::DoublePrecision => TypeFamily::Float,
            WarehouseType::Numeric { .. } => TypeFamily::Numeric,
            WarehouseType::Varchar(_) | WarehouseType::Char(_) => TypeFamily::Text,
            WarehouseType::Date => TypeFamily::Date,
            WarehouseType::Timestamp | WarehouseType::TimestampTz => TypeFamily::Timestamp,
            WarehouseType::Time | WarehouseType::TimeTz => TypeFamily::Time,
            WarehouseType::Other(_) => TypeFamily::Other,
        }
    }

    pub fn is_varchar(&self) -> bool {
        matches!(self, WarehouseType::Varchar(_))
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, WarehouseType::Other(_))
    }

    /// Returns `true` when every value of `self` is representable in `target` without loss.
    pub fn can_widen_to(&self, target: &WarehouseType) -> bool {
        use WarehouseType::*;

        if self == target {
            return true;
        }

        match (self, target) {
            (SmallInt, Integer | BigInt) | (Integer, BigInt) => true,
            (SmallInt | Integer | BigInt | Real, DoublePrecision) => true,
            (SmallInt | Integer | BigInt, Numeric { precision, scale }) => {
                precision.saturating_sub(*scale) >= self.integer_digits()
            }
            (
                Numeric {
                    precision: from_precision,
                    scale: from_scale,
                },
                Numeric {
                    precision: to_precision,
                    scale: to_scale,
                },
            ) => {
                to_scale >= from_scale
                    && to_precision.saturating_sub(*to_scale)
                        >= from_precision.saturating_sub(*from_scale)
            }
            (Varchar(from) | Char(from), Varchar(to)) => to >= from,
            (Date, Timestamp | TimestampTz) | (Timestamp, TimestampTz) | (Time, TimeTz) => true,
            (source, Varchar(length)) => source.text_width().is_some_and(|width| *length >= width),
            _ => false,
        }
    }

    fn integer_digits(&self) -> u32 {
        match self {
            WarehouseType::SmallInt => 5,
            WarehouseType::Integer => 10,
            _ => 19,
        }
    }

    /// Length of the longest text rendering of a value of this type.
    fn text_width(&self) -> Option<u32> {
        match self {
            WarehouseType::Boolean => Some(5),
            WarehouseType::SmallInt => Some(6),
            WarehouseType::Integer => Some(11),
            WarehouseType::BigInt => Some(20),
            WarehouseType::Real => Some(16),
            WarehouseType::DoublePrecision => Some(32),
            WarehouseType::Numeric { precision, .. } => Some(precision + 2),
            WarehouseType::Char(length) | WarehouseType::Varchar(length) => Some(*length),
            WarehouseType::Date => Some(10),
            WarehouseType::Timestamp => Some(26),
            WarehouseType::TimestampTz => Some(32),
            WarehouseType::Time => Some(15),
            WarehouseType::TimeTz => Some(21),
            WarehouseType::Other(_) => None,
        }
    }
}

impl fmt::Display for WarehouseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WarehouseType::Boolean => f.write_str("BOOLEAN"),
            WarehouseType::SmallInt => f.write_str("SMALLINT"),
            WarehouseType::Integer => f.write_str("INTEGER"),
            WarehouseType::BigInt => f.write_str("BIGINT"),
            WarehouseType::Real => f.write_str("REAL"),
            WarehouseType::DoublePrecision => f.write_str("DOUBLE PRECISION"),
            WarehouseType::Numeric { precision, scale } => {
                write!(f, "NUMERIC({precision},{scale})")
            }
            WarehouseType::Varchar(length) => write!(f, "VARCHAR({length})"),
            WarehouseType::Char(length) => write!(f, "CHAR({length})"),
            WarehouseType::Date => f.write_str("DATE"),
            WarehouseType::Timestamp => f.write_str("TIMESTAMP"),
            WarehouseType::TimestampTz => f.write_str("TIMESTAMPTZ"),
            WarehouseType::Time => f.write_str("TIME"),
            WarehouseType::TimeTz => f.write_str("TIMETZ"),
            WarehouseType::Other(name) => f.write_str(name),
        }
    }
}

/// Maps a declared column type to the type this target creates for it.
pub fn warehouse_type(ty: &SemanticType) -> WarehouseType {
    match ty {
        SemanticType::Boolean => WarehouseType::Boolean,
        SemanticType::Integer => WarehouseType::BigInt,
        SemanticType::Float => WarehouseType::DoublePrecision,
        SemanticType::Decimal { precision, scale } => WarehouseType::Numeric {
            precision: *precision,
            scale: *scale,
        },
        SemanticType::String { max_length } => WarehouseType::Varchar(
            max_length
                .unwrap_or(DEFAULT_VARCHAR_LENGTH)
                .clamp(1, MAX_VARCHAR_LENGTH),
        ),
        SemanticType::Timestamp => WarehouseType::Timestamp,
        SemanticType::Date => WarehouseType::Date,
        SemanticType::Time => WarehouseType::Time,
        SemanticType::Json | SemanticType::Array => WarehouseType::Varchar(MAX_VARCHAR_LENGTH),
    }
}

/// A column as it currently exists in the warehouse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedColumn {
    pub name: String,
    pub ty: WarehouseType,
}

/// A table definition read back from the warehouse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedTable {
    pub columns: Vec<PersistedColumn>,
}

impl PersistedTable {
    pub fn column(&self, name: &str) -> Option<&PersistedColumn> {
        self.columns
            .iter()
            .find(|column| column.name.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_information_schema_types() {
        assert_eq!(
            WarehouseType::from_information_schema("character varying", Some(256), None, None),
            WarehouseType::Varchar(256)
        );
        assert_eq!(
            WarehouseType::from_information_schema("numeric", None, Some(18), Some(4)),
            WarehouseType::Numeric {
                precision: 18,
                scale: 4
            }
        );
        assert_eq!(
            WarehouseType::from_information_schema("timestamp without time zone", None, None, None),
            WarehouseType::Timestamp
        );
        assert_eq!(
            WarehouseType::from_information_schema("super", None, None, None),
            WarehouseType::Other("super".to_string())
        );
    }

    #[test]
    fn numeric_widening_requires_room_for_integer_and_fraction_digits() {
        let narrow = WarehouseType::Numeric {
            precision: 10,
            scale: 2,
        };

        assert!(narrow.can_widen_to(&WarehouseType::Numeric {
            precision: 12,
            scale: 4
        }));
        assert!(!narrow.can_widen_to(&WarehouseType::Numeric {
            precision: 10,
            scale: 4
        }));
        assert!(!WarehouseType::BigInt.can_widen_to(&WarehouseType::Numeric {
            precision: 18,
            scale: 0
        }));
    }

    #[test]
    fn nothing_narrows() {
        assert!(!WarehouseType::DoublePrecision.can_widen_to(&WarehouseType::BigInt));
        assert!(!WarehouseType::Varchar(100).can_widen_to(&WarehouseType::Varchar(10)));
        assert!(!WarehouseType::Timestamp.can_widen_to(&WarehouseType::Date));
        assert!(!WarehouseType::Varchar(10).can_widen_to(&WarehouseType::BigInt));
    }

    #[test]
    fn scalars_widen_to_wide_enough_varchar() {
        assert!(WarehouseType::BigInt.can_widen_to(&WarehouseType::Varchar(10_000)));
        assert!(!WarehouseType::BigInt.can_widen_to(&WarehouseType::Varchar(8)));
        assert!(WarehouseType::Boolean.can_widen_to(&WarehouseType::Varchar(5)));
    }

    #[test]
    fn string_lengths_are_capped() {
        assert_eq!(
            warehouse_type(&SemanticType::String {
                max_length: Some(1_000_000)
            }),
            WarehouseType::Varchar(MAX_VARCHAR_LENGTH)
        );
        assert_eq!(
            warehouse_type(&SemanticType::String { max_length: None }),
            WarehouseType::Varchar(DEFAULT_VARCHAR_LENGTH)
        );
        assert_eq!(
            warehouse_type(&SemanticType::Json).to_string(),
            "VARCHAR(65535)"
        );
    }
}
