//! Pure coercion of JSON record values to declared column types.
//!
//! Each target type has its own function matching every JSON variant, so a new variant on
//! either side fails to compile until it is handled.

use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::{Number, Value as JsonValue};

use crate::schema::SemanticType;
use crate::types::Value;

/// Longest excerpt of an offending value kept in error messages.
const MAX_EXCERPT_LEN: usize = 64;

const NAIVE_DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

const TIME_FORMATS: &[&str] = &["%H:%M:%S%.f", "%H:%M"];

/// A value that does not fit its column's declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoercionError {
    pub expected: SemanticType,
    pub found: String,
    pub reason: &'static str,
}

impl CoercionError {
    fn new(expected: &SemanticType, found: &JsonValue, reason: &'static str) -> Self {
        let mut excerpt = found.to_string();
        if excerpt.len() > MAX_EXCERPT_LEN {
            let mut cut = MAX_EXCERPT_LEN;
            while !excerpt.is_char_boundary(cut) {
                cut -= 1;
            }
            excerpt.truncate(cut);
            excerpt.push_str("...");
        }

        Self {
            expected: expected.clone(),
            found: excerpt,
            reason,
        }
    }
}

impl fmt::Display for CoercionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot coerce {} to {}: {}",
            self.found, self.expected, self.reason
        )
    }
}

impl std::error::Error for CoercionError {}

/// Coerces `value` to `ty`. Nulls are accepted for every type.
pub fn coerce(value: &JsonValue, ty: &SemanticType) -> Result<Value, CoercionError> {
    match ty {
        SemanticType::Boolean => to_boolean(value, ty),
        SemanticType::Integer => to_integer(value, ty),
        SemanticType::Float => to_float(value, ty),
        SemanticType::Decimal { precision, scale } => to_decimal(value, ty, *precision, *scale),
        SemanticType::String { .. } => to_string(value, ty),
        SemanticType::Timestamp => to_timestamp(value, ty),
        SemanticType::Date => to_date(value, ty),
        SemanticType::Time => to_time(value, ty),
        SemanticType::Json => Ok(to_json(value)),
        SemanticType::Array => to_array(value, ty),
    }
}

fn to_boolean(value: &JsonValue, ty: &SemanticType) -> Result<Value, CoercionError> {
    match value {
        JsonValue::Null => Ok(Value::Null),
        JsonValue::Bool(b) => Ok(Value::Boolean(*b)),
        JsonValue::Number(n) => match n.as_i64() {
            Some(0) => Ok(Value::Boolean(false)),
            Some(1) => Ok(Value::Boolean(true)),
            _ => Err(CoercionError::new(ty, value, "only 0 and 1 are booleans")),
        },
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "1" => Ok(Value::Boolean(true)),
            "false" | "f" | "no" | "n" | "0" => Ok(Value::Boolean(false)),
            _ => Err(CoercionError::new(ty, value, "unrecognized boolean literal")),
        },
        JsonValue::Array(_) | JsonValue::Object(_) => {
            Err(CoercionError::new(ty, value, "composite value"))
        }
    }
}

fn to_integer(value: &JsonValue, ty: &SemanticType) -> Result<Value, CoercionError> {
    match value {
        JsonValue::Null => Ok(Value::Null),
        JsonValue::Number(n) => {
            integral_number(n).ok_or_else(|| CoercionError::new(ty, value, "not a 64-bit integer"))
        }
        JsonValue::String(s) => {
            let trimmed = s.trim();
            if let Ok(integer) = trimmed.parse::<i64>() {
                return Ok(Value::Integer(integer));
            }

            trimmed
                .parse::<f64>()
                .ok()
                .and_then(integral_float)
                .ok_or_else(|| CoercionError::new(ty, value, "not a 64-bit integer"))
        }
        JsonValue::Bool(_) | JsonValue::Array(_) | JsonValue::Object(_) => {
            Err(CoercionError::new(ty, value, "not a number"))
        }
    }
}

fn integral_number(n: &Number) -> Option<Value> {
    if let Some(integer) = n.as_i64() {
        return Some(Value::Integer(integer));
    }

    if n.is_u64() {
        return None;
    }

    n.as_f64().and_then(integral_float)
}

fn integral_float(float: f64) -> Option<Value> {
    // i64::MAX is not exactly representable, so the upper bound is exclusive.
    let in_range = float >= i64::MIN as f64 && float < i64::MAX as f64;
    (float.is_finite() && float.fract() == 0.0 && in_range).then(|| Value::Integer(float as i64))
}

fn to_float(value: &JsonValue, ty: &SemanticType) -> Result<Value, CoercionError> {
    let float = match value {
        JsonValue::Null => return Ok(Value::Null),
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        JsonValue::Bool(_) | JsonValue::Array(_) | JsonValue::Object(_) => None,
    };

    match float {
        Some(float) if float.is_finite() => Ok(Value::Float(float)),
        Some(_) => Err(CoercionError::new(ty, value, "non-finite numbers are not supported")),
        None => Err(CoercionError::new(ty, value, "not a number")),
    }
}

fn to_decimal(
    value: &JsonValue,
    ty: &SemanticType,
    precision: u32,
    scale: u32,
) -> Result<Value, CoercionError> {
    let parsed = match value {
        JsonValue::Null => return Ok(Value::Null),
        JsonValue::Number(n) => BigDecimal::from_str(&n.to_string()).ok(),
        JsonValue::String(s) => BigDecimal::from_str(s.trim()).ok(),
        JsonValue::Bool(_) | JsonValue::Array(_) | JsonValue::Object(_) => None,
    };

    let Some(decimal) = parsed else {
        return Err(CoercionError::new(ty, value, "not a decimal number"));
    };

    let scale = i64::from(scale);
    let fitted = decimal.round(scale).with_scale(scale);
    if fitted.digits() > u64::from(precision) {
        return Err(CoercionError::new(ty, value, "exceeds the declared precision"));
    }

    Ok(Value::Decimal(fitted))
}

fn to_string(value: &JsonValue, ty: &SemanticType) -> Result<Value, CoercionError> {
    let string = match value {
        JsonValue::Null => return Ok(Value::Null),
        JsonValue::String(s) => s.clone(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Array(_) | JsonValue::Object(_) => {
            return Err(CoercionError::new(ty, value, "composite value"));
        }
    };

    Ok(Value::String(string))
}

fn to_timestamp(value: &JsonValue, ty: &SemanticType) -> Result<Value, CoercionError> {
    match value {
        JsonValue::Null => Ok(Value::Null),
        JsonValue::String(s) => parse_timestamp(s.trim())
            .map(Value::Timestamp)
            .ok_or_else(|| CoercionError::new(ty, value, "not an ISO-8601 timestamp")),
        JsonValue::Bool(_) | JsonValue::Number(_) | JsonValue::Array(_) | JsonValue::Object(_) => {
            Err(CoercionError::new(ty, value, "timestamps must be strings"))
        }
    }
}

/// Parses RFC 3339 timestamps, naive timestamps (taken as UTC) and bare dates (midnight).
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(s) {
        return Some(timestamp.with_timezone(&Utc));
    }

    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn to_date(value: &JsonValue, ty: &SemanticType) -> Result<Value, CoercionError> {
    match value {
        JsonValue::Null => Ok(Value::Null),
        JsonValue::String(s) => {
            let s = s.trim();
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .or_else(|| parse_timestamp(s).map(|timestamp| timestamp.date_naive()))
                .map(Value::Date)
                .ok_or_else(|| CoercionError::new(ty, value, "not an ISO-8601 date"))
        }
        JsonValue::Bool(_) | JsonValue::Number(_) | JsonValue::Array(_) | JsonValue::Object(_) => {
            Err(CoercionError::new(ty, value, "dates must be strings"))
        }
    }
}

fn to_time(value: &JsonValue, ty: &SemanticType) -> Result<Value, CoercionError> {
    match value {
        JsonValue::Null => Ok(Value::Null),
        JsonValue::String(s) => TIME_FORMATS
            .iter()
            .find_map(|format| NaiveTime::parse_from_str(s.trim(), format).ok())
            .map(Value::Time)
            .ok_or_else(|| CoercionError::new(ty, value, "not a time of day")),
        JsonValue::Bool(_) | JsonValue::Number(_) | JsonValue::Array(_) | JsonValue::Object(_) => {
            Err(CoercionError::new(ty, value, "times must be strings"))
        }
    }
}

fn to_json(value: &JsonValue) -> Value {
    match value {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(_)
        | JsonValue::Number(_)
        | JsonValue::String(_)
        | JsonValue::Array(_)
        | JsonValue::Object(_) => Value::Json(value.clone()),
    }
}

fn to_array(value: &JsonValue, ty: &SemanticType) -> Result<Value, CoercionError> {
    match value {
        JsonValue::Null => Ok(Value::Null),
        JsonValue::Array(_) => Ok(Value::Json(value.clone())),
        JsonValue::Bool(_) | JsonValue::Number(_) | JsonValue::String(_) | JsonValue::Object(_) => {
            Err(CoercionError::new(ty, value, "not an array"))
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, Timelike};
    use serde_json::json;

    use super::*;

    fn decimal(precision: u32, scale: u32) -> SemanticType {
        SemanticType::Decimal { precision, scale }
    }

    #[test]
    fn nulls_coerce_to_null_for_every_type() {
        for ty in [
            SemanticType::Boolean,
            SemanticType::Integer,
            SemanticType::Float,
            decimal(10, 2),
            SemanticType::String { max_length: None },
            SemanticType::Timestamp,
            SemanticType::Date,
            SemanticType::Time,
            SemanticType::Json,
            SemanticType::Array,
        ] {
            assert_eq!(coerce(&JsonValue::Null, &ty), Ok(Value::Null), "{ty}");
        }
    }

    #[test]
    fn numeric_strings_become_numbers() {
        assert_eq!(
            coerce(&json!(" 42 "), &SemanticType::Integer),
            Ok(Value::Integer(42))
        );
        assert_eq!(
            coerce(&json!("3.0"), &SemanticType::Integer),
            Ok(Value::Integer(3))
        );
        assert_eq!(
            coerce(&json!("2.5"), &SemanticType::Float),
            Ok(Value::Float(2.5))
        );
        assert_eq!(coerce(&json!(7.0), &SemanticType::Integer), Ok(Value::Integer(7)));
    }

    #[test]
    fn fractional_or_oversized_integers_are_rejected() {
        assert!(coerce(&json!(1.5), &SemanticType::Integer).is_err());
        assert!(coerce(&json!(u64::MAX), &SemanticType::Integer).is_err());
        assert!(coerce(&json!(true), &SemanticType::Integer).is_err());
    }

    #[test]
    fn non_finite_floats_are_rejected() {
        assert!(coerce(&json!("NaN"), &SemanticType::Float).is_err());
        assert!(coerce(&json!("inf"), &SemanticType::Float).is_err());
    }

    #[test]
    fn decimals_are_rounded_to_scale_and_checked_against_precision() {
        assert_eq!(
            coerce(&json!("12.346"), &decimal(5, 2)),
            Ok(Value::Decimal(BigDecimal::from_str("12.35").unwrap()))
        );
        assert_eq!(
            coerce(&json!(1.5), &decimal(5, 2)),
            Ok(Value::Decimal(BigDecimal::from_str("1.50").unwrap()))
        );

        let err = coerce(&json!("123456.7"), &decimal(5, 2)).unwrap_err();
        assert_eq!(err.reason, "exceeds the declared precision");
    }

    #[test]
    fn iso_8601_strings_become_timestamps() {
        let Value::Timestamp(ts) =
            coerce(&json!("2024-03-01T10:15:30.250+02:00"), &SemanticType::Timestamp).unwrap()
        else {
            panic!("expected a timestamp");
        };
        assert_eq!(ts.hour(), 8);
        assert_eq!(ts.timestamp_subsec_millis(), 250);

        let Value::Timestamp(naive) =
            coerce(&json!("2024-03-01 10:15:30"), &SemanticType::Timestamp).unwrap()
        else {
            panic!("expected a timestamp");
        };
        assert_eq!(naive.hour(), 10);

        assert!(coerce(&json!("yesterday"), &SemanticType::Timestamp).is_err());
        assert!(coerce(&json!(1709288130), &SemanticType::Timestamp).is_err());
    }

    #[test]
    fn dates_accept_timestamps() {
        let Value::Date(date) = coerce(&json!("2024-03-01T23:59:59Z"), &SemanticType::Date).unwrap()
        else {
            panic!("expected a date");
        };

        assert_eq!((date.year(), date.month(), date.day()), (2024, 3, 1));
    }

    #[test]
    fn times_parse_with_and_without_seconds() {
        assert!(matches!(
            coerce(&json!("08:30"), &SemanticType::Time),
            Ok(Value::Time(_))
        ));
        assert!(matches!(
            coerce(&json!("08:30:15.5"), &SemanticType::Time),
            Ok(Value::Time(_))
        ));
    }

    #[test]
    fn strings_accept_scalars_and_refuse_composites() {
        let ty = SemanticType::String { max_length: None };

        assert_eq!(coerce(&json!(12), &ty), Ok(Value::String("12".to_string())));
        assert_eq!(coerce(&json!(true), &ty), Ok(Value::String("true".to_string())));

        let err = coerce(&json!({"a": 1}), &ty).unwrap_err();
        assert!(err.to_string().contains("composite value"));
        assert!(coerce(&json!(["a"]), &ty).is_err());
    }

    #[test]
    fn booleans_accept_common_literals() {
        assert_eq!(
            coerce(&json!("Yes"), &SemanticType::Boolean),
            Ok(Value::Boolean(true))
        );
        assert_eq!(coerce(&json!(0), &SemanticType::Boolean), Ok(Value::Boolean(false)));
        assert!(coerce(&json!(2), &SemanticType::Boolean).is_err());
    }

    #[test]
    fn arrays_require_arrays() {
        assert!(coerce(&json!([1, 2]), &SemanticType::Array).is_ok());
        assert!(coerce(&json!("1,2"), &SemanticType::Array).is_err());
    }

    #[test]
    fn error_excerpt_is_truncated() {
        let long = "x".repeat(500);

        let err = coerce(&json!(long), &SemanticType::Integer).unwrap_err();

        assert!(err.found.len() <= MAX_EXCERPT_LEN + 3);
    }
}
