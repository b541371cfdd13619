//! Typed field values and their coercion from raw remote data.
//!
//! The remote boundary hands back loosely typed JSON (integers as strings,
//! booleans as `0`/`1`, empty strings meaning "absent"). Everything that
//! enters the cache goes through [`FieldType::coerce`] first.

use crate::{EntityId, ValidationError};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

/// Datetime format expected by the remote boundary on writes.
pub const REMOTE_DATETIME_FORMAT: &str = "%Y%m%d%H%M%S";

static SIGNED_INT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[+-]?\d+$").expect("Invalid signed int regex"));

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y%m%d%H%M%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y%m%d"];

/// Ordered mapping of field name to typed value.
pub type Fields = BTreeMap<String, Value>;

/// Is the string an optionally signed run of decimal digits?
pub fn is_signed_int_string(s: &str) -> bool {
    SIGNED_INT.is_match(s)
}

/// Parse the datetime spellings the remote boundary is known to produce.
pub fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Some(parsed) = DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
    {
        return Some(parsed);
    }
    if let Some(date) = DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(s, format).ok())
    {
        return Some(date.and_time(NaiveTime::MIN));
    }
    // A bare time means that time today.
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .ok()
        .map(|time| Utc::now().date_naive().and_time(time))
}

// ============================================================================
// ENTITY REFERENCE
// ============================================================================

/// Reference to another entity by type and id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub id: EntityId,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, id: EntityId) -> Self {
        Self {
            entity_type: entity_type.into(),
            id,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.entity_type, self.id)
    }
}

// ============================================================================
// VALUE
// ============================================================================

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    DateTime(NaiveDateTime),
    Array(Vec<Value>),
    Ref(EntityRef),
}

impl Value {
    /// Untyped conversion from JSON. Objects are kept as their JSON text.
    pub fn from_json(json: &JsonValue) -> Value {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => Value::String(s.clone()),
            JsonValue::Array(items) => Value::Array(items.iter().map(Value::from_json).collect()),
            JsonValue::Object(_) => Value::String(json.to_string()),
        }
    }

    /// Serialise to the representation the remote boundary accepts.
    ///
    /// Nulls become empty strings, booleans `0`/`1`, datetimes
    /// `YYYYMMDDhhmmss`, references their id.
    pub fn serialise(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::String(String::new()),
            Value::Bool(b) => JsonValue::from(if *b { 1 } else { 0 }),
            Value::Int(i) => JsonValue::from(*i),
            Value::Float(x) => JsonValue::from(*x),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::DateTime(dt) => JsonValue::String(dt.format(REMOTE_DATETIME_FORMAT).to_string()),
            Value::Array(items) => JsonValue::Array(items.iter().map(Value::serialise).collect()),
            Value::Ref(r) => JsonValue::from(r.id),
        }
    }

    /// Null or the empty string.
    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Null) || matches!(self, Value::String(s) if s.is_empty())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Ref(r) => Some(r.id),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Value::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Key fragment used when indexing by this value.
    ///
    /// Strings are lowercased so lookups are case-insensitive. Empty values
    /// and arrays cannot be indexed.
    pub fn lookup_fragment(&self) -> Option<String> {
        match self {
            Value::Null | Value::Array(_) => None,
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.to_lowercase()),
            Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(x) => Some(x.to_string()),
            Value::DateTime(dt) => Some(dt.format(REMOTE_DATETIME_FORMAT).to_string()),
            Value::Ref(r) => Some(r.id.to_string()),
        }
    }

    fn numeric(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(x) => Some(*x),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Ref(r) => Some(r.id as f64),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Loose equality used when checking a write's result against its
    /// parameters: strings compare trimmed and case-insensitively, numbers
    /// compare by value whatever their spelling, arrays compare as sets.
    pub fn loosely_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::String(a), Value::String(b)) => {
                a.trim().to_lowercase() == b.trim().to_lowercase()
            }
            (Value::Array(a), Value::Array(b)) => {
                if a.len() != b.len() {
                    return false;
                }
                let mut a: Vec<&Value> = a.iter().collect();
                let mut b: Vec<&Value> = b.iter().collect();
                a.sort_by_key(|v| v.lookup_fragment());
                b.sort_by_key(|v| v.lookup_fragment());
                a.iter().zip(b.iter()).all(|(x, y)| x.loosely_equals(y))
            }
            (Value::Null, v) | (v, Value::Null) => v.is_empty(),
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            _ => match (self.numeric(), other.numeric()) {
                (Some(a), Some(b)) => a == b,
                _ => self.lookup_fragment() == other.lookup_fragment(),
            },
        }
    }

    /// Does this value, an array, contain something loosely equal to `item`?
    pub fn contains_loosely(&self, item: &Value) -> bool {
        match self {
            Value::Array(items) => items.iter().any(|v| v.loosely_equals(item)),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "'{}'", s.replace('\'', "\\'")),
            Value::DateTime(dt) => write!(f, "DateTime({})", dt.format("%Y-%m-%d %H:%M:%S")),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Ref(r) => write!(f, "{}", r),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(dt: NaiveDateTime) -> Self {
        Value::DateTime(dt)
    }
}

impl From<EntityRef> for Value {
    fn from(r: EntityRef) -> Self {
        Value::Ref(r)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

// ============================================================================
// FIELD TYPES
// ============================================================================

/// Primitive type bucket of a declared field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    #[serde(rename = "string")]
    String,
    #[serde(rename = "int")]
    Int,
    #[serde(rename = "bool")]
    Bool,
    #[serde(rename = "float")]
    Float,
    #[serde(rename = "datetime")]
    DateTime,
    #[serde(rename = "array")]
    Array,
}

/// Whether values are query filters or field values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoerceMode {
    /// Filter parameters for a read; array fields may be given a single value.
    Query,
    /// Field values being written or received.
    Fields,
}

/// Outcome of coercing one value.
#[derive(Debug, Clone, PartialEq)]
pub enum Coerced {
    Set(Value),
    /// The value means "not supplied" and the field should be dropped.
    Unset,
}

impl FieldType {
    /// Map a storage column data type to its primitive bucket.
    pub fn from_column_type(data_type: &str) -> Option<FieldType> {
        match data_type.to_ascii_lowercase().as_str() {
            "char" | "varchar" | "tinytext" | "text" | "mediumtext" | "longtext" | "tinyblob"
            | "blob" | "mediumblob" | "longblob" | "enum" | "set" => Some(FieldType::String),
            "smallint" | "mediumint" | "int" | "bigint" => Some(FieldType::Int),
            "tinyint" => Some(FieldType::Bool),
            "decimal" | "float" | "double" => Some(FieldType::Float),
            "date" | "datetime" | "timestamp" | "time" => Some(FieldType::DateTime),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Int => "int",
            FieldType::Bool => "bool",
            FieldType::Float => "float",
            FieldType::DateTime => "datetime",
            FieldType::Array => "array",
        }
    }

    /// Coerce a value to this type's canonical representation.
    ///
    /// `tolerant` lets string fields keep values of other shapes; it is set
    /// for fields the remote boundary may transform.
    pub fn coerce(
        self,
        field: &str,
        value: Value,
        mode: CoerceMode,
        tolerant: bool,
    ) -> Result<Coerced, ValidationError> {
        if value.is_null() {
            return Ok(Coerced::Set(Value::Null));
        }
        let mismatch = |value: &Value| ValidationError::TypeMismatch {
            field: field.to_string(),
            expected: self.as_str().to_string(),
            value: value.to_string(),
        };

        let coerced = match (self, value) {
            (FieldType::String, Value::String(s)) => Value::String(s),
            (FieldType::String, Value::Int(i)) => Value::String(i.to_string()),
            (FieldType::String, Value::Float(x)) => Value::String(x.to_string()),
            (FieldType::String, other) if tolerant => other,

            (FieldType::Int, Value::Int(i)) => Value::Int(i),
            (FieldType::Int, Value::Ref(r)) => Value::Int(r.id),
            (FieldType::Int, Value::String(s)) if s.is_empty() => Value::Null,
            (FieldType::Int, Value::String(s)) if is_signed_int_string(&s) => {
                match s.trim_start_matches('+').parse::<i64>() {
                    Ok(i) => Value::Int(i),
                    Err(_) => return Err(mismatch(&Value::String(s))),
                }
            }

            (FieldType::Bool, Value::Bool(b)) => Value::Bool(b),
            (FieldType::Bool, Value::String(s)) if s.is_empty() => return Ok(Coerced::Unset),
            (FieldType::Bool, Value::Int(0)) => Value::Bool(false),
            (FieldType::Bool, Value::Int(1)) => Value::Bool(true),
            (FieldType::Bool, Value::String(s)) if s == "0" => Value::Bool(false),
            (FieldType::Bool, Value::String(s)) if s == "1" => Value::Bool(true),

            (FieldType::Float, Value::Float(x)) => Value::Float(x),
            (FieldType::Float, Value::Int(i)) => Value::Float(i as f64),
            (FieldType::Float, Value::String(s)) if s.is_empty() => Value::Null,
            (FieldType::Float, Value::String(s)) => match s.trim().parse::<f64>() {
                Ok(x) if x.is_finite() => Value::Float(x),
                _ => return Err(mismatch(&Value::String(s))),
            },

            (FieldType::DateTime, Value::DateTime(dt)) => Value::DateTime(dt),
            (FieldType::DateTime, Value::String(s)) if s.is_empty() => Value::Null,
            (FieldType::DateTime, Value::String(s)) => match parse_datetime(&s) {
                Some(dt) => Value::DateTime(dt),
                None => return Err(mismatch(&Value::String(s))),
            },

            (FieldType::Array, Value::Array(items)) => Value::Array(items),
            (FieldType::Array, scalar) if mode == CoerceMode::Query => scalar,

            (_, other) => return Err(mismatch(&other)),
        };
        Ok(Coerced::Set(coerced))
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn coerce(ty: FieldType, value: JsonValue) -> Result<Coerced, ValidationError> {
        ty.coerce("f", Value::from_json(&value), CoerceMode::Fields, false)
    }

    #[test]
    fn test_column_type_map() {
        assert_eq!(FieldType::from_column_type("varchar"), Some(FieldType::String));
        assert_eq!(FieldType::from_column_type("enum"), Some(FieldType::String));
        assert_eq!(FieldType::from_column_type("bigint"), Some(FieldType::Int));
        assert_eq!(FieldType::from_column_type("tinyint"), Some(FieldType::Bool));
        assert_eq!(FieldType::from_column_type("decimal"), Some(FieldType::Float));
        assert_eq!(FieldType::from_column_type("timestamp"), Some(FieldType::DateTime));
        assert_eq!(FieldType::from_column_type("geometry"), None);
    }

    #[test]
    fn test_int_coercion() {
        assert_eq!(coerce(FieldType::Int, json!("42")).unwrap(), Coerced::Set(Value::Int(42)));
        assert_eq!(coerce(FieldType::Int, json!("-7")).unwrap(), Coerced::Set(Value::Int(-7)));
        assert_eq!(coerce(FieldType::Int, json!("+3")).unwrap(), Coerced::Set(Value::Int(3)));
        assert_eq!(coerce(FieldType::Int, json!("")).unwrap(), Coerced::Set(Value::Null));
        assert!(coerce(FieldType::Int, json!("4.5")).is_err());
        assert!(coerce(FieldType::Int, json!("abc")).is_err());
    }

    #[test]
    fn test_bool_coercion() {
        assert_eq!(coerce(FieldType::Bool, json!("1")).unwrap(), Coerced::Set(Value::Bool(true)));
        assert_eq!(coerce(FieldType::Bool, json!(0)).unwrap(), Coerced::Set(Value::Bool(false)));
        assert_eq!(coerce(FieldType::Bool, json!("")).unwrap(), Coerced::Unset);
        assert!(coerce(FieldType::Bool, json!("yes")).is_err());
        assert!(coerce(FieldType::Bool, json!(2)).is_err());
    }

    #[test]
    fn test_string_coercion_and_tolerance() {
        assert_eq!(
            coerce(FieldType::String, json!(12)).unwrap(),
            Coerced::Set(Value::String("12".to_string()))
        );
        assert!(coerce(FieldType::String, json!(true)).is_err());
        let tolerated = FieldType::String
            .coerce("f", Value::Bool(true), CoerceMode::Fields, true)
            .unwrap();
        assert_eq!(tolerated, Coerced::Set(Value::Bool(true)));
    }

    #[test]
    fn test_float_and_datetime_coercion() {
        assert_eq!(coerce(FieldType::Float, json!("2.50")).unwrap(), Coerced::Set(Value::Float(2.5)));
        assert_eq!(coerce(FieldType::Float, json!(3)).unwrap(), Coerced::Set(Value::Float(3.0)));
        let dt = coerce(FieldType::DateTime, json!("2024-03-01 10:15:00")).unwrap();
        let expected = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(10, 15, 0)
            .unwrap();
        assert_eq!(dt, Coerced::Set(Value::DateTime(expected)));
        assert!(coerce(FieldType::DateTime, json!("not a date")).is_err());
    }

    #[test]
    fn test_array_scalar_only_allowed_in_queries() {
        assert!(coerce(FieldType::Array, json!("Parent")).is_err());
        let query = FieldType::Array
            .coerce("f", Value::from("Parent"), CoerceMode::Query, false)
            .unwrap();
        assert_eq!(query, Coerced::Set(Value::from("Parent")));
    }

    #[test]
    fn test_serialise_for_remote() {
        let dt = NaiveDate::from_ymd_opt(2023, 12, 31)
            .unwrap()
            .and_hms_opt(23, 59, 1)
            .unwrap();
        assert_eq!(Value::DateTime(dt).serialise(), json!("20231231235901"));
        assert_eq!(Value::Bool(true).serialise(), json!(1));
        assert_eq!(Value::Null.serialise(), json!(""));
        assert_eq!(Value::Ref(EntityRef::new("Contact", 9)).serialise(), json!(9));
    }

    #[test]
    fn test_loose_equality() {
        assert!(Value::from(" Smith ").loosely_equals(&Value::from("smith")));
        assert!(Value::Int(5).loosely_equals(&Value::from("5")));
        assert!(Value::Int(5).loosely_equals(&Value::Float(5.0)));
        assert!(Value::from(vec!["b", "a"]).loosely_equals(&Value::from(vec!["a", "b"])));
        assert!(!Value::from("a").loosely_equals(&Value::from("b")));
        assert!(Value::from(vec!["Parent", "Staff"]).contains_loosely(&Value::from("staff")));
    }

    #[test]
    fn test_lookup_fragment() {
        assert_eq!(Value::from("ABC").lookup_fragment(), Some("abc".to_string()));
        assert_eq!(Value::from("").lookup_fragment(), None);
        assert_eq!(Value::Null.lookup_fragment(), None);
        assert_eq!(Value::Int(3).lookup_fragment(), Some("3".to_string()));
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Any decimal spelling of an integer coerces to that integer.
        #[test]
        fn prop_signed_int_strings_coerce_to_int(n in any::<i64>()) {
            let coerced = FieldType::Int
                .coerce("n", Value::String(n.to_string()), CoerceMode::Fields, false)
                .unwrap();
            prop_assert_eq!(coerced, Coerced::Set(Value::Int(n)));
        }

        /// Lookup fragments ignore letter case.
        #[test]
        fn prop_lookup_fragment_case_insensitive(s in "[A-Za-z0-9]{1,16}") {
            let upper = Value::String(s.to_uppercase()).lookup_fragment();
            let lower = Value::String(s.to_lowercase()).lookup_fragment();
            prop_assert_eq!(upper, lower);
        }

        /// Only the four accepted spellings coerce to booleans.
        #[test]
        fn prop_bool_rejects_other_integers(n in 2i64..1000) {
            let result = FieldType::Bool.coerce("b", Value::Int(n), CoerceMode::Fields, false);
            prop_assert!(result.is_err());
        }
    }
}
