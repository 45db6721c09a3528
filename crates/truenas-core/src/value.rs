//! Tagged field values.
//!
//! Every payload the server returns (method results, pushed `fields`) is
//! decoded once, at the protocol boundary, into [`FieldValue`]. Entity kinds
//! then decode a [`FieldMap`] into their own typed state via [`FieldMapExt`].
//!
//! The wire format is EJSON: plain JSON plus `{"$date": <epoch millis>}` for
//! timestamps, which become [`FieldValue::Date`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};

use crate::errors::{ClientError, Result};

/// Key → value mapping for one entity's raw state.
pub type FieldMap = BTreeMap<String, FieldValue>;

const DATE_KEY: &str = "$date";

/// A decoded server value.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    /// JSON `null`.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer that fits in `i64`.
    Integer(i64),
    /// Any other number.
    Float(f64),
    /// String.
    String(String),
    /// EJSON `$date`.
    Date(DateTime<Utc>),
    /// Array.
    List(Vec<FieldValue>),
    /// Nested mapping.
    Map(FieldMap),
}

impl FieldValue {
    /// Whether this is [`FieldValue::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Boolean value, if this is a boolean.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer value, if this is an integer.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric value as `f64` (integers are widened).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(n) => Some(*n as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// String slice, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Timestamp, if this is an EJSON date.
    #[must_use]
    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Date(d) => Some(*d),
            _ => None,
        }
    }

    /// List items, if this is a list.
    #[must_use]
    pub fn as_list(&self) -> Option<&[FieldValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Nested map, if this is a map.
    #[must_use]
    pub fn as_map(&self) -> Option<&FieldMap> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a key in a nested map.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Truthiness in the sense the server uses for boolean-ish replies.
    ///
    /// `null`, `false`, `0`, `0.0`, `""`, `[]` and `{}` are falsy.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Integer(n) => *n != 0,
            Self::Float(f) => *f != 0.0,
            Self::String(s) => !s.is_empty(),
            Self::Date(_) => true,
            Self::List(items) => !items.is_empty(),
            Self::Map(map) => !map.is_empty(),
        }
    }

    /// Short type name for error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Date(_) => "date",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    /// Convert back into EJSON.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Integer(n) => Value::Number((*n).into()),
            Self::Float(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
            Self::String(s) => Value::String(s.clone()),
            Self::Date(d) => {
                let mut obj = Map::new();
                let _ = obj.insert(DATE_KEY.to_owned(), Value::Number(d.timestamp_millis().into()));
                Value::Object(obj)
            }
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => n.as_f64().map_or(Self::Null, Self::Float),
            },
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(obj) => {
                if let Some(date) = ejson_date(&obj) {
                    return Self::Date(date);
                }
                Self::Map(obj.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

/// Recognize `{"$date": millis}`.
fn ejson_date(obj: &Map<String, Value>) -> Option<DateTime<Utc>> {
    if obj.len() != 1 {
        return None;
    }
    let millis = obj.get(DATE_KEY)?.as_i64()?;
    DateTime::from_timestamp_millis(millis)
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from)
    }
}

/// Convert a JSON object into a [`FieldMap`], or `None` if it is not an object.
#[must_use]
pub fn field_map_from_json(value: Value) -> Option<FieldMap> {
    match FieldValue::from(value) {
        FieldValue::Map(map) => Some(map),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Typed access for entity decoding
// ─────────────────────────────────────────────────────────────────────────────

/// Typed, error-reporting accessors on a raw entity map.
///
/// Every accessor takes the entity kind name so a failure names both the
/// entity and the field.
pub trait FieldMapExt {
    /// The value of a required field.
    fn require(&self, entity: &'static str, field: &str) -> Result<&FieldValue>;

    /// A required string field.
    fn require_str(&self, entity: &'static str, field: &str) -> Result<&str> {
        let value = self.require(entity, field)?;
        value
            .as_str()
            .ok_or_else(|| mismatch(entity, field, "string", value))
    }

    /// A required integer field.
    fn require_i64(&self, entity: &'static str, field: &str) -> Result<i64> {
        let value = self.require(entity, field)?;
        value
            .as_i64()
            .ok_or_else(|| mismatch(entity, field, "integer", value))
    }

    /// A required boolean field.
    fn require_bool(&self, entity: &'static str, field: &str) -> Result<bool> {
        let value = self.require(entity, field)?;
        value
            .as_bool()
            .ok_or_else(|| mismatch(entity, field, "boolean", value))
    }

    /// A required nested map.
    fn require_map(&self, entity: &'static str, field: &str) -> Result<&FieldMap> {
        let value = self.require(entity, field)?;
        value
            .as_map()
            .ok_or_else(|| mismatch(entity, field, "map", value))
    }

    /// An optional string field (`null` and absent both map to `None`).
    fn optional_str(&self, entity: &'static str, field: &str) -> Result<Option<&str>>;

    /// An optional integer field (`null` and absent both map to `None`).
    fn optional_i64(&self, entity: &'static str, field: &str) -> Result<Option<i64>>;
}

impl FieldMapExt for FieldMap {
    fn require(&self, entity: &'static str, field: &str) -> Result<&FieldValue> {
        self.get(field)
            .ok_or_else(|| ClientError::decode(entity, field, "missing"))
    }

    fn optional_str(&self, entity: &'static str, field: &str) -> Result<Option<&str>> {
        match self.get(field) {
            None | Some(FieldValue::Null) => Ok(None),
            Some(FieldValue::String(s)) => Ok(Some(s)),
            Some(other) => Err(mismatch(entity, field, "string", other)),
        }
    }

    fn optional_i64(&self, entity: &'static str, field: &str) -> Result<Option<i64>> {
        match self.get(field) {
            None | Some(FieldValue::Null) => Ok(None),
            Some(FieldValue::Integer(n)) => Ok(Some(*n)),
            Some(other) => Err(mismatch(entity, field, "integer", other)),
        }
    }
}

fn mismatch(entity: &'static str, field: &str, expected: &str, got: &FieldValue) -> ClientError {
    ClientError::decode(
        entity,
        field,
        format!("expected {expected}, got {}", got.type_name()),
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn decodes_scalars() {
        assert_eq!(FieldValue::from(json!(null)), FieldValue::Null);
        assert_eq!(FieldValue::from(json!(true)), FieldValue::Bool(true));
        assert_eq!(FieldValue::from(json!(42)), FieldValue::Integer(42));
        assert_eq!(FieldValue::from(json!(1.5)), FieldValue::Float(1.5));
        assert_eq!(FieldValue::from(json!("x")), FieldValue::String("x".into()));
    }

    #[test]
    fn large_unsigned_becomes_float() {
        let v = FieldValue::from(json!(u64::MAX));
        assert_matches!(v, FieldValue::Float(_));
    }

    #[test]
    fn decodes_ejson_date() {
        let v = FieldValue::from(json!({"$date": 1_609_955_489_741_i64}));
        let date = v.as_date().expect("date");
        assert_eq!(date.timestamp_millis(), 1_609_955_489_741);
        assert_eq!(v.to_json(), json!({"$date": 1_609_955_489_741_i64}));
    }

    #[test]
    fn date_key_with_siblings_is_a_map() {
        let v = FieldValue::from(json!({"$date": 1, "other": 2}));
        assert_matches!(v, FieldValue::Map(_));
    }

    #[test]
    fn nested_structures() {
        let v = FieldValue::from(json!({"status": {"state": "RUNNING", "pid": 42}, "tags": [1, "a"]}));
        assert_eq!(v.get("status").and_then(|s| s.get("state")).and_then(FieldValue::as_str), Some("RUNNING"));
        assert_eq!(v.get("tags").and_then(FieldValue::as_list).map(<[_]>::len), Some(2));
    }

    #[test]
    fn truthiness() {
        for falsy in [json!(null), json!(false), json!(0), json!(0.0), json!(""), json!([]), json!({})] {
            assert!(!FieldValue::from(falsy.clone()).is_truthy(), "{falsy} should be falsy");
        }
        for truthy in [json!(true), json!(1), json!("ok"), json!([0]), json!({"a": 1})] {
            assert!(FieldValue::from(truthy.clone()).is_truthy(), "{truthy} should be truthy");
        }
    }

    #[test]
    fn serde_roundtrip_through_json() {
        let original = json!({"a": [1, 2.5, "s", null, {"$date": 0}]});
        let v: FieldValue = serde_json::from_value(original.clone()).unwrap();
        assert_eq!(serde_json::to_value(&v).unwrap(), original);
    }

    #[test]
    fn field_map_accessors() {
        let map = field_map_from_json(json!({
            "name": "ada0",
            "size": 250_059_350_016_i64,
            "ok": true,
            "desc": null,
        }))
        .unwrap();
        assert_eq!(map.require_str("disk", "name").unwrap(), "ada0");
        assert_eq!(map.require_i64("disk", "size").unwrap(), 250_059_350_016);
        assert!(map.require_bool("disk", "ok").unwrap());
        assert_eq!(map.optional_str("disk", "desc").unwrap(), None);
        assert_eq!(map.optional_i64("disk", "absent").unwrap(), None);
    }

    #[test]
    fn field_map_errors_name_entity_and_field() {
        let map = field_map_from_json(json!({"size": "big"})).unwrap();
        let err = map.require_i64("disk", "size").unwrap_err();
        assert_eq!(err.to_string(), "failed to decode disk.size: expected integer, got string");
        let err = map.require_str("disk", "model").unwrap_err();
        assert_eq!(err.to_string(), "failed to decode disk.model: missing");
    }

    #[test]
    fn non_object_is_not_a_field_map() {
        assert!(field_map_from_json(json!([1, 2])).is_none());
    }
}
