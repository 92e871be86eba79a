//! Runtime value union carried by flow variables.

use super::{PrimitiveKind, TypeRef};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single runtime value.
///
/// Media kinds (`file`, `image`, ...) are carried as `Text` URIs or `Bytes`
/// payloads; the static `TypeRef` on the owning variable is what
/// distinguishes them. `Object` uses a `BTreeMap` so value equality and
/// serialization are deterministic.
// Untagged deserialization tries variants in declaration order: lists must
// come before bytes or integer arrays would decode as byte payloads, and
// text before the date kinds so date-shaped strings stay textual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    Datetime(DateTime<Utc>),
}

impl Value {
    /// Whether this is the null value.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Borrow as text, if the value is textual.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow as a list, if the value is one.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Borrow as an object, if the value is one.
    #[must_use]
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Render the value for prompt interpolation.
    ///
    /// Text renders bare (no quotes); everything else renders as JSON.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            other => serde_json::to_string(&other.to_json()).unwrap_or_default(),
        }
    }

    /// Best-effort inferred type of the value.
    ///
    /// Empty lists infer `list[text]`; objects infer as untyped custom data
    /// and are reported as the sentinel custom name `object`.
    #[must_use]
    pub fn kind_of(&self) -> TypeRef {
        match self {
            Self::Null => TypeRef::optional(TypeRef::primitive(PrimitiveKind::Text)),
            Self::Bool(_) => TypeRef::primitive(PrimitiveKind::Boolean),
            Self::Int(_) => TypeRef::primitive(PrimitiveKind::Int),
            Self::Float(_) => TypeRef::primitive(PrimitiveKind::Float),
            Self::Text(_) => TypeRef::primitive(PrimitiveKind::Text),
            Self::Bytes(_) => TypeRef::primitive(PrimitiveKind::Bytes),
            Self::Date(_) => TypeRef::primitive(PrimitiveKind::Date),
            Self::Time(_) => TypeRef::primitive(PrimitiveKind::Time),
            Self::Datetime(_) => TypeRef::primitive(PrimitiveKind::Datetime),
            Self::List(items) => TypeRef::list(
                items
                    .first()
                    .map_or(TypeRef::primitive(PrimitiveKind::Text), Value::kind_of),
            ),
            Self::Object(_) => TypeRef::Custom("object".to_string()),
        }
    }

    /// Convert to a `serde_json::Value`.
    ///
    /// Dates and times render as ISO-8601 strings, bytes as a number array.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::Bytes(b) => {
                serde_json::Value::Array(b.iter().map(|byte| (*byte).into()).collect())
            }
            Self::Date(d) => serde_json::Value::String(d.to_string()),
            Self::Time(t) => serde_json::Value::String(t.to_string()),
            Self::Datetime(dt) => serde_json::Value::String(dt.to_rfc3339()),
            Self::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Self::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Convert from a `serde_json::Value`.
    #[must_use]
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Self::Text(s.clone()),
            serde_json::Value::Array(items) => {
                Self::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Decode a typed value from a serde struct.
    pub fn from_serialize<T: Serialize>(value: &T) -> Self {
        serde_json::to_value(value)
            .map(|json| Self::from_json(&json))
            .unwrap_or(Self::Null)
    }

    /// Decode this value into a serde struct.
    pub fn to_deserialize<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.to_json())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_preserves_structure() {
        let value = Value::Object(BTreeMap::from([
            ("name".to_string(), Value::from("alice")),
            (
                "scores".to_string(),
                Value::List(vec![Value::Int(1), Value::Float(2.5)]),
            ),
            ("active".to_string(), Value::Bool(true)),
        ]));
        assert_eq!(Value::from_json(&value.to_json()), value);
    }

    #[test]
    fn render_is_bare_for_text() {
        assert_eq!(Value::from("hello").render(), "hello");
        assert_eq!(Value::Int(42).render(), "42");
        assert_eq!(
            Value::List(vec![Value::from("a")]).render(),
            "[\"a\"]"
        );
    }

    #[test]
    fn kind_inference() {
        assert_eq!(
            Value::Int(1).kind_of(),
            TypeRef::primitive(PrimitiveKind::Int)
        );
        assert_eq!(
            Value::List(vec![Value::Bool(true)]).kind_of(),
            TypeRef::list(TypeRef::primitive(PrimitiveKind::Boolean))
        );
    }
}
