//! Typed values carried in task input and output bags.
//!
//! On the wire these are plain JSON. Decoding picks the narrowest variant:
//! integers before floats, flat numeric lists before nested lists.

use std::collections::BTreeMap;

use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use crate::channel::BufferDescriptor;

/// Named values passed into a task.
pub type Inputs = BTreeMap<String, Value>;

/// Named values produced by a task.
pub type Outputs = BTreeMap<String, Value>;

/// A single task value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    IntList(Vec<i64>),
    FloatList(Vec<f64>),
    NestedList(Vec<Value>),
    BufferRef(BufferDescriptor),
    Text(String),
}

impl Value {
    /// Build a list of point pairs, `[[x, y], ...]`.
    pub fn points<I>(points: I) -> Self
    where
        I: IntoIterator<Item = (i64, i64)>,
    {
        Self::NestedList(
            points
                .into_iter()
                .map(|(x, y)| Self::IntList(vec![x, y]))
                .collect(),
        )
    }

    /// Short variant name for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::IntList(_) => "int list",
            Self::FloatList(_) => "float list",
            Self::NestedList(_) => "nested list",
            Self::BufferRef(_) => "buffer reference",
            Self::Text(_) => "text",
        }
    }

    /// Treat this value as a list of rows.
    ///
    /// An empty list of any flavor is an empty outer list.
    pub fn as_rows(&self) -> Option<&[Value]> {
        match self {
            Self::NestedList(rows) => Some(rows),
            Self::IntList(v) if v.is_empty() => Some(&[]),
            Self::FloatList(v) if v.is_empty() => Some(&[]),
            _ => None,
        }
    }

    /// Integer elements of a flat numeric list.
    ///
    /// Floats are accepted only when they have no fractional part.
    pub fn as_integers(&self) -> Option<Vec<i64>> {
        match self {
            Self::IntList(v) => Some(v.clone()),
            Self::FloatList(v) => v
                .iter()
                .map(|f| {
                    (f.is_finite() && f.fract() == 0.0 && f.abs() <= i64::MAX as f64)
                        .then_some(*f as i64)
                })
                .collect(),
            Self::NestedList(v) if v.is_empty() => Some(Vec::new()),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<Vec<i64>> for Value {
    fn from(v: Vec<i64>) -> Self {
        Self::IntList(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Self::FloatList(v)
    }
}

impl From<BufferDescriptor> for Value {
    fn from(d: BufferDescriptor) -> Self {
        Self::BufferRef(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Int(v) => serializer.serialize_i64(*v),
            Self::Float(v) => serializer.serialize_f64(*v),
            Self::IntList(v) => v.serialize(serializer),
            Self::FloatList(v) => v.serialize(serializer),
            Self::NestedList(v) => v.serialize(serializer),
            Self::Text(s) => serializer.serialize_str(s),
            Self::BufferRef(d) => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("name", &d.name)?;
                map.serialize_entry("dtype", &d.dtype)?;
                map.serialize_entry("shape", &d.shape)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Value::try_from(raw).map_err(de::Error::custom)
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = String;

    fn try_from(raw: serde_json::Value) -> Result<Self, Self::Error> {
        use serde_json::Value as Json;

        match raw {
            Json::Number(n) => match n.as_i64() {
                Some(i) => Ok(Self::Int(i)),
                None => n
                    .as_f64()
                    .map(Self::Float)
                    .ok_or_else(|| format!("unrepresentable number {}", n)),
            },
            Json::String(s) => Ok(Self::Text(s)),
            Json::Array(items) => {
                if items.iter().all(|v| v.as_i64().is_some()) {
                    return Ok(Self::IntList(items.iter().filter_map(|v| v.as_i64()).collect()));
                }
                if items.iter().all(|v| v.is_number()) {
                    return Ok(Self::FloatList(items.iter().filter_map(|v| v.as_f64()).collect()));
                }
                items
                    .into_iter()
                    .map(Value::try_from)
                    .collect::<Result<Vec<_>, _>>()
                    .map(Self::NestedList)
            }
            Json::Object(map) => {
                let descriptor: BufferDescriptor =
                    serde_json::from_value(Json::Object(map)).map_err(|e| {
                        format!("objects must be buffer references: {}", e)
                    })?;
                Ok(Self::BufferRef(descriptor))
            }
            Json::Bool(_) | Json::Null => Err(format!("unsupported value {}", raw)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::DType;

    fn parse(json: &str) -> Value {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_numbers_pick_narrowest_variant() {
        assert_eq!(parse("4"), Value::Int(4));
        assert_eq!(parse("-4"), Value::Int(-4));
        assert_eq!(parse("2.5"), Value::Float(2.5));
        assert_eq!(parse("[1, 2]"), Value::IntList(vec![1, 2]));
        assert_eq!(parse("[1, 2.5]"), Value::FloatList(vec![1.0, 2.5]));
        assert_eq!(parse("[]"), Value::IntList(vec![]));
    }

    #[test]
    fn test_nested_lists() {
        let v = parse("[[1, 2], [], [3.5]]");
        assert_eq!(
            v,
            Value::NestedList(vec![
                Value::IntList(vec![1, 2]),
                Value::IntList(vec![]),
                Value::FloatList(vec![3.5]),
            ])
        );
        assert_eq!(v.as_rows().map(|r| r.len()), Some(3));
    }

    #[test]
    fn test_buffer_ref_json_shape() {
        let d = BufferDescriptor::new("sgb0123456789abcdef_1".into(), DType::Float32, vec![2, 3]);
        let json = serde_json::to_string(&Value::from(d.clone())).unwrap();
        assert_eq!(
            json,
            r#"{"name":"sgb0123456789abcdef_1","dtype":"float32","shape":[2,3]}"#
        );
        assert_eq!(parse(&json), Value::BufferRef(d));
    }

    #[test]
    fn test_rejects_null_bool_and_plain_objects() {
        assert!(serde_json::from_str::<Value>("null").is_err());
        assert!(serde_json::from_str::<Value>("[true]").is_err());
        assert!(serde_json::from_str::<Value>(r#"{"a": 1}"#).is_err());
    }

    #[test]
    fn test_as_integers_accepts_integral_floats_only() {
        assert_eq!(Value::FloatList(vec![1.0, -3.0]).as_integers(), Some(vec![1, -3]));
        assert_eq!(Value::FloatList(vec![1.5]).as_integers(), None);
        assert_eq!(Value::FloatList(vec![f64::NAN]).as_integers(), None);
        assert_eq!(Value::Text("1".into()).as_integers(), None);
    }

    #[test]
    fn test_points_helper() {
        let v = Value::points([(1, 2), (3, 4)]);
        assert_eq!(serde_json::to_string(&v).unwrap(), "[[1,2],[3,4]]");
    }
}
