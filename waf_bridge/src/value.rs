//! Host-side value model.
//!
//! Request data is shaped into a [`Value`] before it is handed to the
//! encoder. The variants cover everything the encoder knows how to convert,
//! plus [`Value::Unsupported`] for kinds it must skip (callbacks, channels,
//! handles and the like).

use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    /// Ordered key/value pairs. Only string keys (possibly behind a
    /// reference) are encodable.
    Map(Vec<(Value, Value)>),
    /// Named fields in declaration order.
    Record(Vec<Field>),
    /// Optional or boxed reference; `None` is null.
    Ref(Option<Box<Value>>),
    /// A value of a kind that cannot be represented, named for logging.
    Unsupported(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub public: bool,
    pub value: Value,
}

impl Field {
    pub fn public(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            public: true,
            value: value.into(),
        }
    }

    pub fn private(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            public: false,
            value: value.into(),
        }
    }
}

impl Value {
    /// Map with string keys.
    pub fn map<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (Value::String(k.into()), v.into()))
                .collect(),
        )
    }

    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(bytes.into())
    }

    pub fn null() -> Self {
        Value::Ref(None)
    }

    pub fn reference(value: impl Into<Value>) -> Self {
        Value::Ref(Some(Box::new(value.into())))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Unsigned(_) => "unsigned",
            Value::Signed(_) => "signed",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Record(_) => "record",
            Value::Ref(_) => "reference",
            Value::Unsupported(kind) => *kind,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(text) => Some(text),
            _ => None,
        }
    }

    /// Value stored under `key` in a map with string keys.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Number of entries of a container.
    pub fn len(&self) -> Option<usize> {
        match self {
            Value::Array(items) => Some(items.len()),
            Value::Map(entries) => Some(entries.len()),
            Value::Record(fields) => Some(fields.len()),
            _ => None,
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

macro_rules! from_unsigned {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Value::Unsigned(value as u64)
            }
        })*
    };
}

macro_rules! from_signed {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Value::Signed(value as i64)
            }
        })*
    };
}

from_unsigned!(u8, u16, u32, u64, usize);
from_signed!(i8, i16, i32, i64, isize);

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Float(f64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        Value::Ref(value.map(|v| Box::new(v.into())))
    }
}

impl<V: Into<Value>> From<HashMap<String, V>> for Value {
    fn from(entries: HashMap<String, V>) -> Self {
        Value::map(entries)
    }
}

impl<V: Into<Value>> From<BTreeMap<String, V>> for Value {
    fn from(entries: BTreeMap<String, V>) -> Self {
        Value::map(entries)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value as Json;

        match value {
            Json::Null => Value::Ref(None),
            Json::Bool(flag) => Value::Bool(flag),
            Json::Number(number) => {
                if let Some(unsigned) = number.as_u64() {
                    Value::Unsigned(unsigned)
                } else if let Some(signed) = number.as_i64() {
                    Value::Signed(signed)
                } else {
                    Value::Float(number.as_f64().unwrap_or(f64::NAN))
                }
            }
            Json::String(text) => Value::String(text),
            Json::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            Json::Object(entries) => Value::map(entries),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_preserves_shape() {
        let value = Value::from(json!({"a": [1, -2, 1.5, true, null], "b": "x"}));
        assert_eq!(
            value.get("a"),
            Some(&Value::Array(vec![
                Value::Unsigned(1),
                Value::Signed(-2),
                Value::Float(1.5),
                Value::Bool(true),
                Value::Ref(None),
            ]))
        );
        assert_eq!(value.get("b").and_then(Value::as_str), Some("x"));
    }

    #[test]
    fn test_primitive_conversions() {
        assert_eq!(Value::from(7u8), Value::Unsigned(7));
        assert_eq!(Value::from(-7i32), Value::Signed(-7));
        assert_eq!(Value::from(Some("x")), Value::reference("x"));
        assert_eq!(Value::from(None::<&str>), Value::null());
        assert_eq!(Value::from(vec!["a", "b"]).len(), Some(2));
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(Value::Unsupported("channel").kind_name(), "channel");
        assert_eq!(Value::Record(vec![]).kind_name(), "record");
        assert_eq!(Value::bytes(b"ab".to_vec()).kind_name(), "bytes");
    }
}
