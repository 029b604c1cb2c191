//! Dynamic values and primary keys.
//!
//! Callers hand the store loosely-typed field maps; `Value` is the runtime
//! representation of a single field. Equality is structural and strict:
//! no numeric coercion between `Int` and `Float`, and `NaN` equals `NaN`
//! so that repeated query results compare stable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Loosely-typed input and record fields, keyed by field name.
pub type Fields = BTreeMap<String, Value>;

/// A dynamic field value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Explicit null. Distinct from an absent field.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit floating point.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Array of values.
    Array(Vec<Value>),
    /// Nested mapping.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view: `Int` and `Float` yield their value, everything else
    /// `None`. Used by aggregates, which skip non-numerics.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    /// String view.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view (no coercion from `Float`).
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Name of the variant, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }
}

/// Structural equality: same variant, same contents. `NaN == NaN`;
/// `0.0 == -0.0`; `Int(1) != Float(1.0)`.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Key> for Value {
    fn from(k: Key) -> Self {
        match k {
            Key::Int(n) => Value::Int(n),
            Key::String(s) => Value::String(s),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Map(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

/// A primary key: the value of the bucket's designated key field.
///
/// Keys order integers before strings so that mixed-key buckets still have
/// a total enumeration order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    /// Integer key (autoincrement buckets).
    Int(i64),
    /// String key (uuid/cuid buckets).
    String(String),
}

impl Key {
    /// Extract a key from a field value. Only strings and integers qualify.
    pub fn from_value(value: &Value) -> Option<Key> {
        match value {
            Value::Int(n) => Some(Key::Int(*n)),
            Value::String(s) => Some(Key::String(s.clone())),
            _ => None,
        }
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Int(v)
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::String(v.to_string())
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::String(v)
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Int(n) => write!(f, "{n}"),
            Key::String(s) => write!(f, "{s:?}"),
        }
    }
}

/// Build a [`Fields`] map from `(name, value)` pairs.
///
/// Convenience for call sites and tests:
/// `fields([("name", "A".into()), ("qty", 5.into())])`.
pub fn fields<const N: usize>(pairs: [(&str, Value); N]) -> Fields {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_equality_no_coercion() {
        assert_ne!(Value::Int(1), Value::Float(1.0));
        assert_ne!(Value::Null, Value::Bool(false));
        assert_ne!(Value::Int(0), Value::Bool(false));
        assert_eq!(Value::Int(5), Value::Int(5));
    }

    #[test]
    fn test_nan_equals_nan() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_eq!(Value::Float(0.0), Value::Float(-0.0));
        assert_ne!(Value::Float(f64::NAN), Value::Float(1.0));
    }

    #[test]
    fn test_nested_structural_equality() {
        let a = Value::Array(vec![
            Value::Map(fields([("x", Value::Float(f64::NAN))])),
            Value::Int(2),
        ]);
        let b = Value::Array(vec![
            Value::Map(fields([("x", Value::Float(f64::NAN))])),
            Value::Int(2),
        ]);
        assert_eq!(a, b);

        let c = Value::Array(vec![Value::Int(2)]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_key_extraction() {
        assert_eq!(Key::from_value(&Value::Int(7)), Some(Key::Int(7)));
        assert_eq!(
            Key::from_value(&Value::String("a".into())),
            Some(Key::String("a".into()))
        );
        assert_eq!(Key::from_value(&Value::Bool(true)), None);
        assert_eq!(Key::from_value(&Value::Float(1.0)), None);
        assert_eq!(Key::from_value(&Value::Null), None);
    }

    #[test]
    fn test_key_ordering() {
        let mut keys = vec![
            Key::from("b"),
            Key::from(10i64),
            Key::from("a"),
            Key::from(2i64),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                Key::from(2i64),
                Key::from(10i64),
                Key::from("a"),
                Key::from("b"),
            ]
        );
    }

    #[test]
    fn test_as_number_skips_non_numeric() {
        assert_eq!(Value::Int(3).as_number(), Some(3.0));
        assert_eq!(Value::Float(1.5).as_number(), Some(1.5));
        assert_eq!(Value::String("3".into()).as_number(), None);
        assert_eq!(Value::Bool(true).as_number(), None);
    }

    #[test]
    fn test_serde_roundtrip() {
        let value = Value::Map(fields([
            ("name", "A".into()),
            ("qty", 5.into()),
            ("tags", Value::Array(vec!["x".into(), "y".into()])),
            ("note", Value::Null),
        ]));

        let encoded = serde_json::to_string(&value).unwrap();
        let decoded: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value, decoded);
    }
}
