use std::cmp::Ordering;
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tuple::Versionstamp;

/// Dynamically typed value held by record fields and tuple elements.
///
/// `Tuple`, `Array`, `Map` and `Vector` are compound: tuples nest inside keys,
/// arrays fan out into multiple index entries, maps hold nested record values,
/// and vectors feed vector indexes. Everything else is a key-capable scalar.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
    Timestamp(DateTime<Utc>),
    Tuple(Vec<Value>),
    Versionstamp(Versionstamp),
    /// Multi-valued field; not packable, each element indexes independently
    Array(Vec<Value>),
    /// Nested record value, addressed through `KeyExpression::Nest`
    Map(std::collections::BTreeMap<String, Value>),
    /// Dense f32 vector for vector indexes
    Vector(Vec<f32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Null,
    Bool,
    Int,
    Float,
    String,
    Bytes,
    Uuid,
    Timestamp,
    Tuple,
    Versionstamp,
    Array,
    Map,
    Vector,
}

impl ValueType {
    pub fn of(v: &Value) -> Self {
        match v {
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::String(_) => ValueType::String,
            Value::Bytes(_) => ValueType::Bytes,
            Value::Uuid(_) => ValueType::Uuid,
            Value::Timestamp(_) => ValueType::Timestamp,
            Value::Tuple(_) => ValueType::Tuple,
            Value::Versionstamp(_) => ValueType::Versionstamp,
            Value::Array(_) => ValueType::Array,
            Value::Map(_) => ValueType::Map,
            Value::Vector(_) => ValueType::Vector,
        }
    }
}

impl Value {
    /// Rank of this value's type in the cross-type key order:
    /// null < bool < int < float < string < bytes < uuid < timestamp < nested.
    pub fn type_order(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::String(_) => 4,
            Value::Bytes(_) => 5,
            Value::Uuid(_) => 6,
            Value::Timestamp(_) => 7,
            Value::Tuple(_) => 8,
            Value::Versionstamp(_) => 9,
            Value::Array(_) => 10,
            Value::Map(_) => 11,
            Value::Vector(_) => 12,
        }
    }

    /// Total order matching the packed-byte order for key-capable values.
    /// Floats compare via `total_cmp`, so NaN has a position here even though
    /// the codec rejects it.
    pub fn cmp_order(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Uuid(a), Value::Uuid(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Tuple(a), Value::Tuple(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.cmp_order(y) {
                        Ordering::Equal => continue,
                        ord => return ord,
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Versionstamp(a), Value::Versionstamp(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.cmp_order(y) {
                        Ordering::Equal => continue,
                        ord => return ord,
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Map(a), Value::Map(b)) => {
                let mut ai = a.iter();
                let mut bi = b.iter();
                loop {
                    match (ai.next(), bi.next()) {
                        (None, None) => return Ordering::Equal,
                        (None, Some(_)) => return Ordering::Less,
                        (Some(_), None) => return Ordering::Greater,
                        (Some((ka, va)), Some((kb, vb))) => match ka.cmp(kb).then_with(|| va.cmp_order(vb)) {
                            Ordering::Equal => continue,
                            ord => return ord,
                        },
                    }
                }
            }
            (Value::Vector(a), Value::Vector(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.total_cmp(y) {
                        Ordering::Equal => continue,
                        ord => return ord,
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.type_order().cmp(&other.type_order()),
        }
    }

    /// Numeric view used by sum indexes and interval widths.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Timestamp(t) => Some(t.timestamp() as f64 + t.timestamp_subsec_nanos() as f64 * 1e-9),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{:?}", b),
            Value::Int(i) => write!(f, "{:?}", i),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "{:02x?}", b),
            Value::Uuid(u) => write!(f, "{}", u),
            Value::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            Value::Tuple(vs) => {
                write!(f, "(")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, ")")
            }
            Value::Versionstamp(vs) => write!(f, "{}", vs),
            Value::Array(vs) => write!(f, "{:?}", vs.iter().map(|v| v.to_string()).collect::<Vec<_>>()),
            Value::Map(m) => write!(f, "{{{}}}", m.iter().map(|(k, v)| format!("{}: {}", k, v)).collect::<Vec<_>>().join(", ")),
            Value::Vector(v) => write!(f, "vector[{}]", v.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self { Value::Int(v) }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self { Value::Int(v as i64) }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self { Value::Float(v) }
}
impl From<bool> for Value {
    fn from(v: bool) -> Self { Value::Bool(v) }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self { Value::String(v.to_string()) }
}
impl From<String> for Value {
    fn from(v: String) -> Self { Value::String(v) }
}
impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self { Value::Bytes(v) }
}
impl From<uuid::Uuid> for Value {
    fn from(v: uuid::Uuid) -> Self { Value::Uuid(v) }
}
impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self { Value::Timestamp(v) }
}
impl From<Vec<f32>> for Value {
    fn from(v: Vec<f32>) -> Self { Value::Vector(v) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_type_order() {
        let ordered = vec![
            Value::Null,
            Value::Bool(true),
            Value::Int(i64::MAX),
            Value::Float(-1.0),
            Value::String("".into()),
            Value::Bytes(vec![]),
            Value::Uuid(uuid::Uuid::nil()),
            Value::Timestamp(Utc::now()),
            Value::Tuple(vec![]),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(pair[0].cmp_order(&pair[1]), Ordering::Less, "{} < {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn numeric_order_within_types() {
        assert_eq!(Value::Int(-5).cmp_order(&Value::Int(3)), Ordering::Less);
        assert_eq!(Value::Float(-0.5).cmp_order(&Value::Float(0.25)), Ordering::Less);
        assert_eq!(Value::String("abc".into()).cmp_order(&Value::String("abd".into())), Ordering::Less);
    }

    #[test]
    fn tuple_prefix_sorts_first() {
        let short = Value::Tuple(vec![Value::Int(1)]);
        let long = Value::Tuple(vec![Value::Int(1), Value::Int(0)]);
        assert_eq!(short.cmp_order(&long), Ordering::Less);
    }
}
