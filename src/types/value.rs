use bson::oid::ObjectId;

use super::{Array, Document};

/// Binary subtype byte, mirroring the BSON binData subtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BinarySubtype {
    Generic = 0x00,
    Function = 0x01,
    BinaryOld = 0x02,
    UuidOld = 0x03,
    Uuid = 0x04,
    Md5 = 0x05,
    Encrypted = 0x06,
    User = 0x80,
}

impl BinarySubtype {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::Generic),
            0x01 => Some(Self::Function),
            0x02 => Some(Self::BinaryOld),
            0x03 => Some(Self::UuidOld),
            0x04 => Some(Self::Uuid),
            0x05 => Some(Self::Md5),
            0x06 => Some(Self::Encrypted),
            0x80 => Some(Self::User),
            _ => None,
        }
    }

    pub fn byte(self) -> u8 {
        self as u8
    }
}

/// A byte string with a subtype tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary {
    pub bytes: Vec<u8>,
    pub subtype: BinarySubtype,
}

/// A regular expression pattern with its options string.
///
/// Matching is not interpreted here; both parts are carried opaquely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Regex {
    pub pattern: String,
    pub options: String,
}

/// A single document value.
///
/// One variant per BSON type the backend stores. Composite variants own their
/// contents; equality is structural by tag then value, except that two NaN
/// doubles are equal.
#[derive(Debug, Clone)]
pub enum Value {
    Double(f64),
    String(String),
    Binary(Binary),
    ObjectId(ObjectId),
    Bool(bool),
    /// Milliseconds since the Unix epoch, signed.
    DateTime(i64),
    Null,
    Regex(Regex),
    Int32(i32),
    /// Opaque replication timestamp.
    Timestamp(u64),
    Int64(i64),
    Document(Document),
    Array(Array),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Double(a), Value::Double(b)) => {
                if a.is_nan() && b.is_nan() {
                    true
                } else {
                    a == b && a.is_sign_negative() == b.is_sign_negative()
                }
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Binary(a), Value::Binary(b)) => a == b,
            (Value::ObjectId(a), Value::ObjectId(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Null, Value::Null) => true,
            (Value::Regex(a), Value::Regex(b)) => a == b,
            (Value::Int32(a), Value::Int32(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::Document(a), Value::Document(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    /// Imports a plain JSON value that carries no schema, as produced by
    /// `EXPLAIN (FORMAT JSON)`. Numbers with a fractional representation become
    /// doubles; integral numbers become Int32 when they fit, Int64 otherwise.
    pub fn from_plain_json(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    if let Ok(i32v) = i32::try_from(i) {
                        Value::Int32(i32v)
                    } else {
                        Value::Int64(i)
                    }
                } else {
                    Value::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                let mut a = Array::new();
                for item in items {
                    a.push(Value::from_plain_json(item));
                }
                Value::Array(a)
            }
            serde_json::Value::Object(map) => {
                let mut d = Document::new();
                for (k, v) in map {
                    d.set(k, Value::from_plain_json(v));
                }
                Value::Document(d)
            }
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
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

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<Document> for Value {
    fn from(v: Document) -> Self {
        Value::Document(v)
    }
}

impl From<Array> for Value {
    fn from(v: Array) -> Self {
        Value::Array(v)
    }
}

impl From<ObjectId> for Value {
    fn from(v: ObjectId) -> Self {
        Value::ObjectId(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_equals_nan() {
        assert_eq!(Value::Double(f64::NAN), Value::Double(f64::NAN));
        assert_ne!(Value::Double(f64::NAN), Value::Double(1.0));
    }

    #[test]
    fn equality_is_tagged() {
        assert_ne!(Value::Int32(1), Value::Int64(1));
        assert_ne!(Value::Int64(1), Value::Double(1.0));
        assert_eq!(Value::Int64(42), Value::Int64(42));
    }

    #[test]
    fn plain_json_numbers() {
        assert_eq!(
            Value::from_plain_json(serde_json::json!(7)),
            Value::Int32(7)
        );
        assert_eq!(
            Value::from_plain_json(serde_json::json!(5_000_000_000i64)),
            Value::Int64(5_000_000_000)
        );
        assert_eq!(
            Value::from_plain_json(serde_json::json!(1.5)),
            Value::Double(1.5)
        );
    }
}
