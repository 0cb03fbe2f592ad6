//! Schema-carrying JSON ("SJSON"): a lossless encoding of documents into a
//! self-describing JSON form.
//!
//! The top-level object carries a `$s` schema sibling next to the data fields:
//!
//! ```json
//! {"$s": {"$k": ["_id", "v"], "p": {"_id": {"t": "int"}, "v": {"t": "string"}}},
//!  "_id": 1, "v": "foo"}
//! ```
//!
//! Nested objects and arrays keep their schema inside the parent's element, so
//! only the top level has a `$s` key. Double positions encode NaN and the
//! infinities as the strings `"NaN"`, `"Infinity"` and `"-Infinity"`, since
//! JSON numbers cannot carry them.

mod schema;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bson::oid::ObjectId;
use serde_json::{Map, Number, Value as Json};
use thiserror::Error;

use crate::types::{Array, Binary, BinarySubtype, Document, Regex, Value};

pub(crate) use schema::type_tag;
use schema::{type_name, Elem, Schema};

#[derive(Debug, Error)]
pub enum SjsonError {
    #[error("sjson: top-level value is not an object")]
    TopLevelNotObject,

    #[error("sjson: schema is missing")]
    SchemaMissing,

    #[error("sjson: schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("sjson: cannot decode {0} from json {1}")]
    Decode(&'static str, String),

    #[error("sjson: unknown binary subtype {0}")]
    UnknownSubtype(u8),

    #[error("sjson: invalid object id: {0}")]
    InvalidObjectId(String),

    #[error("sjson: invalid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("sjson: json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encodes a document into SJSON bytes. Total for any document.
pub fn marshal(doc: &Document) -> Result<Vec<u8>, SjsonError> {
    Ok(serde_json::to_vec(&marshal_json(doc))?)
}

/// Encodes a document into a SJSON `serde_json::Value`, for binding as a jsonb
/// parameter without a byte round trip.
pub fn marshal_json(doc: &Document) -> Json {
    let mut out = Map::new();
    out.insert("$s".into(), Schema::of_document(doc).to_json());
    for (k, v) in doc.iter() {
        out.insert(k.to_string(), encode_value(v));
    }
    Json::Object(out)
}

/// Encodes exactly one value without the `$s` envelope; used for parameter
/// binding in SQL. Deterministic: equal values encode identically.
pub fn marshal_single_value(v: &Value) -> Result<Vec<u8>, SjsonError> {
    Ok(serde_json::to_vec(&single_value_json(v))?)
}

/// The single-value encoding as a `serde_json::Value`.
pub fn single_value_json(v: &Value) -> Json {
    encode_value(v)
}

/// Decodes SJSON bytes produced by [`marshal`] back into a document,
/// preserving key order and types.
pub fn unmarshal(bytes: &[u8]) -> Result<Document, SjsonError> {
    let v: Json = serde_json::from_slice(bytes)?;
    unmarshal_json(v)
}

/// Decodes an SJSON `serde_json::Value`, as read from a jsonb column.
pub fn unmarshal_json(v: Json) -> Result<Document, SjsonError> {
    let map = match v {
        Json::Object(map) => map,
        _ => return Err(SjsonError::TopLevelNotObject),
    };

    let schema = match map.get("$s") {
        Some(s) => Schema::from_json(s)?,
        None if map.is_empty() => return Ok(Document::new()),
        None => return Err(SjsonError::SchemaMissing),
    };

    let data_fields = map.len() - 1;
    if data_fields != schema.elems.len() {
        return Err(SjsonError::SchemaMismatch(format!(
            "schema has {} keys, data has {} fields",
            schema.elems.len(),
            data_fields
        )));
    }

    let mut doc = Document::new();
    for (key, elem) in &schema.elems {
        let data = map.get(key).ok_or_else(|| {
            SjsonError::SchemaMismatch(format!("key {:?} is missing from data", key))
        })?;
        doc.set(key.clone(), decode_value(elem, data)?);
    }
    Ok(doc)
}

fn encode_value(v: &Value) -> Json {
    match v {
        Value::Double(d) => match Number::from_f64(*d) {
            Some(n) => Json::Number(n),
            // NaN and the infinities have no JSON number form.
            None if d.is_nan() => Json::String("NaN".into()),
            None if *d > 0.0 => Json::String("Infinity".into()),
            None => Json::String("-Infinity".into()),
        },
        Value::String(s) => Json::String(s.clone()),
        Value::Binary(b) => Json::String(BASE64.encode(&b.bytes)),
        Value::ObjectId(oid) => Json::String(oid.to_hex()),
        Value::Bool(b) => Json::Bool(*b),
        Value::DateTime(ms) => Json::Number(Number::from(*ms)),
        Value::Null => Json::Null,
        Value::Regex(r) => Json::String(r.pattern.clone()),
        Value::Int32(i) => Json::Number(Number::from(*i)),
        Value::Timestamp(t) => Json::Number(Number::from(*t)),
        Value::Int64(i) => Json::Number(Number::from(*i)),
        Value::Document(d) => {
            let mut out = Map::new();
            for (k, v) in d.iter() {
                out.insert(k.to_string(), encode_value(v));
            }
            Json::Object(out)
        }
        Value::Array(a) => Json::Array(a.iter().map(encode_value).collect()),
    }
}

fn decode_value(elem: &Elem, v: &Json) -> Result<Value, SjsonError> {
    // A null literal always decodes to Null, before any type rule applies.
    if v.is_null() {
        return Ok(Value::Null);
    }

    match elem {
        Elem::Double => decode_double(v),
        Elem::String => Ok(Value::String(expect_str(v, "string")?.to_string())),
        Elem::BinData { subtype } => {
            let subtype =
                BinarySubtype::from_byte(*subtype).ok_or(SjsonError::UnknownSubtype(*subtype))?;
            let bytes = BASE64.decode(expect_str(v, "binData")?)?;
            Ok(Value::Binary(Binary { bytes, subtype }))
        }
        Elem::ObjectId => {
            let hex = expect_str(v, "objectId")?;
            let oid = ObjectId::parse_str(hex)
                .map_err(|e| SjsonError::InvalidObjectId(e.to_string()))?;
            Ok(Value::ObjectId(oid))
        }
        Elem::Bool => match v {
            Json::Bool(b) => Ok(Value::Bool(*b)),
            _ => Err(SjsonError::Decode("bool", type_name(v))),
        },
        Elem::Date => v
            .as_i64()
            .map(Value::DateTime)
            .ok_or_else(|| SjsonError::Decode("date", type_name(v))),
        Elem::Null => Ok(Value::Null),
        Elem::Regex { options } => Ok(Value::Regex(Regex {
            pattern: expect_str(v, "regex")?.to_string(),
            options: options.clone(),
        })),
        Elem::Int => v
            .as_i64()
            .and_then(|i| i32::try_from(i).ok())
            .map(Value::Int32)
            .ok_or_else(|| SjsonError::Decode("int", type_name(v))),
        Elem::Timestamp => v
            .as_u64()
            .map(Value::Timestamp)
            .ok_or_else(|| SjsonError::Decode("timestamp", type_name(v))),
        Elem::Long => v
            .as_i64()
            .map(Value::Int64)
            .ok_or_else(|| SjsonError::Decode("long", type_name(v))),
        Elem::Object(schema) => {
            let obj = v
                .as_object()
                .ok_or_else(|| SjsonError::Decode("object", type_name(v)))?;
            if obj.len() != schema.elems.len() {
                return Err(SjsonError::SchemaMismatch(format!(
                    "nested schema has {} keys, data has {} fields",
                    schema.elems.len(),
                    obj.len()
                )));
            }
            let mut doc = Document::new();
            for (key, elem) in &schema.elems {
                let data = obj.get(key).ok_or_else(|| {
                    SjsonError::SchemaMismatch(format!("key {:?} is missing from data", key))
                })?;
                doc.set(key.clone(), decode_value(elem, data)?);
            }
            Ok(Value::Document(doc))
        }
        Elem::Array(items) => {
            let arr = v
                .as_array()
                .ok_or_else(|| SjsonError::Decode("array", type_name(v)))?;
            if arr.len() != items.len() {
                return Err(SjsonError::SchemaMismatch(format!(
                    "array schema has {} items, data has {}",
                    items.len(),
                    arr.len()
                )));
            }
            let mut out = Array::new();
            for (elem, data) in items.iter().zip(arr.iter()) {
                out.push(decode_value(elem, data)?);
            }
            Ok(Value::Array(out))
        }
    }
}

fn decode_double(v: &Json) -> Result<Value, SjsonError> {
    if let Some(d) = v.as_f64() {
        return Ok(Value::Double(d));
    }
    match v.as_str() {
        Some("NaN") => Ok(Value::Double(f64::NAN)),
        Some("Infinity") => Ok(Value::Double(f64::INFINITY)),
        Some("-Infinity") => Ok(Value::Double(f64::NEG_INFINITY)),
        _ => Err(SjsonError::Decode("double", type_name(v))),
    }
}

fn expect_str<'a>(v: &'a Json, expected: &'static str) -> Result<&'a str, SjsonError> {
    v.as_str().ok_or_else(|| SjsonError::Decode(expected, type_name(v)))
}
