use indexmap::IndexMap;
use serde_json::{json, Map, Value as Json};

use crate::types::{Document, Value};

use super::SjsonError;

/// Schema element for one value position.
///
/// Composite elements carry their nested schema; `binData` carries the subtype
/// byte and `regex` carries the options string, so the data positions stay
/// plain JSON scalars.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Elem {
    Double,
    String,
    BinData { subtype: u8 },
    ObjectId,
    Bool,
    Date,
    Null,
    Regex { options: String },
    Int,
    Timestamp,
    Long,
    Object(Schema),
    Array(Vec<Elem>),
}

/// Ordered field schema of a document; the key order mirrors `$k`.
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct Schema {
    pub elems: IndexMap<String, Elem>,
}

/// The `t` tag for a value, as written into the schema.
pub(crate) fn type_tag(v: &Value) -> &'static str {
    match v {
        Value::Double(_) => "double",
        Value::String(_) => "string",
        Value::Binary(_) => "binData",
        Value::ObjectId(_) => "objectId",
        Value::Bool(_) => "bool",
        Value::DateTime(_) => "date",
        Value::Null => "null",
        Value::Regex(_) => "regex",
        Value::Int32(_) => "int",
        Value::Timestamp(_) => "timestamp",
        Value::Int64(_) => "long",
        Value::Document(_) => "object",
        Value::Array(_) => "array",
    }
}

impl Elem {
    pub(crate) fn of_value(v: &Value) -> Elem {
        match v {
            Value::Double(_) => Elem::Double,
            Value::String(_) => Elem::String,
            Value::Binary(b) => Elem::BinData {
                subtype: b.subtype.byte(),
            },
            Value::ObjectId(_) => Elem::ObjectId,
            Value::Bool(_) => Elem::Bool,
            Value::DateTime(_) => Elem::Date,
            Value::Null => Elem::Null,
            Value::Regex(r) => Elem::Regex {
                options: r.options.clone(),
            },
            Value::Int32(_) => Elem::Int,
            Value::Timestamp(_) => Elem::Timestamp,
            Value::Int64(_) => Elem::Long,
            Value::Document(d) => Elem::Object(Schema::of_document(d)),
            Value::Array(a) => Elem::Array(a.iter().map(Elem::of_value).collect()),
        }
    }

    pub(crate) fn to_json(&self) -> Json {
        match self {
            Elem::Double => json!({"t": "double"}),
            Elem::String => json!({"t": "string"}),
            Elem::BinData { subtype } => json!({"t": "binData", "s": subtype}),
            Elem::ObjectId => json!({"t": "objectId"}),
            Elem::Bool => json!({"t": "bool"}),
            Elem::Date => json!({"t": "date"}),
            Elem::Null => json!({"t": "null"}),
            Elem::Regex { options } => json!({"t": "regex", "o": options}),
            Elem::Int => json!({"t": "int"}),
            Elem::Timestamp => json!({"t": "timestamp"}),
            Elem::Long => json!({"t": "long"}),
            Elem::Object(schema) => json!({"t": "object", "$s": schema.to_json()}),
            Elem::Array(items) => {
                let items: Vec<Json> = items.iter().map(Elem::to_json).collect();
                json!({"t": "array", "i": items})
            }
        }
    }

    pub(crate) fn from_json(v: &Json) -> Result<Elem, SjsonError> {
        let obj = v
            .as_object()
            .ok_or_else(|| SjsonError::Decode("schema element", type_name(v)))?;
        let tag = obj
            .get("t")
            .and_then(Json::as_str)
            .ok_or_else(|| SjsonError::SchemaMismatch("schema element has no type tag".into()))?;

        match tag {
            "double" => Ok(Elem::Double),
            "string" => Ok(Elem::String),
            "binData" => {
                let subtype = obj
                    .get("s")
                    .and_then(Json::as_u64)
                    .and_then(|s| u8::try_from(s).ok())
                    .ok_or_else(|| {
                        SjsonError::SchemaMismatch("binData element has no subtype".into())
                    })?;
                Ok(Elem::BinData { subtype })
            }
            "objectId" => Ok(Elem::ObjectId),
            "bool" => Ok(Elem::Bool),
            "date" => Ok(Elem::Date),
            "null" => Ok(Elem::Null),
            "regex" => {
                let options = obj
                    .get("o")
                    .and_then(Json::as_str)
                    .ok_or_else(|| {
                        SjsonError::SchemaMismatch("regex element has no options".into())
                    })?
                    .to_string();
                Ok(Elem::Regex { options })
            }
            "int" => Ok(Elem::Int),
            "timestamp" => Ok(Elem::Timestamp),
            "long" => Ok(Elem::Long),
            "object" => {
                let schema = obj.get("$s").ok_or_else(|| {
                    SjsonError::SchemaMismatch("object element has no schema".into())
                })?;
                Ok(Elem::Object(Schema::from_json(schema)?))
            }
            "array" => {
                let items = obj
                    .get("i")
                    .and_then(Json::as_array)
                    .ok_or_else(|| SjsonError::SchemaMismatch("array element has no items".into()))?;
                let items = items.iter().map(Elem::from_json).collect::<Result<_, _>>()?;
                Ok(Elem::Array(items))
            }
            other => Err(SjsonError::SchemaMismatch(format!(
                "unknown type tag {:?}",
                other
            ))),
        }
    }
}

impl Schema {
    pub(crate) fn of_document(doc: &Document) -> Schema {
        let elems = doc
            .iter()
            .map(|(k, v)| (k.to_string(), Elem::of_value(v)))
            .collect();
        Schema { elems }
    }

    pub(crate) fn to_json(&self) -> Json {
        let keys: Vec<Json> = self.elems.keys().map(|k| Json::from(k.clone())).collect();
        let mut props = Map::new();
        for (k, elem) in &self.elems {
            props.insert(k.clone(), elem.to_json());
        }
        let mut out = Map::new();
        out.insert("$k".into(), Json::Array(keys));
        out.insert("p".into(), Json::Object(props));
        Json::Object(out)
    }

    pub(crate) fn from_json(v: &Json) -> Result<Schema, SjsonError> {
        let obj = v
            .as_object()
            .ok_or_else(|| SjsonError::Decode("schema", type_name(v)))?;

        let keys: Vec<&str> = match obj.get("$k") {
            None => Vec::new(),
            Some(keys) => keys
                .as_array()
                .ok_or_else(|| SjsonError::SchemaMismatch("$k is not an array".into()))?
                .iter()
                .map(|k| {
                    k.as_str()
                        .ok_or_else(|| SjsonError::SchemaMismatch("$k entry is not a string".into()))
                })
                .collect::<Result<_, _>>()?,
        };

        let empty = Map::new();
        let props = match obj.get("p") {
            None => &empty,
            Some(p) => p
                .as_object()
                .ok_or_else(|| SjsonError::SchemaMismatch("p is not an object".into()))?,
        };

        if keys.len() != props.len() {
            return Err(SjsonError::SchemaMismatch(format!(
                "$k has {} keys, p has {} properties",
                keys.len(),
                props.len()
            )));
        }

        let mut elems = IndexMap::with_capacity(keys.len());
        for key in keys {
            let prop = props.get(key).ok_or_else(|| {
                SjsonError::SchemaMismatch(format!("key {:?} is missing from p", key))
            })?;
            elems.insert(key.to_string(), Elem::from_json(prop)?);
        }

        Ok(Schema { elems })
    }
}

pub(crate) fn type_name(v: &Json) -> String {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
    .to_string()
}
