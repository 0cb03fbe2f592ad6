//! The metadata registry: the authoritative mapping of logical databases and
//! collections to SQL schemas, tables and indexes.

mod names;
mod registry;

pub use names::{DEFAULT_INDEX, METADATA_TABLE};
pub use registry::Registry;

use crate::errors::StoatDBError;
use crate::types::{Array, Document, Value};

/// One (field, direction) pair of an index key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexKeyPair {
    pub field: String,
    pub descending: bool,
}

/// One index on a collection.
///
/// `name` is the user-visible index name; `pg_index` is the derived backend
/// identifier, unique across the whole database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    pub name: String,
    pub pg_index: String,
    pub key: Vec<IndexKeyPair>,
    pub unique: bool,
}

/// A request to create one index, before backend names are derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRequest {
    pub name: String,
    pub key: Vec<IndexKeyPair>,
    pub unique: bool,
}

/// Collection metadata, as cached in memory and persisted in the metadata
/// table. Values are immutable once installed in the registry; mutation
/// replaces the whole record.
#[derive(Debug, Clone, PartialEq)]
pub struct Collection {
    /// User-visible collection name.
    pub name: String,
    /// Derived physical table name.
    pub table_name: String,
    pub indexes: Vec<IndexInfo>,
}

impl Collection {
    /// The persisted form: `{_id, table, indexes}`, with `indexes` omitted
    /// while empty.
    pub(crate) fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.set("_id", Value::String(self.name.clone()));
        doc.set("table", Value::String(self.table_name.clone()));
        if !self.indexes.is_empty() {
            let mut indexes = Array::new();
            for index in &self.indexes {
                let mut key = Document::new();
                for pair in &index.key {
                    key.set(
                        pair.field.clone(),
                        Value::Int32(if pair.descending { -1 } else { 1 }),
                    );
                }
                let mut entry = Document::new();
                entry.set("name", Value::String(index.name.clone()));
                entry.set("pgindex", Value::String(index.pg_index.clone()));
                entry.set("key", Value::Document(key));
                entry.set("unique", Value::Bool(index.unique));
                indexes.push(Value::Document(entry));
            }
            doc.set("indexes", Value::Array(indexes));
        }
        doc
    }

    pub(crate) fn from_document(doc: &Document) -> Result<Self, StoatDBError> {
        let name = get_string(doc, "_id")?;
        let table_name = get_string(doc, "table")?;

        let mut indexes = Vec::new();
        match doc.get("indexes") {
            None => {}
            Some(Value::Array(entries)) => {
                for entry in entries.iter() {
                    let entry = match entry {
                        Value::Document(d) => d,
                        _ => {
                            return Err(StoatDBError::InvalidMetadata(
                                "index entry is not a document".into(),
                            ));
                        }
                    };
                    indexes.push(index_from_document(entry)?);
                }
            }
            Some(_) => {
                return Err(StoatDBError::InvalidMetadata(
                    "indexes is not an array".into(),
                ));
            }
        }

        Ok(Collection {
            name,
            table_name,
            indexes,
        })
    }
}

fn index_from_document(entry: &Document) -> Result<IndexInfo, StoatDBError> {
    let name = get_string(entry, "name")?;
    let pg_index = get_string(entry, "pgindex")?;
    let unique = match entry.get("unique") {
        Some(Value::Bool(b)) => *b,
        None => false,
        Some(_) => {
            return Err(StoatDBError::InvalidMetadata(
                "unique is not a boolean".into(),
            ));
        }
    };

    let key_doc = match entry.get("key") {
        Some(Value::Document(d)) => d,
        _ => {
            return Err(StoatDBError::InvalidMetadata(
                "index key is not a document".into(),
            ));
        }
    };
    let mut key = Vec::with_capacity(key_doc.len());
    for (field, direction) in key_doc.iter() {
        let descending = match direction {
            Value::Int32(d) => *d < 0,
            Value::Int64(d) => *d < 0,
            Value::Double(d) => *d < 0.0,
            _ => {
                return Err(StoatDBError::InvalidMetadata(format!(
                    "index key direction for {:?} is not a number",
                    field
                )));
            }
        };
        key.push(IndexKeyPair {
            field: field.to_string(),
            descending,
        });
    }

    Ok(IndexInfo {
        name,
        pg_index,
        key,
        unique,
    })
}

fn get_string(doc: &Document, key: &str) -> Result<String, StoatDBError> {
    match doc.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        _ => Err(StoatDBError::InvalidMetadata(format!(
            "{:?} is missing or not a string",
            key
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Collection {
        Collection {
            name: "Orders".into(),
            table_name: "orders_4a9fbf12".into(),
            indexes: vec![
                IndexInfo {
                    name: "_id_".into(),
                    pg_index: "orders__id__6ff41a9d_idx".into(),
                    key: vec![IndexKeyPair {
                        field: "_id".into(),
                        descending: false,
                    }],
                    unique: true,
                },
                IndexInfo {
                    name: "total_-1".into(),
                    pg_index: "orders_total__1_7e2b0c44_idx".into(),
                    key: vec![IndexKeyPair {
                        field: "total".into(),
                        descending: true,
                    }],
                    unique: false,
                },
            ],
        }
    }

    #[test]
    fn document_roundtrip() {
        let coll = sample();
        let doc = coll.to_document();
        assert_eq!(Collection::from_document(&doc).unwrap(), coll);
    }

    #[test]
    fn document_roundtrip_through_sjson() {
        let coll = sample();
        let bytes = crate::sjson::marshal(&coll.to_document()).unwrap();
        let doc = crate::sjson::unmarshal(&bytes).unwrap();
        assert_eq!(Collection::from_document(&doc).unwrap(), coll);
    }

    #[test]
    fn indexes_are_omitted_while_empty() {
        let coll = Collection {
            name: "c".into(),
            table_name: "c_0".into(),
            indexes: vec![],
        };
        assert!(!coll.to_document().has("indexes"));
        assert_eq!(
            Collection::from_document(&coll.to_document()).unwrap(),
            coll
        );
    }

    #[test]
    fn rejects_malformed_metadata() {
        let mut doc = Document::new();
        doc.set("_id", Value::Int32(1));
        assert!(matches!(
            Collection::from_document(&doc),
            Err(StoatDBError::InvalidMetadata(_))
        ));
    }
}
