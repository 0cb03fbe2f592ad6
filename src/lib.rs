//! A MongoDB-document backend that stores collections as schema-carrying JSON
//! rows in PostgreSQL and translates document queries into parameterised SQL.
//!
//! The wire protocol, command dispatch and authentication live in the layers
//! above; this crate is the part that owns the SQL schema layout, the document
//! codec, the query translation and the metadata registry.

pub mod backend;
pub mod errors;
pub mod filter;
pub mod iterator;
pub mod metadata;
pub mod pool;
pub mod query;
pub mod sjson;
pub mod types;

pub use crate::backend::{
    Backend, Collection, CollectionStats, Database, DatabaseStats, ExplainResult, QueryParams,
    QueryResult,
};
pub use crate::errors::StoatDBError;
pub use crate::iterator::QueryIterator;
pub use crate::pool::PgPool;
pub use crate::sjson::SjsonError;
pub use crate::types::{Array, Document, Value};
