//! The document value model: an ordered document, a typed array, and the BSON
//! scalar types, with MongoDB equality and ordering semantics.

mod array;
mod compare;
mod document;
mod value;

pub use array::Array;
pub use compare::compare;
pub(crate) use compare::rank;
pub use document::Document;
pub use value::{Binary, BinarySubtype, Regex, Value};
