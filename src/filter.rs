//! In-process filter evaluation.
//!
//! The translator deliberately over-selects whenever a condition has no exact
//! SQL form; whoever consumes a query result with `filter_pushdown` or
//! `filter_exact` cleared runs the documents through [`matches`] to get the
//! real answer. Semantics follow MongoDB matching: `null` equals a missing
//! field, equality reaches into arrays, and range operators only compare
//! values of the same comparison class.

use std::cmp::Ordering;

use crate::types::{compare, rank, Document, Value};

/// Whether the document satisfies the filter.
///
/// Top-level keys starting with `$` are server-side operators outside plain
/// field matching and are ignored here, mirroring the translator.
pub fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, condition)| {
        if key.starts_with('$') {
            return true;
        }
        let field = get_path(doc, key);
        match condition {
            Value::Document(ops) if has_operators(ops) => ops
                .iter()
                .all(|(op, operand)| matches_operator(field, op, operand)),
            _ => matches_equality(field, condition),
        }
    })
}

fn has_operators(doc: &Document) -> bool {
    doc.keys().any(|k| k.starts_with('$'))
}

/// Walks a dotted path through nested documents and numeric array positions.
fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut value = doc.get(parts.next()?)?;
    for part in parts {
        value = match value {
            Value::Document(d) => d.get(part)?,
            Value::Array(a) => a.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

fn matches_equality(field: Option<&Value>, expected: &Value) -> bool {
    let field = match field {
        // A missing field only equals an explicit null.
        None => return matches!(expected, Value::Null),
        Some(field) => field,
    };

    if compare(field, expected) == Ordering::Equal {
        return true;
    }
    if let Value::Array(items) = field {
        return items
            .iter()
            .any(|item| compare(item, expected) == Ordering::Equal);
    }
    false
}

fn matches_operator(field: Option<&Value>, op: &str, operand: &Value) -> bool {
    match op {
        "$eq" => matches_equality(field, operand),
        "$ne" => !matches_equality(field, operand),
        "$gt" => matches_range(field, operand, Ordering::is_gt),
        "$gte" => matches_range(field, operand, Ordering::is_ge),
        "$lt" => matches_range(field, operand, Ordering::is_lt),
        "$lte" => matches_range(field, operand, Ordering::is_le),
        // Operators this backend does not evaluate never match.
        _ => false,
    }
}

/// Range operators only compare within one comparison class; a string is
/// never `$gt` a number, and a missing field never matches.
fn matches_range(field: Option<&Value>, operand: &Value, accept: fn(Ordering) -> bool) -> bool {
    let field = match field {
        None => return false,
        Some(field) => field,
    };
    if in_class(field, operand) && accept(compare(field, operand)) {
        return true;
    }
    if let Value::Array(items) = field {
        return items
            .iter()
            .any(|item| in_class(item, operand) && accept(compare(item, operand)));
    }
    false
}

fn in_class(a: &Value, b: &Value) -> bool {
    rank(a) == rank(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{array, document};

    #[test]
    fn scalar_equality_crosses_numeric_types() {
        let doc = document!("v" => 1);
        assert!(matches(&doc, &document!("v" => 1)));
        assert!(matches(&doc, &document!("v" => 1.0)));
        assert!(matches(&doc, &document!("v" => 1i64)));
        assert!(!matches(&doc, &document!("v" => 2)));
        assert!(!matches(&doc, &document!("v" => "1")));
    }

    #[test]
    fn null_filter_matches_missing_field() {
        let with_null = document!("_id" => 1, "v" => Value::Null);
        let without = document!("_id" => 2);
        let filter = document!("v" => Value::Null);
        assert!(matches(&with_null, &filter));
        assert!(matches(&without, &filter));
        assert!(!matches(&document!("v" => 1), &filter));
    }

    #[test]
    fn ne_keeps_documents_without_the_key() {
        let filter = document!("v" => document!("$ne" => 1));
        assert!(matches(&document!("_id" => 1), &filter));
        assert!(matches(&document!("_id" => 2, "v" => Value::Null), &filter));
        assert!(!matches(&document!("_id" => 3, "v" => 1), &filter));
    }

    #[test]
    fn equality_reaches_into_arrays() {
        let doc = document!("v" => array![1, 2, 3]);
        assert!(matches(&doc, &document!("v" => 2)));
        assert!(!matches(&doc, &document!("v" => 4)));
        assert!(matches(&doc, &document!("v" => array![1, 2, 3])));
    }

    #[test]
    fn dotted_paths_walk_documents_and_arrays() {
        let doc = document!(
            "a" => document!("b" => 1),
            "arr" => array![document!("x" => "y")],
        );
        assert!(matches(&doc, &document!("a.b" => 1)));
        assert!(!matches(&doc, &document!("a.c" => 1)));
        assert!(matches(&doc, &document!("arr.0.x" => "y")));
        assert!(!matches(&doc, &document!("arr.1.x" => "y")));
    }

    #[test]
    fn range_operators_stay_within_their_class() {
        let doc = document!("v" => 5);
        assert!(matches(&doc, &document!("v" => document!("$gt" => 4))));
        assert!(matches(&doc, &document!("v" => document!("$gte" => 5.0))));
        assert!(matches(&doc, &document!("v" => document!("$lt" => 6i64))));
        assert!(!matches(&doc, &document!("v" => document!("$lt" => 5))));
        // A string bound never matches a number.
        assert!(!matches(&doc, &document!("v" => document!("$gt" => ""))));
        // A missing field never matches a range.
        assert!(!matches(
            &document!("_id" => 1),
            &document!("v" => document!("$gt" => 0)),
        ));
    }

    #[test]
    fn nan_equality_round_trips_through_compare() {
        let doc = document!("v" => f64::NAN);
        assert!(matches(&doc, &document!("v" => f64::NAN)));
        assert!(!matches(&doc, &document!("v" => 0.0)));
    }

    #[test]
    fn multiple_conditions_all_apply() {
        let doc = document!("a" => 1, "b" => "x");
        assert!(matches(&doc, &document!("a" => 1, "b" => "x")));
        assert!(!matches(&doc, &document!("a" => 1, "b" => "y")));
        assert!(matches(&doc, &Document::new()));
    }
}
