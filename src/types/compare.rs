use std::cmp::Ordering;

use super::{Array, Document, Value};

/// Cross-type rank in the server 6.0 comparison order. Numbers share a rank
/// regardless of their concrete width.
pub(crate) fn rank(v: &Value) -> u8 {
    match v {
        Value::Null => 1,
        Value::Double(_) | Value::Int32(_) | Value::Int64(_) => 2,
        Value::String(_) => 3,
        Value::Document(_) => 4,
        Value::Array(_) => 5,
        Value::Binary(_) => 6,
        Value::ObjectId(_) => 7,
        Value::Bool(_) => 8,
        Value::DateTime(_) => 9,
        Value::Timestamp(_) => 10,
        Value::Regex(_) => 11,
    }
}

/// Totally orders two values: by rank first, then by value within the rank.
///
/// Numeric comparisons use mathematical value across Double/Int32/Int64; NaN
/// equals NaN and sorts below every other number.
pub fn compare(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (rank(a), rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }

    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Document(x), Value::Document(y)) => compare_documents(x, y),
        (Value::Array(x), Value::Array(y)) => compare_arrays(x, y),
        (Value::Binary(x), Value::Binary(y)) => x
            .bytes
            .len()
            .cmp(&y.bytes.len())
            .then(x.subtype.byte().cmp(&y.subtype.byte()))
            .then_with(|| x.bytes.cmp(&y.bytes)),
        (Value::ObjectId(x), Value::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::DateTime(x), Value::DateTime(y)) => x.cmp(y),
        (Value::Timestamp(x), Value::Timestamp(y)) => x.cmp(y),
        (Value::Regex(x), Value::Regex(y)) => {
            x.pattern.cmp(&y.pattern).then(x.options.cmp(&y.options))
        }
        _ => compare_numbers(a, b),
    }
}

fn compare_numbers(a: &Value, b: &Value) -> Ordering {
    // Integer-integer pairs compare exactly; anything involving a double goes
    // through f64, which is where NaN can appear.
    match (int_value(a), int_value(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => {
            let (x, y) = (float_value(a), float_value(b));
            match (x.is_nan(), y.is_nan()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            }
        }
    }
}

fn int_value(v: &Value) -> Option<i64> {
    match v {
        Value::Int32(i) => Some(i64::from(*i)),
        Value::Int64(i) => Some(*i),
        _ => None,
    }
}

fn float_value(v: &Value) -> f64 {
    match v {
        Value::Double(d) => *d,
        Value::Int32(i) => f64::from(*i),
        Value::Int64(i) => *i as f64,
        _ => f64::NAN,
    }
}

fn compare_documents(a: &Document, b: &Document) -> Ordering {
    for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
        let key_ord = ka.cmp(kb);
        if key_ord != Ordering::Equal {
            return key_ord;
        }
        let val_ord = compare(va, vb);
        if val_ord != Ordering::Equal {
            return val_ord;
        }
    }
    a.len().cmp(&b.len())
}

fn compare_arrays(a: &Array, b: &Array) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = compare(x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{array, document};

    #[test]
    fn rank_table_matches_server_order() {
        let ladder = vec![
            Value::Null,
            Value::Int32(5),
            Value::String("a".into()),
            Value::Document(document!("a" => 1)),
            Value::Array(array![1]),
            Value::Binary(crate::types::Binary {
                bytes: vec![1],
                subtype: crate::types::BinarySubtype::Generic,
            }),
            Value::ObjectId(bson::oid::ObjectId::from_bytes([0; 12])),
            Value::Bool(false),
            Value::DateTime(0),
            Value::Timestamp(0),
            Value::Regex(crate::types::Regex {
                pattern: "a".into(),
                options: String::new(),
            }),
        ];

        for pair in ladder.windows(2) {
            assert_eq!(compare(&pair[0], &pair[1]), Ordering::Less);
        }
    }

    #[test]
    fn numbers_compare_mathematically() {
        assert_eq!(
            compare(&Value::Int32(2), &Value::Double(2.0)),
            Ordering::Equal
        );
        assert_eq!(
            compare(&Value::Int64(3), &Value::Double(2.5)),
            Ordering::Greater
        );
        assert_eq!(
            compare(&Value::Double(1.5), &Value::Int32(2)),
            Ordering::Less
        );
        // i64 values beyond 2^53 keep exact integer comparison.
        assert_eq!(
            compare(&Value::Int64(i64::MAX), &Value::Int64(i64::MAX - 1)),
            Ordering::Greater
        );
    }

    #[test]
    fn nan_sorts_below_numbers_and_equals_itself() {
        assert_eq!(
            compare(&Value::Double(f64::NAN), &Value::Double(f64::NEG_INFINITY)),
            Ordering::Less
        );
        assert_eq!(
            compare(&Value::Double(f64::NAN), &Value::Double(f64::NAN)),
            Ordering::Equal
        );
        assert_eq!(
            compare(&Value::Double(f64::NAN), &Value::Null),
            Ordering::Greater
        );
    }

    #[test]
    fn composite_comparison_is_elementwise() {
        assert_eq!(
            compare(&Value::Array(array![1, 2]), &Value::Array(array![1, 2, 0])),
            Ordering::Less
        );
        assert_eq!(
            compare(
                &Value::Document(document!("a" => 1)),
                &Value::Document(document!("a" => 2)),
            ),
            Ordering::Less
        );
        assert_eq!(
            compare(
                &Value::Document(document!("a" => 1)),
                &Value::Document(document!("b" => 0)),
            ),
            Ordering::Less
        );
    }
}
