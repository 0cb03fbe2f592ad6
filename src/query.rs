//! Translates document filters, sorts and limits into parameterised SQL
//! fragments with conservative push-down semantics.
//!
//! Every function here is pure: it returns the fragment, the arguments in
//! placeholder order, and flags describing how much of the request the SQL
//! covers. Whenever a condition cannot be expressed exactly, the SQL selects a
//! superset of the matching rows and the caller re-filters in process.

use serde_json::Value as Json;
use tokio_postgres::types::ToSql;

use crate::sjson;
use crate::types::{Document, Value};

/// Largest integer magnitude a double carries exactly; equality on values
/// beyond it degrades to a range scan.
const MAX_SAFE_DOUBLE: f64 = 9_007_199_254_740_992.0; // 2^53
const MAX_SAFE_INT: i64 = 9_007_199_254_740_992; // 2^53

/// Generates `$1`, `$2`, … and guarantees the argument list order matches.
#[derive(Debug, Default)]
pub struct Placeholder(u32);

impl Placeholder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> String {
        self.0 += 1;
        format!("${}", self.0)
    }
}

/// One bound SQL argument.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlArg {
    Text(String),
    Jsonb(Json),
    Int(i64),
}

impl SqlArg {
    pub fn as_sql(&self) -> &(dyn ToSql + Sync) {
        match self {
            SqlArg::Text(s) => s,
            SqlArg::Jsonb(v) => v,
            SqlArg::Int(i) => i,
        }
    }
}

/// A translated WHERE clause.
#[derive(Debug, Default)]
pub struct WhereClause {
    /// Empty, or a string starting with ` WHERE `.
    pub sql: String,
    pub args: Vec<SqlArg>,
    /// Cleared when part of the filter could not be translated at all.
    pub pushdown: bool,
    /// Cleared when the translated SQL selects a superset of the matching
    /// rows; the caller must then re-filter.
    pub exact: bool,
}

/// A translated ORDER BY clause.
#[derive(Debug, Default)]
pub struct OrderByClause {
    pub sql: String,
    pub args: Vec<SqlArg>,
    pub pushdown: bool,
}

/// Input for assembling a full SELECT.
#[derive(Debug)]
pub struct SelectParams<'a> {
    pub schema: &'a str,
    pub table: &'a str,
    pub capped: bool,
    pub only_record_ids: bool,
}

/// Quotes a SQL identifier, doubling any embedded quote.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// The SELECT header for a collection table.
///
/// Capped collections expose the record id column and, when the caller gave no
/// sort of its own, preserve insertion order by it.
pub fn prepare_select_clause(p: &SelectParams<'_>) -> String {
    let from = format!("{}.{}", quote_ident(p.schema), quote_ident(p.table));
    match (p.capped, p.only_record_ids) {
        (true, true) => format!("SELECT _recordid FROM {}", from),
        (true, false) => format!("SELECT _recordid, _jsonb FROM {}", from),
        (false, _) => format!("SELECT _jsonb FROM {}", from),
    }
}

/// Builds the WHERE clause for a filter document.
///
/// Top-level keys starting with `$` are operators the caller evaluates itself
/// and are skipped here. Dotted paths and unsupported operators clear the
/// push-down flag; inexact translations only clear exactness.
pub fn prepare_where_clause(p: &mut Placeholder, filter: &Document) -> WhereClause {
    let mut clause = WhereClause {
        pushdown: true,
        exact: true,
        ..Default::default()
    };
    let mut fragments: Vec<String> = Vec::new();

    for (key, value) in filter.iter() {
        if key.starts_with('$') {
            continue;
        }
        if key.contains('.') {
            clause.pushdown = false;
            continue;
        }

        match value {
            Value::Document(ops) if has_operators(ops) => {
                for (op, operand) in ops.iter() {
                    match op {
                        "$eq" => {
                            append_equal(p, key, operand, &mut fragments, &mut clause);
                        }
                        "$ne" => {
                            append_not_equal(p, key, operand, &mut fragments, &mut clause);
                        }
                        // Range operators are evaluated by the caller.
                        _ => clause.pushdown = false,
                    }
                }
            }
            _ => append_equal(p, key, value, &mut fragments, &mut clause),
        }
    }

    if !fragments.is_empty() {
        clause.sql = format!(" WHERE {}", fragments.join(" AND "));
    }
    clause
}

/// Builds the ORDER BY clause for a sort document of field → ±1 pairs.
///
/// Only a single-key sort on an undotted path is pushed down; everything else
/// is left to the caller.
pub fn prepare_order_by_clause(p: &mut Placeholder, sort: Option<&Document>) -> OrderByClause {
    let mut clause = OrderByClause::default();

    let sort = match sort {
        Some(sort) if !sort.is_empty() => sort,
        _ => {
            clause.pushdown = true;
            return clause;
        }
    };
    if sort.len() != 1 {
        return clause;
    }

    let (field, direction) = match sort.iter().next() {
        Some(pair) => pair,
        None => return clause,
    };
    if field.contains('.') {
        return clause;
    }

    let descending = match direction {
        Value::Int32(d) => *d < 0,
        Value::Int64(d) => *d < 0,
        Value::Double(d) => *d < 0.0,
        _ => return clause,
    };

    clause.sql = format!(" ORDER BY _jsonb->{}", p.next());
    if descending {
        clause.sql.push_str(" DESC");
    }
    clause.args.push(SqlArg::Text(field.to_string()));
    clause.pushdown = true;
    clause
}

/// Builds the LIMIT clause; a zero limit means "no limit". Limits are always
/// pushdownable.
pub fn prepare_limit_clause(p: &mut Placeholder, limit: i64) -> (String, Vec<SqlArg>) {
    if limit == 0 {
        return (String::new(), Vec::new());
    }
    (format!(" LIMIT {}", p.next()), vec![SqlArg::Int(limit)])
}

/// Everything needed to assemble one SELECT over a collection table.
#[derive(Debug, Clone, Copy)]
pub struct QueryInput<'a> {
    pub schema: &'a str,
    pub table: &'a str,
    pub capped: bool,
    pub only_record_ids: bool,
    pub filter: Option<&'a Document>,
    pub sort: Option<&'a Document>,
    /// Zero means no limit.
    pub limit: i64,
}

/// A fully assembled SELECT with its arguments and push-down report.
#[derive(Debug)]
pub struct PreparedQuery {
    pub sql: String,
    pub args: Vec<SqlArg>,
    pub filter_pushdown: bool,
    pub filter_exact: bool,
    pub sort_pushdown: bool,
    pub limit_pushdown: bool,
}

/// Assembles the complete statement: header, WHERE, ORDER BY and LIMIT.
///
/// A capped collection with no caller-given sort is implicitly ordered by its
/// record id to preserve insertion order.
pub fn prepare_query(input: &QueryInput<'_>) -> PreparedQuery {
    let mut sql = prepare_select_clause(&SelectParams {
        schema: input.schema,
        table: input.table,
        capped: input.capped,
        only_record_ids: input.only_record_ids,
    });
    let mut p = Placeholder::new();
    let mut args = Vec::new();

    let mut filter_pushdown = true;
    let mut filter_exact = true;
    if let Some(filter) = input.filter {
        let clause = prepare_where_clause(&mut p, filter);
        filter_pushdown = clause.pushdown;
        filter_exact = clause.exact;
        sql.push_str(&clause.sql);
        args.extend(clause.args);
    }

    let order = prepare_order_by_clause(&mut p, input.sort);
    sql.push_str(&order.sql);
    args.extend(order.args);
    if input.capped && input.sort.map_or(true, Document::is_empty) {
        sql.push_str(" ORDER BY _recordid");
    }

    let (limit_sql, limit_args) = prepare_limit_clause(&mut p, input.limit);
    sql.push_str(&limit_sql);
    args.extend(limit_args);

    PreparedQuery {
        sql,
        args,
        filter_pushdown,
        filter_exact,
        sort_pushdown: order.pushdown,
        limit_pushdown: true,
    }
}

fn has_operators(doc: &Document) -> bool {
    doc.keys().any(|k| k.starts_with('$'))
}

/// Appends an equality fragment for `key = value` when the value type allows
/// an exact or degraded containment match.
fn append_equal(
    p: &mut Placeholder,
    key: &str,
    value: &Value,
    fragments: &mut Vec<String>,
    clause: &mut WhereClause,
) {
    match value {
        Value::Double(d) => append_number_equal(p, key, *d, fragments, clause),
        Value::Int64(i) => {
            if (-MAX_SAFE_INT..=MAX_SAFE_INT).contains(i) {
                append_containment(p, key, value, fragments, clause);
            } else {
                append_number_equal(p, key, *i as f64, fragments, clause);
            }
        }
        Value::String(_) | Value::ObjectId(_) | Value::DateTime(_) => {
            append_containment(p, key, value, fragments, clause);
        }
        Value::Bool(_) | Value::Int32(_) => {
            append_containment(p, key, value, fragments, clause);
        }
        // No containment form distinguishes these correctly; select everything
        // and let the caller filter.
        Value::Document(_)
        | Value::Array(_)
        | Value::Binary(_)
        | Value::Null
        | Value::Regex(_)
        | Value::Timestamp(_) => {
            clause.exact = false;
        }
    }
}

fn append_containment(
    p: &mut Placeholder,
    key: &str,
    value: &Value,
    fragments: &mut Vec<String>,
    clause: &mut WhereClause,
) {
    fragments.push(format!("_jsonb->{} @> {}", p.next(), p.next()));
    clause.args.push(SqlArg::Text(key.to_string()));
    clause
        .args
        .push(SqlArg::Jsonb(sjson::single_value_json(value)));
}

fn append_number_equal(
    p: &mut Placeholder,
    key: &str,
    d: f64,
    fragments: &mut Vec<String>,
    clause: &mut WhereClause,
) {
    if (-MAX_SAFE_DOUBLE..=MAX_SAFE_DOUBLE).contains(&d) {
        fragments.push(format!("_jsonb->{} @> {}", p.next(), p.next()));
        clause.args.push(SqlArg::Text(key.to_string()));
        clause
            .args
            .push(SqlArg::Jsonb(sjson::single_value_json(&Value::Double(d))));
        return;
    }

    // Beyond 2^53 adjacent doubles collide, so equality degrades to a range
    // scan over the safe boundary; the caller re-checks the exact value.
    clause.exact = false;
    if d.is_nan() {
        return;
    }
    let (op, bound) = if d > 0.0 {
        (">", MAX_SAFE_DOUBLE)
    } else {
        ("<", -MAX_SAFE_DOUBLE)
    };
    fragments.push(format!("_jsonb->{} {} {}", p.next(), op, p.next()));
    clause.args.push(SqlArg::Text(key.to_string()));
    clause
        .args
        .push(SqlArg::Jsonb(sjson::single_value_json(&Value::Double(bound))));
}

/// Appends a `$ne` fragment.
///
/// The composite predicate needs the key-exists check because
/// `NOT (missing @> v)` would exclude documents without the key, which `$ne`
/// must match. The schema-type guard keeps cross-type numeric aliases apart.
fn append_not_equal(
    p: &mut Placeholder,
    key: &str,
    value: &Value,
    fragments: &mut Vec<String>,
    clause: &mut WhereClause,
) {
    match value {
        Value::Document(_) | Value::Array(_) | Value::Null => {
            clause.pushdown = false;
            return;
        }
        // The single-value encoding drops the binary subtype and the regex
        // options, so the predicate cannot tell such values apart and would
        // exclude rows it must keep.
        Value::Binary(_) | Value::Regex(_) => {
            clause.pushdown = false;
            return;
        }
        Value::Double(d) if d.is_nan() || d.abs() > MAX_SAFE_DOUBLE => {
            clause.pushdown = false;
            return;
        }
        Value::Int64(i) if !(-MAX_SAFE_INT..=MAX_SAFE_INT).contains(i) => {
            clause.pushdown = false;
            return;
        }
        _ => {}
    }

    let key_arg = p.next();
    let value_arg = p.next();
    fragments.push(format!(
        "NOT ( _jsonb ? {k} AND _jsonb->{k} @> {v} AND _jsonb->'$s'->'p'->{k}->'t' = '\"{t}\"' )",
        k = key_arg,
        v = value_arg,
        t = sjson::type_tag(value),
    ));
    clause.args.push(SqlArg::Text(key.to_string()));
    clause
        .args
        .push(SqlArg::Jsonb(sjson::single_value_json(value)));
    // The guarded predicate still admits rows the caller has to re-check.
    clause.exact = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{array, document};
    use serde_json::json;

    fn where_clause(filter: &Document) -> WhereClause {
        let mut p = Placeholder::new();
        prepare_where_clause(&mut p, filter)
    }

    #[test]
    fn placeholder_counts_up() {
        let mut p = Placeholder::new();
        assert_eq!(p.next(), "$1");
        assert_eq!(p.next(), "$2");
        assert_eq!(p.next(), "$3");
    }

    #[test]
    fn scalar_equality_is_exact_containment() {
        let c = where_clause(&document!("v" => "foo"));
        assert_eq!(c.sql, " WHERE _jsonb->$1 @> $2");
        assert_eq!(
            c.args,
            vec![SqlArg::Text("v".into()), SqlArg::Jsonb(json!("foo"))]
        );
        assert!(c.pushdown);
        assert!(c.exact);

        let c = where_clause(&document!("a" => 42, "b" => true));
        assert_eq!(c.sql, " WHERE _jsonb->$1 @> $2 AND _jsonb->$3 @> $4");
        assert_eq!(c.args.len(), 4);
        assert!(c.pushdown && c.exact);
    }

    #[test]
    fn explicit_eq_operator_matches_scalar_equality() {
        let c = where_clause(&document!("v" => document!("$eq" => 42)));
        assert_eq!(c.sql, " WHERE _jsonb->$1 @> $2");
        assert_eq!(
            c.args,
            vec![SqlArg::Text("v".into()), SqlArg::Jsonb(json!(42))]
        );
        assert!(c.pushdown && c.exact);
    }

    #[test]
    fn big_double_degrades_to_range() {
        let c = where_clause(&document!("v" => 1.0e100));
        assert_eq!(c.sql, " WHERE _jsonb->$1 > $2");
        assert_eq!(
            c.args,
            vec![
                SqlArg::Text("v".into()),
                SqlArg::Jsonb(json!(9_007_199_254_740_992.0)),
            ]
        );
        assert!(c.pushdown);
        assert!(!c.exact);

        let c = where_clause(&document!("v" => -1.0e100));
        assert_eq!(c.sql, " WHERE _jsonb->$1 < $2");
        assert!(!c.exact);

        // 2^53 itself still matches exactly.
        let c = where_clause(&document!("v" => 9_007_199_254_740_992.0));
        assert_eq!(c.sql, " WHERE _jsonb->$1 @> $2");
        assert!(c.exact);
    }

    #[test]
    fn big_int64_degrades_to_range() {
        let c = where_clause(&document!("v" => i64::MAX));
        assert_eq!(c.sql, " WHERE _jsonb->$1 > $2");
        assert!(c.pushdown);
        assert!(!c.exact);

        let c = where_clause(&document!("v" => 42i64));
        assert_eq!(c.sql, " WHERE _jsonb->$1 @> $2");
        assert!(c.exact);
    }

    #[test]
    fn nan_equality_emits_no_fragment() {
        let c = where_clause(&document!("v" => f64::NAN));
        assert_eq!(c.sql, "");
        assert!(c.pushdown);
        assert!(!c.exact);
    }

    #[test]
    fn dotted_path_clears_pushdown() {
        let c = where_clause(&document!("a.b" => 1));
        assert_eq!(c.sql, "");
        assert!(!c.pushdown);
    }

    #[test]
    fn dollar_keys_are_skipped_silently() {
        let c = where_clause(&document!("$comment" => "hi", "v" => 1));
        assert_eq!(c.sql, " WHERE _jsonb->$1 @> $2");
        assert!(c.pushdown && c.exact);
    }

    #[test]
    fn range_operators_clear_pushdown() {
        for op in ["$gt", "$gte", "$lt", "$lte"] {
            let c = where_clause(&document!("v" => document!(op => 1)));
            assert_eq!(c.sql, "");
            assert!(!c.pushdown, "{op} should clear pushdown");
        }
    }

    #[test]
    fn composite_equality_skips_fragment_but_keeps_pushdown() {
        for value in [
            Value::Document(document!("x" => 1)),
            Value::Array(array![1]),
            Value::Null,
            Value::Timestamp(7),
        ] {
            let mut filter = Document::new();
            filter.set("v", value);
            let c = where_clause(&filter);
            assert_eq!(c.sql, "");
            assert!(c.pushdown);
            assert!(!c.exact);
        }
    }

    #[test]
    fn ne_emits_guarded_predicate() {
        let c = where_clause(&document!("v" => document!("$ne" => 1)));
        assert_eq!(
            c.sql,
            " WHERE NOT ( _jsonb ? $1 AND _jsonb->$1 @> $2 AND _jsonb->'$s'->'p'->$1->'t' = '\"int\"' )"
        );
        assert_eq!(
            c.args,
            vec![SqlArg::Text("v".into()), SqlArg::Jsonb(json!(1))]
        );
        assert!(c.pushdown);
        assert!(!c.exact);
    }

    #[test]
    fn ne_type_tag_follows_value() {
        let c = where_clause(&document!("v" => document!("$ne" => "s")));
        assert!(c.sql.contains(r#"'"string"'"#));

        let c = where_clause(&document!("v" => document!("$ne" => 2.5)));
        assert!(c.sql.contains(r#"'"double"'"#));
    }

    #[test]
    fn ne_on_null_or_composite_clears_pushdown() {
        for value in [
            Value::Null,
            Value::Document(document!("x" => 1)),
            Value::Array(array![1]),
            Value::Binary(crate::types::Binary {
                bytes: vec![0x42],
                subtype: crate::types::BinarySubtype::Uuid,
            }),
            Value::Regex(crate::types::Regex {
                pattern: "^foo".into(),
                options: "i".into(),
            }),
        ] {
            let mut op = Document::new();
            op.set("$ne", value);
            let mut filter = Document::new();
            filter.set("v", Value::Document(op));
            let c = where_clause(&filter);
            assert_eq!(c.sql, "");
            assert!(!c.pushdown);
        }
    }

    #[test]
    fn sort_single_key() {
        let mut p = Placeholder::new();
        let c = prepare_order_by_clause(&mut p, Some(&document!("v" => 1)));
        assert_eq!(c.sql, " ORDER BY _jsonb->$1");
        assert_eq!(c.args, vec![SqlArg::Text("v".into())]);
        assert!(c.pushdown);

        let mut p = Placeholder::new();
        let c = prepare_order_by_clause(&mut p, Some(&document!("v" => -1)));
        assert_eq!(c.sql, " ORDER BY _jsonb->$1 DESC");
        assert!(c.pushdown);
    }

    #[test]
    fn sort_multi_key_or_dotted_disables_pushdown() {
        let mut p = Placeholder::new();
        let c = prepare_order_by_clause(&mut p, Some(&document!("a" => 1, "b" => -1)));
        assert_eq!(c.sql, "");
        assert!(!c.pushdown);

        let mut p = Placeholder::new();
        let c = prepare_order_by_clause(&mut p, Some(&document!("a.b" => 1)));
        assert_eq!(c.sql, "");
        assert!(!c.pushdown);
    }

    #[test]
    fn no_sort_is_pushdownable() {
        let mut p = Placeholder::new();
        let c = prepare_order_by_clause(&mut p, None);
        assert_eq!(c.sql, "");
        assert!(c.pushdown);
    }

    #[test]
    fn limit_clause() {
        let mut p = Placeholder::new();
        let (sql, args) = prepare_limit_clause(&mut p, 7);
        assert_eq!(sql, " LIMIT $1");
        assert_eq!(args, vec![SqlArg::Int(7)]);

        let mut p = Placeholder::new();
        let (sql, args) = prepare_limit_clause(&mut p, 0);
        assert_eq!(sql, "");
        assert!(args.is_empty());
    }

    #[test]
    fn select_headers() {
        let params = SelectParams {
            schema: "db",
            table: "tbl",
            capped: false,
            only_record_ids: false,
        };
        assert_eq!(
            prepare_select_clause(&params),
            r#"SELECT _jsonb FROM "db"."tbl""#
        );

        let params = SelectParams {
            capped: true,
            ..params
        };
        assert_eq!(
            prepare_select_clause(&params),
            r#"SELECT _recordid, _jsonb FROM "db"."tbl""#
        );

        let params = SelectParams {
            only_record_ids: true,
            ..params
        };
        assert_eq!(
            prepare_select_clause(&params),
            r#"SELECT _recordid FROM "db"."tbl""#
        );
    }

    fn query_input<'a>(
        filter: Option<&'a Document>,
        sort: Option<&'a Document>,
        limit: i64,
    ) -> QueryInput<'a> {
        QueryInput {
            schema: "db",
            table: "tbl",
            capped: false,
            only_record_ids: false,
            filter,
            sort,
            limit,
        }
    }

    #[test]
    fn prepare_query_assembles_all_clauses() {
        let filter = document!("v" => 1);
        let sort = document!("v" => -1);
        let q = prepare_query(&query_input(Some(&filter), Some(&sort), 5));
        assert_eq!(
            q.sql,
            "SELECT _jsonb FROM \"db\".\"tbl\" WHERE _jsonb->$1 @> $2 ORDER BY _jsonb->$3 DESC LIMIT $4"
        );
        assert_eq!(q.args.len(), 4);
        assert!(q.filter_pushdown && q.filter_exact && q.sort_pushdown && q.limit_pushdown);
    }

    #[test]
    fn prepare_query_without_parameters() {
        let q = prepare_query(&query_input(None, None, 0));
        assert_eq!(q.sql, "SELECT _jsonb FROM \"db\".\"tbl\"");
        assert!(q.args.is_empty());
        assert!(q.filter_pushdown && q.filter_exact && q.sort_pushdown);
    }

    #[test]
    fn prepare_query_reports_partial_pushdown() {
        let filter = document!("a.b" => 1);
        let sort = document!("x" => 1, "y" => 1);
        let q = prepare_query(&query_input(Some(&filter), Some(&sort), 0));
        assert_eq!(q.sql, "SELECT _jsonb FROM \"db\".\"tbl\"");
        assert!(!q.filter_pushdown);
        assert!(!q.sort_pushdown);
    }

    #[test]
    fn prepare_query_orders_capped_scans_by_record_id() {
        let mut input = query_input(None, None, 0);
        input.capped = true;
        let q = prepare_query(&input);
        assert_eq!(
            q.sql,
            "SELECT _recordid, _jsonb FROM \"db\".\"tbl\" ORDER BY _recordid"
        );

        input.only_record_ids = true;
        let q = prepare_query(&input);
        assert_eq!(q.sql, "SELECT _recordid FROM \"db\".\"tbl\" ORDER BY _recordid");

        // An explicit sort wins over insertion order.
        let sort = document!("v" => 1);
        input.only_record_ids = false;
        input.sort = Some(&sort);
        let q = prepare_query(&input);
        assert_eq!(
            q.sql,
            "SELECT _recordid, _jsonb FROM \"db\".\"tbl\" ORDER BY _jsonb->$1"
        );
    }

    #[test]
    fn quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn args_follow_placeholder_order() {
        let mut p = Placeholder::new();
        let filter = document!("a" => 1, "b" => "x");
        let w = prepare_where_clause(&mut p, &filter);
        let o = prepare_order_by_clause(&mut p, Some(&document!("a" => 1)));
        let (l_sql, l_args) = prepare_limit_clause(&mut p, 5);

        assert_eq!(w.sql, " WHERE _jsonb->$1 @> $2 AND _jsonb->$3 @> $4");
        assert_eq!(o.sql, " ORDER BY _jsonb->$5");
        assert_eq!(l_sql, " LIMIT $6");
        assert_eq!(w.args.len() + o.args.len() + l_args.len(), 6);
    }
}
