//! Builds parameterized SQL from a structured query.
//!
//! Filters arrive as a tree of tagged arrays (`["GtE", ["Name", "Age"],
//! ["Const", 20]]`); compilation validates tags, arity, and identifiers
//! synchronously, so every builder error surfaces before any I/O. Bind
//! parameters are accumulated in emission order.

use serde_json::Value;

use grid_common::{CellValue, EngineError, EngineResult, Query, QueryCursor};

/// Compiled SQL plus its bind parameters in emission order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    /// The SQL text, with `?` placeholders.
    pub sql: String,
    /// Bind parameters, ordered to match the placeholders.
    pub params: Vec<CellValue>,
}

/// Alias used for the previous-row join.
const PREV_ALIAS: &str = "_prev";
/// Alias used inside the previous-row correlated subquery.
const CAND_ALIAS: &str = "_cand";
/// Synthetic column exposing the previous row's id.
pub const PREVIOUS_COL: &str = "_grist_Previous";

#[derive(Debug, Clone)]
struct SortKey {
    col: String,
    descending: bool,
}

enum Rhs<'a> {
    /// A bind parameter.
    Param(&'a Value),
    /// A pre-rendered SQL expression.
    Expr(String),
}

fn builder_err(message: impl Into<String>) -> EngineError {
    EngineError::Builder(message.into())
}

/// Validates a column or table identifier: `[A-Za-z0-9_.]+`.
pub(crate) fn check_ident(ident: &str) -> EngineResult<&str> {
    let ok = !ident.is_empty()
        && ident
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if ok {
        Ok(ident)
    } else {
        Err(builder_err(format!("invalid identifier: {ident:?}")))
    }
}

fn quote(ident: &str) -> String {
    format!("\"{ident}\"")
}

/// Renders a column reference, prefixed with its table unless the caller
/// asked for no prefix (used inside joins).
fn col_expr(table: Option<&str>, col: &str) -> String {
    match table {
        Some(table) => format!("\"{table}\".\"{col}\""),
        None => quote(col),
    }
}

/// Builds the full SELECT for a structured query.
pub fn build_fetch_sql(query: &Query) -> EngineResult<SqlQuery> {
    let table = check_ident(&query.table_id)?;
    let sort_keys = parse_sort(query.sort.as_deref())?;
    let mut params = Vec::new();

    // The join clause precedes WHERE in the SQL text, so its parameters
    // are accumulated first.
    let prev_join = if query.include_previous {
        Some(build_prev_join(
            table,
            &sort_keys,
            query.filters.as_ref(),
            &mut params,
        )?)
    } else {
        None
    };

    let mut where_parts = Vec::new();
    if let Some(filters) = &query.filters {
        where_parts.push(compile_filter(filters, Some(table), &mut params)?);
    }
    if let Some(row_ids) = &query.row_ids {
        where_parts.push(row_ids_clause(table, row_ids));
    }
    if let Some(cursor) = &query.cursor {
        where_parts.push(cursor_clause(&sort_keys, cursor, Some(table), &mut params)?);
    }

    let projection = build_projection(table, query)?;

    let mut sql = format!("SELECT {projection} FROM {}", quote(table));
    if let Some(join) = prev_join {
        sql.push(' ');
        sql.push_str(&join);
    }
    if !where_parts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_parts.join(" AND "));
    }
    sql.push_str(" ORDER BY ");
    sql.push_str(&order_clause(&sort_keys, Some(table), false));
    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    Ok(SqlQuery { sql, params })
}

fn parse_sort(sort: Option<&[String]>) -> EngineResult<Vec<SortKey>> {
    sort.unwrap_or(&[])
        .iter()
        .map(|spec| {
            let (descending, col) = match spec.strip_prefix('-') {
                Some(col) => (true, col),
                None => (false, spec.as_str()),
            };
            check_ident(col)?;
            Ok(SortKey {
                col: col.to_string(),
                descending,
            })
        })
        .collect()
}

/// Renders the ORDER BY list: each sort column with its null placement,
/// then `id` as the final tie-breaker so ordering is total. Reverse mode
/// swaps every direction, tie-breaker included.
fn order_clause(sort_keys: &[SortKey], table: Option<&str>, reverse: bool) -> String {
    let id_key = SortKey {
        col: "id".to_string(),
        descending: false,
    };
    sort_keys
        .iter()
        .chain(std::iter::once(&id_key))
        .map(|key| {
            let descending = key.descending != reverse;
            let direction = if descending {
                "DESC NULLS FIRST"
            } else {
                "ASC NULLS LAST"
            };
            format!("{} {direction}", col_expr(table, &key.col))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn build_projection(table: &str, query: &Query) -> EngineResult<String> {
    let mut parts = Vec::new();
    match &query.columns {
        Some(columns) => {
            parts.push(col_expr(Some(table), "id"));
            for col in columns {
                check_ident(col)?;
                if col != "id" {
                    parts.push(col_expr(Some(table), col));
                }
            }
        }
        None => parts.push(format!("{}.*", quote(table))),
    }
    if query.include_previous {
        parts.push(format!(
            "{} AS {}",
            col_expr(Some(PREV_ALIAS), "id"),
            quote(PREVIOUS_COL)
        ));
    }
    Ok(parts.join(", "))
}

fn row_ids_clause(table: &str, row_ids: &[i64]) -> String {
    if row_ids.is_empty() {
        return "0".to_string();
    }
    let list = row_ids
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!("{} IN ({list})", col_expr(Some(table), "id"))
}

/// Renders the strictly-after predicate for an `after` cursor. `before`
/// is reserved and rejected.
fn cursor_clause(
    sort_keys: &[SortKey],
    cursor: &QueryCursor,
    table: Option<&str>,
    params: &mut Vec<CellValue>,
) -> EngineResult<String> {
    match cursor.0.as_str() {
        "after" => {}
        "before" => return Err(builder_err("before cursors are reserved")),
        other => return Err(builder_err(format!("unknown cursor kind: {other}"))),
    }
    if cursor.1.len() != sort_keys.len() {
        return Err(builder_err(format!(
            "cursor has {} values for {} sort columns",
            cursor.1.len(),
            sort_keys.len()
        )));
    }
    if sort_keys.is_empty() {
        return Err(builder_err("cursor requires a sort"));
    }
    let rhs: Vec<Rhs<'_>> = cursor.1.iter().map(Rhs::Param).collect();
    lex_compare(sort_keys, &rhs, table, params, false)
}

/// Generates the lexicographic strictly-after (or, with `before`,
/// strictly-before) predicate: strict comparison on the first key, equal
/// prefixes recursing into the next. A descending column flips its
/// comparison direction.
fn lex_compare(
    keys: &[SortKey],
    rhs: &[Rhs<'_>],
    table: Option<&str>,
    params: &mut Vec<CellValue>,
    before: bool,
) -> EngineResult<String> {
    let key = &keys[0];
    let lhs = col_expr(table, &key.col);
    let strict_op = if key.descending != before { "<" } else { ">" };
    let first = emit_rhs(&rhs[0], params)?;
    let strict = format!("{lhs} {strict_op} {first}");
    if keys.len() == 1 {
        return Ok(format!("({strict})"));
    }
    let again = emit_rhs(&rhs[0], params)?;
    let rest = lex_compare(&keys[1..], &rhs[1..], table, params, before)?;
    Ok(format!("({strict} OR ({lhs} = {again} AND {rest}))"))
}

fn emit_rhs(rhs: &Rhs<'_>, params: &mut Vec<CellValue>) -> EngineResult<String> {
    match rhs {
        Rhs::Param(value) => {
            params.push(CellValue::from_json(value).map_err(builder_err)?);
            Ok("?".to_string())
        }
        Rhs::Expr(expr) => Ok(expr.clone()),
    }
}

/// Builds the correlated left join that computes, per result row, the id
/// of the row immediately before it in the current order and filter.
fn build_prev_join(
    table: &str,
    sort_keys: &[SortKey],
    filters: Option<&Value>,
    params: &mut Vec<CellValue>,
) -> EngineResult<String> {
    let mut inner_parts = Vec::new();
    if let Some(filters) = filters {
        inner_parts.push(compile_filter(filters, Some(CAND_ALIAS), params)?);
    }

    let mut keys = sort_keys.to_vec();
    keys.push(SortKey {
        col: "id".to_string(),
        descending: false,
    });
    let rhs: Vec<Rhs<'_>> = keys
        .iter()
        .map(|key| Rhs::Expr(col_expr(Some(table), &key.col)))
        .collect();
    inner_parts.push(lex_compare(&keys, &rhs, Some(CAND_ALIAS), params, true)?);

    Ok(format!(
        "LEFT JOIN {table_q} AS {prev_q} ON {prev_id} = (SELECT {cand_id} FROM {table_q} AS {cand_q} WHERE {inner} ORDER BY {order} LIMIT 1)",
        table_q = quote(table),
        prev_q = quote(PREV_ALIAS),
        prev_id = col_expr(Some(PREV_ALIAS), "id"),
        cand_id = col_expr(Some(CAND_ALIAS), "id"),
        cand_q = quote(CAND_ALIAS),
        inner = inner_parts.join(" AND "),
        order = order_clause(sort_keys, Some(CAND_ALIAS), true),
    ))
}

/// Compiles one filter node. `table` is the identifier prefix, or `None`
/// for unprefixed emission.
pub(crate) fn compile_filter(
    node: &Value,
    table: Option<&str>,
    params: &mut Vec<CellValue>,
) -> EngineResult<String> {
    let items = node
        .as_array()
        .ok_or_else(|| builder_err(format!("filter node must be an array, got {node}")))?;
    let tag = items
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| builder_err("filter node must start with a string tag"))?;
    let args = &items[1..];

    let compile_args = |params: &mut Vec<CellValue>| -> EngineResult<Vec<String>> {
        args.iter()
            .map(|arg| compile_filter(arg, table, params))
            .collect()
    };
    let need = |count: usize| -> EngineResult<()> {
        if args.len() == count {
            Ok(())
        } else {
            Err(builder_err(format!(
                "{tag} takes {count} arguments, got {}",
                args.len()
            )))
        }
    };
    let need_at_least = |count: usize| -> EngineResult<()> {
        if args.len() >= count {
            Ok(())
        } else {
            Err(builder_err(format!(
                "{tag} takes at least {count} argument(s), got {}",
                args.len()
            )))
        }
    };

    match tag {
        "And" | "Or" => {
            need_at_least(1)?;
            let joiner = if tag == "And" { " AND " } else { " OR " };
            Ok(format!("({})", compile_args(params)?.join(joiner)))
        }
        "Not" => {
            need(1)?;
            Ok(format!("NOT ({})", compile_filter(&args[0], table, params)?))
        }
        "Add" | "Sub" | "Mult" | "Div" | "Mod" => {
            need_at_least(1)?;
            let op = match tag {
                "Add" => " + ",
                "Sub" => " - ",
                "Mult" => " * ",
                "Div" => " / ",
                _ => " % ",
            };
            Ok(format!("({})", compile_args(params)?.join(op)))
        }
        "Eq" | "NotEq" | "Lt" | "LtE" | "Gt" | "GtE" | "Is" | "IsNot" => {
            need(2)?;
            let op = match tag {
                "Eq" => "=",
                "NotEq" => "!=",
                "Lt" => "<",
                "LtE" => "<=",
                "Gt" => ">",
                "GtE" => ">=",
                "Is" => "IS",
                _ => "IS NOT",
            };
            let left = compile_filter(&args[0], table, params)?;
            let right = compile_filter(&args[1], table, params)?;
            Ok(format!("({left} {op} {right})"))
        }
        "In" | "NotIn" => {
            need(2)?;
            let op = if tag == "In" { "IN" } else { "NOT IN" };
            let left = compile_filter(&args[0], table, params)?;
            let right = compile_filter(&args[1], table, params)?;
            // A List argument is already parenthesized; anything else
            // becomes a one-element set.
            let is_list = args[1]
                .as_array()
                .and_then(|a| a.first())
                .and_then(Value::as_str)
                == Some("List");
            if is_list {
                Ok(format!("({left} {op} {right})"))
            } else {
                Ok(format!("({left} {op} ({right}))"))
            }
        }
        "List" => {
            if args.is_empty() {
                // An empty set: matches nothing for IN, everything for
                // NOT IN.
                return Ok("(SELECT 1 WHERE 0)".to_string());
            }
            Ok(format!("({})", compile_args(params)?.join(", ")))
        }
        "Const" => {
            need(1)?;
            params.push(CellValue::from_json(&args[0]).map_err(builder_err)?);
            Ok("?".to_string())
        }
        "Name" => {
            need(1)?;
            let name = args[0]
                .as_str()
                .ok_or_else(|| builder_err("Name takes a column identifier"))?;
            check_ident(name)?;
            Ok(col_expr(table, name))
        }
        "Comment" => {
            need_at_least(1)?;
            compile_filter(&args[0], table, params)
        }
        other => Err(builder_err(format!("unknown filter tag: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile(node: Value) -> EngineResult<(String, Vec<CellValue>)> {
        let mut params = Vec::new();
        let sql = compile_filter(&node, Some("T"), &mut params)?;
        Ok((sql, params))
    }

    #[test]
    fn test_filter_comparison() {
        let (sql, params) =
            compile(json!(["GtE", ["Name", "Age"], ["Const", 20]])).unwrap();
        assert_eq!(sql, "(\"T\".\"Age\" >= ?)");
        assert_eq!(params, vec![CellValue::Int(20)]);
    }

    #[test]
    fn test_filter_logical_and_arithmetic() {
        let (sql, params) = compile(json!([
            "And",
            ["Eq", ["Name", "a"], ["Const", "x"]],
            ["Lt", ["Add", ["Name", "b"], ["Const", 1]], ["Const", 10]]
        ]))
        .unwrap();
        assert_eq!(
            sql,
            "((\"T\".\"a\" = ?) AND ((\"T\".\"b\" + ?) < ?))"
        );
        assert_eq!(
            params,
            vec![
                CellValue::Text("x".into()),
                CellValue::Int(1),
                CellValue::Int(10)
            ]
        );
    }

    #[test]
    fn test_filter_in_list() {
        let (sql, params) = compile(json!([
            "In",
            ["Name", "a"],
            ["List", ["Const", 1], ["Const", 2]]
        ]))
        .unwrap();
        assert_eq!(sql, "(\"T\".\"a\" IN (?, ?))");
        assert_eq!(params, vec![CellValue::Int(1), CellValue::Int(2)]);
    }

    #[test]
    fn test_filter_empty_list() {
        let (sql, _) = compile(json!(["In", ["Name", "a"], ["List"]])).unwrap();
        assert_eq!(sql, "(\"T\".\"a\" IN (SELECT 1 WHERE 0))");
    }

    #[test]
    fn test_filter_comment_is_transparent() {
        let (sql, _) =
            compile(json!(["Comment", ["Name", "a"], "why this filter exists"])).unwrap();
        assert_eq!(sql, "\"T\".\"a\"");
    }

    #[test]
    fn test_filter_arity_errors() {
        assert!(matches!(
            compile(json!(["Not"])),
            Err(EngineError::Builder(_))
        ));
        assert!(matches!(
            compile(json!(["Eq", ["Name", "a"]])),
            Err(EngineError::Builder(_))
        ));
        assert!(matches!(
            compile(json!(["And"])),
            Err(EngineError::Builder(_))
        ));
    }

    #[test]
    fn test_filter_unknown_tag() {
        assert!(matches!(
            compile(json!(["Explode", ["Name", "a"]])),
            Err(EngineError::Builder(_))
        ));
    }

    #[test]
    fn test_bad_identifier() {
        assert!(matches!(
            compile(json!(["Name", "a; DROP TABLE"])),
            Err(EngineError::Builder(_))
        ));
        assert!(check_ident("Table1.col_2").is_ok());
        assert!(check_ident("").is_err());
    }

    #[test]
    fn test_plain_query_sql() {
        let built = build_fetch_sql(&Query::table("Table1")).unwrap();
        assert_eq!(
            built.sql,
            "SELECT \"Table1\".* FROM \"Table1\" ORDER BY \"Table1\".\"id\" ASC NULLS LAST"
        );
        assert!(built.params.is_empty());
    }

    #[test]
    fn test_sorted_filtered_query_sql() {
        let query = Query {
            filters: Some(json!(["GtE", ["Name", "Age"], ["Const", 20]])),
            sort: Some(vec!["-Age".into()]),
            limit: Some(10),
            ..Query::table("Table1")
        };
        let built = build_fetch_sql(&query).unwrap();
        assert_eq!(
            built.sql,
            "SELECT \"Table1\".* FROM \"Table1\" WHERE (\"Table1\".\"Age\" >= ?) \
             ORDER BY \"Table1\".\"Age\" DESC NULLS FIRST, \"Table1\".\"id\" ASC NULLS LAST \
             LIMIT 10"
        );
        assert_eq!(built.params, vec![CellValue::Int(20)]);
    }

    #[test]
    fn test_cursor_sql() {
        let query = Query {
            sort: Some(vec!["id".into()]),
            cursor: Some(QueryCursor::after(vec![json!(1000)])),
            ..Query::table("T")
        };
        let built = build_fetch_sql(&query).unwrap();
        assert!(built.sql.contains("WHERE (\"T\".\"id\" > ?)"));
        assert_eq!(built.params, vec![CellValue::Int(1000)]);
    }

    #[test]
    fn test_cursor_multi_key() {
        let query = Query {
            sort: Some(vec!["Name".into(), "-Age".into()]),
            cursor: Some(QueryCursor::after(vec![json!("B"), json!(20)])),
            ..Query::table("T")
        };
        let built = build_fetch_sql(&query).unwrap();
        assert!(built.sql.contains(
            "(\"T\".\"Name\" > ? OR (\"T\".\"Name\" = ? AND (\"T\".\"Age\" < ?)))"
        ));
        assert_eq!(
            built.params,
            vec![
                CellValue::Text("B".into()),
                CellValue::Text("B".into()),
                CellValue::Int(20)
            ]
        );
    }

    #[test]
    fn test_cursor_errors() {
        let before = Query {
            sort: Some(vec!["id".into()]),
            cursor: Some(QueryCursor("before".into(), vec![json!(1)])),
            ..Query::table("T")
        };
        assert!(matches!(
            build_fetch_sql(&before),
            Err(EngineError::Builder(_))
        ));

        let mismatched = Query {
            sort: Some(vec!["id".into()]),
            cursor: Some(QueryCursor::after(vec![json!(1), json!(2)])),
            ..Query::table("T")
        };
        assert!(matches!(
            build_fetch_sql(&mismatched),
            Err(EngineError::Builder(_))
        ));
    }

    #[test]
    fn test_row_ids_sql() {
        let query = Query {
            row_ids: Some(vec![3, 5, 8]),
            ..Query::table("T")
        };
        let built = build_fetch_sql(&query).unwrap();
        assert!(built.sql.contains("WHERE \"T\".\"id\" IN (3, 5, 8)"));

        let empty = Query {
            row_ids: Some(vec![]),
            ..Query::table("T")
        };
        let built = build_fetch_sql(&empty).unwrap();
        assert!(built.sql.contains("WHERE 0"));
    }

    #[test]
    fn test_projection_includes_id_first() {
        let query = Query {
            columns: Some(vec!["Name".into(), "id".into(), "Age".into()]),
            ..Query::table("T")
        };
        let built = build_fetch_sql(&query).unwrap();
        assert!(built.sql.starts_with(
            "SELECT \"T\".\"id\", \"T\".\"Name\", \"T\".\"Age\" FROM"
        ));
    }

    #[test]
    fn test_include_previous_sql() {
        let query = Query {
            sort: Some(vec!["Name".into()]),
            include_previous: true,
            ..Query::table("T")
        };
        let built = build_fetch_sql(&query).unwrap();
        assert!(built.sql.contains("LEFT JOIN \"T\" AS \"_prev\""));
        assert!(built.sql.contains("AS \"_grist_Previous\""));
        // The candidate must be strictly before the outer row under the
        // same order, scanned in reverse.
        assert!(built.sql.contains(
            "(\"_cand\".\"Name\" < \"T\".\"Name\" OR (\"_cand\".\"Name\" = \"T\".\"Name\" \
             AND (\"_cand\".\"id\" < \"T\".\"id\")))"
        ));
        assert!(built.sql.contains(
            "ORDER BY \"_cand\".\"Name\" DESC NULLS FIRST, \"_cand\".\"id\" DESC NULLS FIRST LIMIT 1"
        ));
    }

    #[test]
    fn test_include_previous_filter_params_precede_where_params() {
        let query = Query {
            filters: Some(json!(["Gt", ["Name", "Age"], ["Const", 5]])),
            include_previous: true,
            ..Query::table("T")
        };
        let built = build_fetch_sql(&query).unwrap();
        // The filter is compiled twice: once inside the join subquery,
        // once in the outer WHERE.
        assert_eq!(
            built.params,
            vec![CellValue::Int(5), CellValue::Int(5)]
        );
        let join_pos = built.sql.find("LEFT JOIN").unwrap();
        let where_pos = built.sql.rfind("WHERE (\"T\".\"Age\" > ?)").unwrap();
        assert!(join_pos < where_pos);
    }
}
