//! Where-clause compilation.
//!
//! A [`FilterExpr`] compiles to a parameterized SQL fragment. Scalar
//! top-level fields compare against their typed columns directly; dotted
//! paths and structured fields go through `json_extract`, with the JSON path
//! bound as a parameter just like the literal. No caller-supplied string is
//! ever spliced into SQL text.

use bson::Bson;
use rusqlite::types::Value as SqlValue;

use docmodel_core::error::{StoreError, StoreResult};
use docmodel_core::filter::{FieldFilter, FilterExpr, FilterOp};
use docmodel_core::schema::{Definition, Schema};

use crate::value::{json_param, scalar_param};

/// Accumulates positional parameters while SQL text is built. Placeholders
/// are `?N`, numbered in bind order.
#[derive(Default)]
pub(crate) struct SqlWriter {
    params: Vec<SqlValue>,
}

impl SqlWriter {
    pub(crate) fn bind(&mut self, value: SqlValue) -> String {
        self.params.push(value);
        format!("?{}", self.params.len())
    }

    pub(crate) fn into_params(self) -> Vec<SqlValue> {
        self.params
    }
}

/// Quotes an identifier. Collection and field names come from schemas, not
/// request payloads, but quoting keeps reserved words usable.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// The JSON path expression for the segments after the column, in SQLite's
/// `$.a[0].b` syntax.
pub(crate) fn json_path(rest: &[&str]) -> String {
    let mut out = String::from("$");
    for seg in rest {
        if seg.chars().all(|c| c.is_ascii_digit()) {
            out.push_str(&format!("[{seg}]"));
        } else {
            out.push('.');
            out.push_str(seg);
        }
    }
    out
}

/// Compiles a field reference to a SQL expression: a quoted column for a
/// scalar top-level field, `json_extract` for everything deeper.
pub(crate) fn field_expr(schema: &Schema, field: &str, w: &mut SqlWriter) -> StoreResult<String> {
    if field == "_id" {
        return Ok(quote_ident("_id"));
    }

    let mut segments = field.split('.');
    let column = segments.next().unwrap_or_default();
    let rest: Vec<&str> = segments.collect();

    let def = schema
        .field(column)
        .ok_or_else(|| StoreError::bad_path(field, format!("unknown field `{column}`")))?;

    match def {
        Definition::Scalar { .. } if rest.is_empty() => Ok(quote_ident(column)),
        Definition::Scalar { .. } => Err(StoreError::bad_path(
            field,
            "path descends past a scalar leaf",
        )),
        _ => {
            let path = w.bind(SqlValue::Text(json_path(&rest)));
            Ok(format!("json_extract({}, {path})", quote_ident(column)))
        }
    }
}

fn filter_param(value: &Bson) -> StoreResult<SqlValue> {
    // Nested documents or arrays as comparison literals go through their
    // JSON text form, matching what json_extract yields for them.
    match value {
        Bson::Document(_) | Bson::Array(_) => json_param(value),
        _ => scalar_param(value),
    }
}

fn condition(schema: &Schema, cond: &FieldFilter, w: &mut SqlWriter) -> StoreResult<String> {
    let expr = field_expr(schema, &cond.field, w)?;

    Ok(match (&cond.op, &cond.value) {
        // Null means absent; SQL NULL comparison semantics need IS.
        (FilterOp::Eq, Bson::Null) => format!("{expr} IS NULL"),
        (FilterOp::Ne, Bson::Null) => format!("{expr} IS NOT NULL"),
        (FilterOp::Eq, value) => {
            let p = w.bind(filter_param(value)?);
            format!("{expr} = {p}")
        }
        // $ne matches documents that lack the field entirely.
        (FilterOp::Ne, value) => {
            let p = w.bind(filter_param(value)?);
            format!("({expr} IS NULL OR {expr} <> {p})")
        }
        (FilterOp::Gt, value) => {
            let p = w.bind(filter_param(value)?);
            format!("{expr} > {p}")
        }
        (FilterOp::Gte, value) => {
            let p = w.bind(filter_param(value)?);
            format!("{expr} >= {p}")
        }
        (FilterOp::Lt, value) => {
            let p = w.bind(filter_param(value)?);
            format!("{expr} < {p}")
        }
        (FilterOp::Lte, value) => {
            let p = w.bind(filter_param(value)?);
            format!("{expr} <= {p}")
        }
        (FilterOp::In, Bson::Array(candidates)) => {
            if candidates.is_empty() {
                "0 = 1".to_string()
            } else {
                let placeholders: StoreResult<Vec<String>> = candidates
                    .iter()
                    .map(|c| Ok(w.bind(filter_param(c)?)))
                    .collect();
                format!("{expr} IN ({})", placeholders?.join(", "))
            }
        }
        (FilterOp::In, other) => {
            return Err(StoreError::validation(&cond.field, "array for $in", other));
        }
    })
}

/// Compiles a conjunction into a `WHERE`-ready fragment. An empty filter
/// yields `None`.
pub(crate) fn compile(
    schema: &Schema,
    filter: &FilterExpr,
    w: &mut SqlWriter,
) -> StoreResult<Option<String>> {
    if filter.is_empty() {
        return Ok(None);
    }
    let parts: StoreResult<Vec<String>> = filter
        .conditions
        .iter()
        .map(|cond| condition(schema, cond, w))
        .collect();
    Ok(Some(parts?.join(" AND ")))
}
