//! Update compilation.
//!
//! An operation batch compiles into one `UPDATE` statement. Operations are
//! grouped by the column their path roots in; within a column, each
//! operation wraps the expression built so far, so a mixed batch like
//! set-then-inc-then-push replays in submission order inside a single
//! assignment. Scalar columns assign directly; structured columns rewrite
//! their JSON text through `json_set`, `json_remove`, `json_insert` with an
//! `$[#]` append path, and `json_group_array` for pulls.

use std::collections::HashMap;

use bson::Bson;
use rusqlite::types::Value as SqlValue;

use docmodel_core::error::{StoreError, StoreResult};
use docmodel_core::ops::{AtomicOp, OpKind};
use docmodel_core::schema::{Definition, Schema};

use crate::value::{json_param, scalar_param};
use crate::where_clause::{json_path, quote_ident, SqlWriter};

fn split_path(path: &str) -> (&str, Vec<&str>) {
    let mut segments = path.split('.');
    let column = segments.next().unwrap_or_default();
    (column, segments.collect())
}

fn pull_param(value: &Bson) -> StoreResult<(String, SqlValue)> {
    // Scalars compare as SQL values; structured values compare through
    // json() canonicalization.
    match value {
        Bson::Document(_) | Bson::Array(_) => Ok(("json(j.value) IS NOT json({p})".to_string(), json_param(value)?)),
        other => Ok(("j.value IS NOT {p}".to_string(), scalar_param(other)?)),
    }
}

fn scalar_assignment(expr: String, op: &AtomicOp, w: &mut SqlWriter) -> StoreResult<String> {
    Ok(match op.kind {
        OpKind::Set => w.bind(scalar_param(&op.value)?),
        OpKind::Unset => "NULL".to_string(),
        OpKind::Inc => {
            let p = w.bind(scalar_param(&op.value)?);
            format!("COALESCE({expr}, 0) + {p}")
        }
        OpKind::Push | OpKind::Pull => {
            return Err(StoreError::bad_path(
                &op.path,
                format!("{} does not apply to a scalar column", op.kind.name()),
            ));
        }
    })
}

fn json_assignment(
    expr: String,
    rest: &[&str],
    op: &AtomicOp,
    w: &mut SqlWriter,
) -> StoreResult<String> {
    // Whole-column operations skip the json_* path machinery.
    if rest.is_empty() {
        return Ok(match op.kind {
            OpKind::Set => {
                let p = w.bind(json_param(&op.value)?);
                format!("json({p})")
            }
            OpKind::Unset => "NULL".to_string(),
            OpKind::Push => {
                let p = w.bind(json_param(&op.value)?);
                format!("json_insert({expr}, '$[#]', json({p}))")
            }
            OpKind::Pull => {
                let (cmp, param) = pull_param(&op.value)?;
                let p = w.bind(param);
                let cmp = cmp.replace("{p}", &p);
                format!(
                    "json((SELECT json_group_array(j.value) FROM json_each({expr}) AS j WHERE {cmp}))"
                )
            }
            OpKind::Inc => {
                return Err(StoreError::bad_path(&op.path, "cannot increment a container"));
            }
        });
    }

    let path = w.bind(SqlValue::Text(json_path(rest)));
    Ok(match op.kind {
        OpKind::Set => {
            let p = w.bind(json_param(&op.value)?);
            format!("json_set({expr}, {path}, json({p}))")
        }
        OpKind::Unset => format!("json_remove({expr}, {path})"),
        OpKind::Inc => {
            let p = w.bind(scalar_param(&op.value)?);
            format!(
                "json_set({expr}, {path}, COALESCE(json_extract({expr}, {path}), 0) + {p})"
            )
        }
        OpKind::Push => {
            // Materialize the array before appending; json_insert into a
            // missing path is a silent no-op.
            let append = w.bind(SqlValue::Text(format!("{}[#]", json_path(rest))));
            let p = w.bind(json_param(&op.value)?);
            format!(
                "json_insert(json_set({expr}, {path}, json(COALESCE(json_extract({expr}, {path}), '[]'))), {append}, json({p}))"
            )
        }
        OpKind::Pull => {
            let (cmp, param) = pull_param(&op.value)?;
            let p = w.bind(param);
            let cmp = cmp.replace("{p}", &p);
            format!(
                "CASE WHEN json_extract({expr}, {path}) IS NULL THEN {expr} \
                 ELSE json_set({expr}, {path}, json((SELECT json_group_array(j.value) \
                 FROM json_each(json_extract({expr}, {path})) AS j WHERE {cmp}))) END"
            )
        }
    })
}

/// Compiles an operation batch into `SET` assignments, one per touched
/// column, preserving submission order within each column.
pub(crate) fn compile(
    schema: &Schema,
    batch: &[AtomicOp],
    w: &mut SqlWriter,
) -> StoreResult<Vec<(String, String)>> {
    // Column name -> (order of first touch, running expression).
    let mut columns: HashMap<String, (usize, String)> = HashMap::new();
    let mut order = 0usize;

    for op in batch {
        let (column, rest) = split_path(&op.path);
        let def = schema
            .field(column)
            .ok_or_else(|| StoreError::bad_path(&op.path, format!("unknown field `{column}`")))?;
        let scalar = matches!(def, Definition::Scalar { .. });
        if scalar && !rest.is_empty() {
            return Err(StoreError::bad_path(&op.path, "path descends past a scalar leaf"));
        }

        let entry = columns.entry(column.to_string()).or_insert_with(|| {
            let initial = if scalar {
                quote_ident(column)
            } else {
                let empty = match def {
                    Definition::Array { .. } => "'[]'",
                    _ => "'{}'",
                };
                format!("json(COALESCE({}, {empty}))", quote_ident(column))
            };
            order += 1;
            (order, initial)
        });

        entry.1 = if scalar {
            scalar_assignment(entry.1.clone(), op, w)?
        } else {
            json_assignment(entry.1.clone(), &rest, op, w)?
        };
    }

    let mut assignments: Vec<(usize, String, String)> = columns
        .into_iter()
        .map(|(column, (ord, expr))| (ord, column, expr))
        .collect();
    assignments.sort_by_key(|(ord, _, _)| *ord);
    Ok(assignments
        .into_iter()
        .map(|(_, column, expr)| (quote_ident(&column), expr))
        .collect())
}
