//! Aggregation compilation.
//!
//! A parsed [`Pipeline`] compiles into one SELECT, clauses in the canonical
//! order: the match becomes WHERE, the group becomes GROUP BY with SQL
//! aggregate functions, a projection wraps the grouped query as a subselect,
//! then ORDER BY, LIMIT, and OFFSET. Integer sums stay integers and division
//! always casts to REAL, which keeps results bit-identical with the
//! in-memory evaluator.

use rusqlite::types::{Value as SqlValue, ValueRef};

use docmodel_core::error::{StoreError, StoreResult};
use docmodel_core::pipeline::{Accumulator, Pipeline, ValueExpr};
use docmodel_core::schema::Schema;

use crate::value::scalar_param;
use crate::where_clause::{self, field_expr, quote_ident, SqlWriter};

/// How field references in an expression resolve: against base table
/// columns, or against the output of an inner (grouped) select.
#[derive(Clone, Copy)]
enum FieldScope<'a> {
    Base(&'a Schema),
    Output,
}

fn value_expr(expr: &ValueExpr, scope: FieldScope<'_>, w: &mut SqlWriter) -> StoreResult<String> {
    Ok(match expr {
        ValueExpr::Field(field) => match scope {
            FieldScope::Base(schema) => field_expr(schema, field, w)?,
            FieldScope::Output => quote_ident(field),
        },
        ValueExpr::Constant(value) => w.bind(scalar_param(value)?),
        ValueExpr::Add(parts) => nary("+", parts, scope, w)?,
        ValueExpr::Multiply(parts) => nary("*", parts, scope, w)?,
        ValueExpr::Subtract(a, b) => {
            let a = value_expr(a, scope, w)?;
            let b = value_expr(b, scope, w)?;
            format!("({a} - {b})")
        }
        // CAST keeps division floating point, whatever the operand types.
        ValueExpr::Divide(a, b) => {
            let a = value_expr(a, scope, w)?;
            let b = value_expr(b, scope, w)?;
            format!("(CAST({a} AS REAL) / {b})")
        }
    })
}

fn nary(
    op: &str,
    parts: &[ValueExpr],
    scope: FieldScope<'_>,
    w: &mut SqlWriter,
) -> StoreResult<String> {
    let compiled: StoreResult<Vec<String>> =
        parts.iter().map(|p| value_expr(p, scope, w)).collect();
    Ok(format!("({})", compiled?.join(&format!(" {op} "))))
}

fn accumulator(acc: &Accumulator, scope: FieldScope<'_>, w: &mut SqlWriter) -> StoreResult<String> {
    Ok(match acc {
        // SUM over no numeric input is 0, not NULL.
        Accumulator::Sum(e) => format!("COALESCE(SUM({}), 0)", value_expr(e, scope, w)?),
        Accumulator::Avg(e) => format!("AVG({})", value_expr(e, scope, w)?),
        Accumulator::Min(e) => format!("MIN({})", value_expr(e, scope, w)?),
        Accumulator::Max(e) => format!("MAX({})", value_expr(e, scope, w)?),
    })
}

/// The compiled statement plus how its result rows map back to documents.
pub(crate) struct CompiledPipeline {
    pub(crate) sql: String,
    pub(crate) params: Vec<SqlValue>,
    /// True when the select returns whole base-table rows that materialize
    /// through the schema; false when it returns computed columns read raw.
    pub(crate) raw_rows: bool,
}

pub(crate) fn compile(
    schema: &Schema,
    table: &str,
    pipeline: &Pipeline,
) -> StoreResult<CompiledPipeline> {
    let mut w = SqlWriter::default();

    let where_clause = where_clause::compile(schema, &pipeline.filter, &mut w)?;
    let where_sql = where_clause
        .map(|c| format!(" WHERE {c}"))
        .unwrap_or_default();

    let mut raw_rows = false;
    let mut sql;
    let mut scope_is_output = false;

    if let Some(group) = &pipeline.group {
        let scope = FieldScope::Base(schema);
        let mut selects = Vec::with_capacity(group.accumulators.len() + 1);
        let key_sql = match &group.key {
            Some(field) => field_expr(schema, field, &mut w)?,
            None => "NULL".to_string(),
        };
        selects.push(format!("{key_sql} AS {}", quote_ident("_id")));
        for (name, acc) in &group.accumulators {
            selects.push(format!("{} AS {}", accumulator(acc, scope, &mut w)?, quote_ident(name)));
        }
        sql = format!(
            "SELECT {} FROM {}{where_sql}",
            selects.join(", "),
            quote_ident(table)
        );
        match &group.key {
            // Grouping the whole input must yield no rows for no input,
            // which plain aggregates without GROUP BY would not.
            None => sql.push_str(" HAVING COUNT(*) > 0"),
            Some(_) => sql.push_str(&format!(" GROUP BY {key_sql}")),
        }
        scope_is_output = true;
        raw_rows = true;
    } else {
        let columns: Vec<String> = std::iter::once(quote_ident("_id"))
            .chain(schema.fields().map(|(name, _)| quote_ident(name)))
            .collect();
        sql = format!(
            "SELECT {} FROM {}{where_sql}",
            columns.join(", "),
            quote_ident(table)
        );
    }

    if !pipeline.project.is_empty() {
        let scope = if scope_is_output {
            FieldScope::Output
        } else {
            FieldScope::Base(schema)
        };
        let mut selects = Vec::with_capacity(pipeline.project.len());
        for (name, expr) in &pipeline.project {
            selects.push(format!("{} AS {}", value_expr(expr, scope, &mut w)?, quote_ident(name)));
        }
        sql = format!("SELECT {} FROM ({sql})", selects.join(", "));
        raw_rows = true;
    }

    if !pipeline.sort.is_empty() {
        let mut keys = Vec::with_capacity(pipeline.sort.len());
        for spec in &pipeline.sort {
            let expr = if raw_rows {
                quote_ident(&spec.field)
            } else {
                field_expr(schema, &spec.field, &mut w)?
            };
            keys.push(format!("{expr} {}", spec.direction));
        }
        sql.push_str(&format!(" ORDER BY {}", keys.join(", ")));
    }

    match (pipeline.limit, pipeline.skip) {
        (Some(limit), Some(skip)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {skip}")),
        (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
        (None, Some(skip)) => sql.push_str(&format!(" LIMIT -1 OFFSET {skip}")),
        (None, None) => {}
    }

    Ok(CompiledPipeline { sql, params: w.into_params(), raw_rows })
}

/// Reads a computed result row without schema guidance.
pub(crate) fn raw_row_to_document(row: &rusqlite::Row<'_>) -> StoreResult<bson::Document> {
    let names: Vec<String> = row
        .as_ref()
        .column_names()
        .iter()
        .map(|s| s.to_string())
        .collect();
    let mut doc = bson::Document::new();
    for (idx, name) in names.iter().enumerate() {
        let raw = row
            .get_ref(idx)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let value = match raw {
            ValueRef::Null => bson::Bson::Null,
            ValueRef::Integer(v) => bson::Bson::Int64(v),
            ValueRef::Real(v) => bson::Bson::Double(v),
            ValueRef::Text(t) => bson::Bson::String(
                std::str::from_utf8(t)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?
                    .to_string(),
            ),
            ValueRef::Blob(_) => {
                return Err(StoreError::Serialization(
                    "unexpected blob in aggregation output".to_string(),
                ));
            }
        };
        doc.insert(name.clone(), value);
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use docmodel_core::schema::Definition;

    fn schema() -> Schema {
        Schema::builder()
            .field("region", Definition::string())
            .field("amount", Definition::int())
            .field("rate", Definition::float())
            .build()
    }

    fn compiled(stages: Vec<bson::Document>) -> CompiledPipeline {
        let schema = schema();
        let pipeline = Pipeline::parse(&schema, &stages).unwrap();
        compile(&schema, "sales", &pipeline).unwrap()
    }

    #[test]
    fn match_and_group_compile_to_where_and_group_by() {
        let out = compiled(vec![
            doc! { "$match": { "region": "eu" } },
            doc! { "$group": { "_id": "$region", "total": { "$sum": "$amount" } } },
        ]);
        assert_eq!(
            out.sql,
            r#"SELECT "region" AS "_id", COALESCE(SUM("amount"), 0) AS "total" FROM "sales" WHERE "region" = ?1 GROUP BY "region""#
        );
        assert_eq!(out.params, vec![SqlValue::Text("eu".to_string())]);
        assert!(out.raw_rows);
    }

    #[test]
    fn whole_input_group_guards_against_empty_input() {
        let out = compiled(vec![
            doc! { "$group": { "_id": null, "n": { "$sum": 1 } } },
        ]);
        assert!(out.sql.contains("HAVING COUNT(*) > 0"));
        assert!(!out.sql.contains("GROUP BY"));
    }

    #[test]
    fn division_casts_to_real() {
        let out = compiled(vec![doc! {
            "$project": { "ratio": { "$divide": ["$amount", "$rate"] } },
        }]);
        assert!(out.sql.contains(r#"(CAST("amount" AS REAL) / "rate")"#));
    }

    #[test]
    fn projection_wraps_grouped_select() {
        let out = compiled(vec![
            doc! { "$group": { "_id": "$region", "total": { "$sum": "$amount" } } },
            doc! { "$project": { "double": { "$multiply": ["$total", 2] } } },
            doc! { "$sort": { "double": -1 } },
            doc! { "$limit": 3 },
        ]);
        assert!(out.sql.starts_with(r#"SELECT ("total" * ?1) AS "double" FROM (SELECT"#));
        assert!(out.sql.ends_with(r#"ORDER BY "double" DESC LIMIT 3"#));
    }

    #[test]
    fn plain_pipeline_selects_schema_columns() {
        let out = compiled(vec![
            doc! { "$match": { "amount": { "$gte": 5 } } },
            doc! { "$sort": { "amount": 1 } },
            doc! { "$skip": 2 },
        ]);
        assert_eq!(
            out.sql,
            r#"SELECT "_id", "amount", "rate", "region" FROM "sales" WHERE "amount" >= ?1 ORDER BY "amount" ASC LIMIT -1 OFFSET 2"#
        );
        assert!(!out.raw_rows);
    }
}
