//! In-memory pipeline execution.
//!
//! Clauses run in the same canonical order the relational backend compiles
//! them in: match, group, project, sort, skip, limit. Accumulator arithmetic
//! goes through [`Number`] so integer sums stay integral and results agree
//! with SQL aggregates to the bit.

use bson::Bson;
use docmodel_core::backend::{compare_documents, extract_field};
use docmodel_core::error::StoreResult;
use docmodel_core::pipeline::{Accumulator, GroupClause, Pipeline, ValueExpr};
use docmodel_core::value::{values_equal, Comparable, Number};

use crate::evaluator;

pub(crate) fn run(pipeline: &Pipeline, rows: Vec<bson::Document>) -> StoreResult<Vec<bson::Document>> {
    let mut rows: Vec<bson::Document> = rows
        .into_iter()
        .filter(|row| evaluator::matches(row, &pipeline.filter))
        .collect();

    if let Some(group) = &pipeline.group {
        rows = run_group(group, &rows);
    }

    if !pipeline.project.is_empty() {
        rows = rows
            .iter()
            .map(|row| {
                let mut out = bson::Document::new();
                for (name, expr) in &pipeline.project {
                    out.insert(name.clone(), eval(row, expr).unwrap_or(Bson::Null));
                }
                out
            })
            .collect();
    }

    if !pipeline.sort.is_empty() {
        rows.sort_by(|a, b| compare_documents(a, b, &pipeline.sort));
    }

    if let Some(skip) = pipeline.skip {
        let skip = (skip as usize).min(rows.len());
        rows.drain(..skip);
    }
    if let Some(limit) = pipeline.limit {
        rows.truncate(limit as usize);
    }

    Ok(rows)
}

/// Evaluates a value expression against one row. `None` stands for a missing
/// field or an operand outside the numeric domain, and surfaces as null.
pub(crate) fn eval(row: &bson::Document, expr: &ValueExpr) -> Option<Bson> {
    match expr {
        ValueExpr::Field(field) => extract_field(row, field).cloned(),
        ValueExpr::Constant(value) => Some(value.clone()),
        ValueExpr::Add(parts) => fold(row, parts, Number::add),
        ValueExpr::Multiply(parts) => fold(row, parts, Number::mul),
        ValueExpr::Subtract(a, b) => {
            let (a, b) = binary(row, a, b)?;
            Some(a.sub(b).to_bson())
        }
        ValueExpr::Divide(a, b) => {
            let (a, b) = binary(row, a, b)?;
            // Division by zero yields null, like its SQL counterpart.
            if b.as_f64() == 0.0 {
                return None;
            }
            Some(a.div(b).to_bson())
        }
    }
}

fn number(row: &bson::Document, expr: &ValueExpr) -> Option<Number> {
    Number::from_bson(&eval(row, expr)?)
}

fn fold(
    row: &bson::Document,
    parts: &[ValueExpr],
    op: impl Fn(Number, Number) -> Number,
) -> Option<Bson> {
    let mut parts = parts.iter();
    let mut acc = number(row, parts.next()?)?;
    for part in parts {
        acc = op(acc, number(row, part)?);
    }
    Some(acc.to_bson())
}

fn binary(row: &bson::Document, a: &ValueExpr, b: &ValueExpr) -> Option<(Number, Number)> {
    Some((number(row, a)?, number(row, b)?))
}

enum AccState {
    Sum(Number),
    Avg { total: Number, count: u64 },
    Min(Option<Bson>),
    Max(Option<Bson>),
}

impl AccState {
    fn new(acc: &Accumulator) -> Self {
        match acc {
            Accumulator::Sum(_) => AccState::Sum(Number::Int(0)),
            Accumulator::Avg(_) => AccState::Avg { total: Number::Int(0), count: 0 },
            Accumulator::Min(_) => AccState::Min(None),
            Accumulator::Max(_) => AccState::Max(None),
        }
    }

    fn expr<'a>(acc: &'a Accumulator) -> &'a ValueExpr {
        match acc {
            Accumulator::Sum(e) | Accumulator::Avg(e) | Accumulator::Min(e) | Accumulator::Max(e) => e,
        }
    }

    fn feed(&mut self, value: Option<Bson>) {
        match self {
            // Non-numeric inputs are skipped, they do not poison the sum.
            AccState::Sum(total) => {
                if let Some(n) = value.as_ref().and_then(Number::from_bson) {
                    *total = total.add(n);
                }
            }
            AccState::Avg { total, count } => {
                if let Some(n) = value.as_ref().and_then(Number::from_bson) {
                    *total = total.add(n);
                    *count += 1;
                }
            }
            AccState::Min(best) => {
                if let Some(value) = value {
                    let replace = match best {
                        None => true,
                        Some(current) => Comparable::from(&value)
                            .partial_cmp(&Comparable::from(&*current))
                            .is_some_and(|o| o.is_lt()),
                    };
                    if replace {
                        *best = Some(value);
                    }
                }
            }
            AccState::Max(best) => {
                if let Some(value) = value {
                    let replace = match best {
                        None => true,
                        Some(current) => Comparable::from(&value)
                            .partial_cmp(&Comparable::from(&*current))
                            .is_some_and(|o| o.is_gt()),
                    };
                    if replace {
                        *best = Some(value);
                    }
                }
            }
        }
    }

    fn finish(self) -> Bson {
        match self {
            AccState::Sum(total) => total.to_bson(),
            // Averages are always floating point, matching SQL AVG.
            AccState::Avg { count: 0, .. } => Bson::Null,
            AccState::Avg { total, count } => Bson::Double(total.as_f64() / count as f64),
            AccState::Min(best) | AccState::Max(best) => best.unwrap_or(Bson::Null),
        }
    }
}

fn run_group(group: &GroupClause, rows: &[bson::Document]) -> Vec<bson::Document> {
    // Buckets keep first-seen order; keys compare width-insensitively.
    let mut buckets: Vec<(Bson, Vec<AccState>)> = Vec::new();

    for row in rows {
        let key = match &group.key {
            Some(field) => extract_field(row, field).cloned().unwrap_or(Bson::Null),
            None => Bson::Null,
        };
        let slot = match buckets.iter().position(|(k, _)| values_equal(k, &key)) {
            Some(slot) => slot,
            None => {
                let states = group.accumulators.iter().map(|(_, acc)| AccState::new(acc)).collect();
                buckets.push((key, states));
                buckets.len() - 1
            }
        };
        for ((_, acc), state) in group.accumulators.iter().zip(buckets[slot].1.iter_mut()) {
            state.feed(eval(row, AccState::expr(acc)));
        }
    }

    buckets
        .into_iter()
        .map(|(key, states)| {
            let mut out = bson::Document::new();
            out.insert("_id", key);
            for ((name, _), state) in group.accumulators.iter().zip(states) {
                out.insert(name.clone(), state.finish());
            }
            out
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use docmodel_core::pipeline::Pipeline;
    use docmodel_core::schema::{Definition, Schema};

    fn schema() -> Schema {
        Schema::builder()
            .field("region", Definition::string())
            .field("amount", Definition::int())
            .field("rate", Definition::float())
            .build()
    }

    fn rows() -> Vec<bson::Document> {
        vec![
            doc! { "_id": "1", "region": "eu", "amount": 10_i64, "rate": 0.5 },
            doc! { "_id": "2", "region": "eu", "amount": 5_i64, "rate": 1.5 },
            doc! { "_id": "3", "region": "us", "amount": 7_i64, "rate": 1.0 },
        ]
    }

    #[test]
    fn grouped_sums_stay_integral() {
        let pipeline = Pipeline::parse(
            &schema(),
            &[
                doc! { "$group": { "_id": "$region", "total": { "$sum": "$amount" } } },
                doc! { "$sort": { "_id": 1 } },
            ],
        )
        .unwrap();
        let out = run(&pipeline, rows()).unwrap();
        assert_eq!(
            out,
            vec![
                doc! { "_id": "eu", "total": 15_i64 },
                doc! { "_id": "us", "total": 7_i64 },
            ]
        );
    }

    #[test]
    fn match_runs_before_group() {
        let pipeline = Pipeline::parse(
            &schema(),
            &[
                doc! { "$group": { "_id": null, "total": { "$sum": "$amount" } } },
                doc! { "$match": { "region": "eu" } },
            ],
        )
        .unwrap();
        let out = run(&pipeline, rows()).unwrap();
        assert_eq!(out, vec![doc! { "_id": Bson::Null, "total": 15_i64 }]);
    }

    #[test]
    fn avg_is_always_float() {
        let pipeline = Pipeline::parse(
            &schema(),
            &[doc! { "$group": { "_id": null, "mean": { "$avg": "$amount" } } }],
        )
        .unwrap();
        let out = run(&pipeline, rows()).unwrap();
        assert_eq!(out[0].get("mean").unwrap(), &Bson::Double(22.0 / 3.0));
    }

    #[test]
    fn projection_computes_expressions() {
        let pipeline = Pipeline::parse(
            &schema(),
            &[
                doc! { "$project": { "value": { "$multiply": ["$amount", "$rate"] } } },
                doc! { "$sort": { "value": -1 } },
                doc! { "$limit": 2 },
            ],
        )
        .unwrap();
        let out = run(&pipeline, rows()).unwrap();
        assert_eq!(
            out,
            vec![
                doc! { "value": 7.5 },
                doc! { "value": 7.0 },
            ]
        );
    }

    #[test]
    fn division_by_zero_is_null() {
        let row = doc! { "amount": 4_i64 };
        let expr = ValueExpr::Divide(
            Box::new(ValueExpr::Field("amount".into())),
            Box::new(ValueExpr::Constant(Bson::Int64(0))),
        );
        assert_eq!(eval(&row, &expr), None);
    }
}
