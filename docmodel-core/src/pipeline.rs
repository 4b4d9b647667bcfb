//! Aggregation pipelines.
//!
//! A pipeline document is parsed once into a [`Pipeline`], which holds one
//! slot per supported clause. Both backends evaluate the slots in the same
//! canonical order: match, group, project, sort, skip, limit. A stage
//! outside the supported set is rejected at parse time, before any I/O.

use bson::Bson;

use crate::backend::{SortDirection, SortSpec};
use crate::error::{StoreError, StoreResult};
use crate::filter::FilterExpr;
use crate::path;
use crate::schema::Schema;

/// An arithmetic value expression evaluated per input document.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueExpr {
    /// A `$field` reference, possibly dotted.
    Field(String),
    Constant(Bson),
    Add(Vec<ValueExpr>),
    Subtract(Box<ValueExpr>, Box<ValueExpr>),
    Multiply(Vec<ValueExpr>),
    Divide(Box<ValueExpr>, Box<ValueExpr>),
}

impl ValueExpr {
    fn parse(raw: &Bson) -> StoreResult<Self> {
        match raw {
            Bson::String(s) => match s.strip_prefix('$') {
                Some(field) => Ok(ValueExpr::Field(field.to_string())),
                None => Ok(ValueExpr::Constant(raw.clone())),
            },
            Bson::Document(doc) => {
                let (name, args) = doc
                    .iter()
                    .next()
                    .ok_or_else(|| StoreError::validation("$project", "operator expression", raw))?;
                if doc.len() != 1 {
                    return Err(StoreError::validation(
                        name,
                        "single-operator expression",
                        raw,
                    ));
                }
                match name.as_str() {
                    "$add" => Ok(ValueExpr::Add(Self::parse_list(name, args)?)),
                    "$multiply" => Ok(ValueExpr::Multiply(Self::parse_list(name, args)?)),
                    "$subtract" => {
                        let (a, b) = Self::parse_pair(name, args)?;
                        Ok(ValueExpr::Subtract(Box::new(a), Box::new(b)))
                    }
                    "$divide" => {
                        let (a, b) = Self::parse_pair(name, args)?;
                        Ok(ValueExpr::Divide(Box::new(a), Box::new(b)))
                    }
                    other => Err(StoreError::UnsupportedOperator(other.to_string())),
                }
            }
            other => Ok(ValueExpr::Constant(other.clone())),
        }
    }

    fn parse_list(name: &str, args: &Bson) -> StoreResult<Vec<ValueExpr>> {
        match args {
            Bson::Array(items) if items.len() >= 2 => {
                items.iter().map(Self::parse).collect()
            }
            other => Err(StoreError::validation(name, "array of two or more operands", other)),
        }
    }

    fn parse_pair(name: &str, args: &Bson) -> StoreResult<(ValueExpr, ValueExpr)> {
        match args {
            Bson::Array(items) if items.len() == 2 => {
                Ok((Self::parse(&items[0])?, Self::parse(&items[1])?))
            }
            other => Err(StoreError::validation(name, "array of exactly two operands", other)),
        }
    }
}

/// A group accumulator over a value expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Sum(ValueExpr),
    Avg(ValueExpr),
    Min(ValueExpr),
    Max(ValueExpr),
}

impl Accumulator {
    fn parse(raw: &Bson) -> StoreResult<Self> {
        let doc = raw.as_document().ok_or_else(|| {
            StoreError::validation("$group", "accumulator document", raw)
        })?;
        let (name, args) = doc
            .iter()
            .next()
            .ok_or_else(|| StoreError::validation("$group", "single accumulator", raw))?;
        if doc.len() != 1 {
            return Err(StoreError::validation(name, "single accumulator", raw));
        }
        let expr = ValueExpr::parse(args)?;
        match name.as_str() {
            "$sum" => Ok(Accumulator::Sum(expr)),
            "$avg" => Ok(Accumulator::Avg(expr)),
            "$min" => Ok(Accumulator::Min(expr)),
            "$max" => Ok(Accumulator::Max(expr)),
            other => Err(StoreError::UnsupportedOperator(other.to_string())),
        }
    }
}

/// A `$group` clause: an optional key field and named accumulators.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupClause {
    /// `None` groups the whole input into one bucket.
    pub key: Option<String>,
    pub accumulators: Vec<(String, Accumulator)>,
}

/// A parsed pipeline with one slot per supported clause. Evaluation order is
/// fixed regardless of the order stages were written in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    pub filter: FilterExpr,
    pub group: Option<GroupClause>,
    pub project: Vec<(String, ValueExpr)>,
    pub sort: Vec<SortSpec>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
}

impl Pipeline {
    /// Parses a stage list. `$match` conditions across stages accumulate
    /// into one conjunction; later `$skip`/`$limit` stages replace earlier
    /// ones.
    pub fn parse(schema: &Schema, stages: &[bson::Document]) -> StoreResult<Self> {
        let mut pipeline = Pipeline::default();

        for stage in stages {
            let (name, body) = stage.iter().next().ok_or_else(|| {
                StoreError::UnsupportedStage("empty stage document".to_string())
            })?;
            if stage.len() != 1 {
                return Err(StoreError::UnsupportedStage(format!(
                    "stage with {} operators",
                    stage.len()
                )));
            }

            match name.as_str() {
                "$match" => {
                    let body = body.as_document().ok_or_else(|| {
                        StoreError::validation("$match", "filter document", body)
                    })?;
                    let expr = FilterExpr::parse(schema, body)?;
                    pipeline.filter.conditions.extend(expr.conditions);
                }
                "$group" => {
                    pipeline.group = Some(Self::parse_group(body)?);
                }
                "$project" => {
                    let body = body.as_document().ok_or_else(|| {
                        StoreError::validation("$project", "projection document", body)
                    })?;
                    for (field, spec) in body.iter() {
                        match spec {
                            // Exclusions are just omitted from the output.
                            Bson::Int32(0) | Bson::Int64(0) | Bson::Boolean(false) => {}
                            Bson::Int32(_) | Bson::Int64(_) | Bson::Boolean(true) => {
                                pipeline
                                    .project
                                    .push((field.clone(), ValueExpr::Field(field.clone())));
                            }
                            expr => {
                                pipeline.project.push((field.clone(), ValueExpr::parse(expr)?));
                            }
                        }
                    }
                }
                "$sort" => {
                    let body = body.as_document().ok_or_else(|| {
                        StoreError::validation("$sort", "sort document", body)
                    })?;
                    for (field, dir) in body.iter() {
                        let direction = match dir {
                            Bson::Int32(1) | Bson::Int64(1) => SortDirection::Ascending,
                            Bson::Int32(-1) | Bson::Int64(-1) => SortDirection::Descending,
                            other => {
                                return Err(StoreError::validation(field, "1 or -1", other));
                            }
                        };
                        pipeline.sort.push(SortSpec { field: field.clone(), direction });
                    }
                }
                "$skip" => pipeline.skip = Some(parse_count("$skip", body)?),
                "$limit" => pipeline.limit = Some(parse_count("$limit", body)?),
                other => return Err(StoreError::UnsupportedStage(other.to_string())),
            }
        }

        // Match fields must resolve; group keys and accumulator inputs read
        // pre-group fields, so they resolve too. Projected names may refer
        // to group outputs and are left unchecked.
        if let Some(group) = &pipeline.group {
            if let Some(key) = &group.key {
                schema.resolve(&path::parse(key)?)?;
            }
        }

        Ok(pipeline)
    }

    fn parse_group(body: &Bson) -> StoreResult<GroupClause> {
        let body = body
            .as_document()
            .ok_or_else(|| StoreError::validation("$group", "group document", body))?;

        let key = match body.get("_id") {
            None => {
                return Err(StoreError::validation("$group", "an _id key", &Bson::Null));
            }
            Some(Bson::Null) => None,
            Some(Bson::String(s)) => match s.strip_prefix('$') {
                Some(field) => Some(field.to_string()),
                None => {
                    return Err(StoreError::validation(
                        "$group._id",
                        "null or a $field reference",
                        &Bson::String(s.clone()),
                    ));
                }
            },
            Some(other) => {
                return Err(StoreError::validation(
                    "$group._id",
                    "null or a $field reference",
                    other,
                ));
            }
        };

        let mut accumulators = Vec::new();
        for (name, spec) in body.iter() {
            if name == "_id" {
                continue;
            }
            accumulators.push((name.clone(), Accumulator::parse(spec)?));
        }

        Ok(GroupClause { key, accumulators })
    }
}

fn parse_count(stage: &str, body: &Bson) -> StoreResult<u64> {
    match body {
        Bson::Int32(v) if *v >= 0 => Ok(*v as u64),
        Bson::Int64(v) if *v >= 0 => Ok(*v as u64),
        other => Err(StoreError::validation(stage, "non-negative integer", other)),
    }
}
