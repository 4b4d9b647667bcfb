//! Query filters.
//!
//! A filter document is parsed exactly once at the API boundary into a
//! [`FilterExpr`], a flat conjunction of per-field conditions. Backends never
//! see raw filter documents; an unsupported operator fails here, before any
//! I/O happens, with the same error from every backend.

use std::fmt;

use bson::Bson;

use crate::error::{StoreError, StoreResult};
use crate::path;
use crate::schema::Schema;

/// Comparison operators supported on a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

impl FilterOp {
    fn parse(name: &str) -> StoreResult<Self> {
        match name {
            "$eq" => Ok(FilterOp::Eq),
            "$ne" => Ok(FilterOp::Ne),
            "$gt" => Ok(FilterOp::Gt),
            "$gte" => Ok(FilterOp::Gte),
            "$lt" => Ok(FilterOp::Lt),
            "$lte" => Ok(FilterOp::Lte),
            "$in" => Ok(FilterOp::In),
            other => Err(StoreError::UnsupportedOperator(other.to_string())),
        }
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterOp::Eq => "$eq",
            FilterOp::Ne => "$ne",
            FilterOp::Gt => "$gt",
            FilterOp::Gte => "$gte",
            FilterOp::Lt => "$lt",
            FilterOp::Lte => "$lte",
            FilterOp::In => "$in",
        };
        f.write_str(name)
    }
}

/// One field condition.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: Bson,
}

/// A conjunction of field conditions. An empty expression matches every
/// document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterExpr {
    pub conditions: Vec<FieldFilter>,
}

impl FilterExpr {
    pub fn all() -> Self {
        FilterExpr::default()
    }

    /// The identity filter, `{ "_id": id }`.
    pub fn by_id(id: impl Into<String>) -> Self {
        FilterExpr {
            conditions: vec![FieldFilter {
                field: "_id".to_string(),
                op: FilterOp::Eq,
                value: Bson::String(id.into()),
            }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// `Some(id)` when this filter is exactly an equality on `_id`, which
    /// lets callers route through the identity cache.
    pub fn as_id_eq(&self) -> Option<&str> {
        match self.conditions.as_slice() {
            [FieldFilter { field, op: FilterOp::Eq, value: Bson::String(id) }]
                if field == "_id" =>
            {
                Some(id)
            }
            _ => None,
        }
    }

    /// Parses a filter document. A bare value means equality; a nested
    /// document holds explicit `$`-operators. Fields other than `_id` must
    /// resolve against the schema.
    pub fn parse(schema: &Schema, filter: &bson::Document) -> StoreResult<Self> {
        let mut conditions = Vec::new();

        for (field, spec) in filter.iter() {
            if field.starts_with('$') {
                return Err(StoreError::UnsupportedOperator(field.clone()));
            }
            if field != "_id" {
                let steps = path::parse(field)?;
                schema.resolve(&steps)?;
            }

            match spec {
                Bson::Document(operators)
                    if operators.keys().any(|k| k.starts_with('$')) =>
                {
                    for (name, value) in operators.iter() {
                        let op = FilterOp::parse(name)?;
                        if op == FilterOp::In && !matches!(value, Bson::Array(_)) {
                            return Err(StoreError::validation(field, "array for $in", value));
                        }
                        conditions.push(FieldFilter {
                            field: field.clone(),
                            op,
                            value: value.clone(),
                        });
                    }
                }
                other => conditions.push(FieldFilter {
                    field: field.clone(),
                    op: FilterOp::Eq,
                    value: other.clone(),
                }),
            }
        }

        Ok(FilterExpr { conditions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Definition;
    use bson::{bson, doc};

    fn schema() -> Schema {
        Schema::builder()
            .field("name", Definition::string())
            .field("level", Definition::int())
            .field(
                "profile",
                Definition::object([("age", Definition::int())]),
            )
            .build()
    }

    #[test]
    fn bare_value_is_equality() {
        let expr = FilterExpr::parse(&schema(), &doc! { "name": "alpha" }).unwrap();
        assert_eq!(
            expr.conditions,
            vec![FieldFilter { field: "name".into(), op: FilterOp::Eq, value: bson!("alpha") }]
        );
    }

    #[test]
    fn operator_documents_expand_to_conditions() {
        let expr =
            FilterExpr::parse(&schema(), &doc! { "level": { "$gte": 3, "$lt": 10 } }).unwrap();
        assert_eq!(expr.conditions.len(), 2);
        assert_eq!(expr.conditions[0].op, FilterOp::Gte);
        assert_eq!(expr.conditions[1].op, FilterOp::Lt);
    }

    #[test]
    fn unknown_operator_fails_before_io() {
        let err = FilterExpr::parse(&schema(), &doc! { "name": { "$regex": "^a" } }).unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedOperator(op) if op == "$regex"));
        let err = FilterExpr::parse(&schema(), &doc! { "$or": [] }).unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedOperator(op) if op == "$or"));
    }

    #[test]
    fn dotted_fields_resolve_against_schema() {
        assert!(FilterExpr::parse(&schema(), &doc! { "profile.age": { "$gt": 18 } }).is_ok());
        assert!(FilterExpr::parse(&schema(), &doc! { "profile.nope": 1 }).is_err());
    }

    #[test]
    fn id_equality_is_detected() {
        let expr = FilterExpr::by_id("abc");
        assert_eq!(expr.as_id_eq(), Some("abc"));
        let expr = FilterExpr::parse(&schema(), &doc! { "name": "x" }).unwrap();
        assert_eq!(expr.as_id_eq(), None);
    }
}
