//! Filter evaluation over materialized documents.
//!
//! The document-store backend filters by scanning and evaluating each
//! condition against the value tree. Semantics follow the usual document
//! database conventions: a missing field equals null, so `$ne` matches
//! documents that lack the field entirely.

use bson::Bson;
use docmodel_core::backend::extract_field;
use docmodel_core::filter::{FieldFilter, FilterExpr, FilterOp};
use docmodel_core::value::{values_equal, Comparable};

/// True when every condition of the conjunction holds for `doc`.
pub(crate) fn matches(doc: &bson::Document, filter: &FilterExpr) -> bool {
    filter.conditions.iter().all(|cond| condition_holds(doc, cond))
}

fn condition_holds(doc: &bson::Document, cond: &FieldFilter) -> bool {
    let value = extract_field(doc, &cond.field);

    match cond.op {
        FilterOp::Eq => loose_eq(value, &cond.value),
        FilterOp::Ne => !loose_eq(value, &cond.value),
        FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => {
            let Some(value) = value else { return false };
            let Some(ord) = Comparable::from(value).partial_cmp(&Comparable::from(&cond.value))
            else {
                return false;
            };
            match cond.op {
                FilterOp::Gt => ord.is_gt(),
                FilterOp::Gte => ord.is_ge(),
                FilterOp::Lt => ord.is_lt(),
                FilterOp::Lte => ord.is_le(),
                _ => unreachable!(),
            }
        }
        FilterOp::In => match (&cond.value, value) {
            (Bson::Array(candidates), Some(value)) => {
                candidates.iter().any(|c| values_equal(c, value))
            }
            _ => false,
        },
    }
}

fn loose_eq(value: Option<&Bson>, expected: &Bson) -> bool {
    match value {
        Some(value) => values_equal(value, expected),
        // Absent fields compare equal to null.
        None => matches!(expected, Bson::Null),
    }
}
