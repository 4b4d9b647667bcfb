//! Convenient re-exports of commonly used types from docmodel.
//!
//! Import this prelude module to quickly access the most frequently used
//! types without needing to import from multiple sub-modules:
//!
//! ```ignore
//! use docmodel::prelude::*;
//! ```

pub use docmodel_core::{
    backend::{DynBackend, FindOptions, SortDirection, SortSpec, StorageBackend},
    cursor::Cursor,
    document::Document,
    error::{StoreError, StoreResult},
    filter::{FieldFilter, FilterExpr, FilterOp},
    model::Model,
    ops::{AtomicOp, OpKind},
    pipeline::{Accumulator, GroupClause, Pipeline, ValueExpr},
    query::Query,
    schema::{ColumnKind, Definition, ScalarType, Schema, SchemaBuilder},
};
