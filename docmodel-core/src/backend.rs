//! The storage backend contract.
//!
//! A backend receives parsed filters, pipelines, and operation batches plus
//! the collection schema, never raw query documents. Everything above this
//! trait is backend-agnostic; swapping the store out from under a model is a
//! constructor argument, not a code change.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bson::Bson;

use crate::error::StoreResult;
use crate::filter::FilterExpr;
use crate::ops::AtomicOp;
use crate::pipeline::Pipeline;
use crate::schema::Schema;

/// Sort direction for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDirection::Ascending => f.write_str("ASC"),
            SortDirection::Descending => f.write_str("DESC"),
        }
    }
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub field: String,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn asc(field: impl Into<String>) -> Self {
        SortSpec { field: field.into(), direction: SortDirection::Ascending }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        SortSpec { field: field.into(), direction: SortDirection::Descending }
    }
}

/// Pagination, ordering, and projection options for a find.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub sort: Vec<SortSpec>,
    /// Top-level fields to materialize; empty means the whole declared shape.
    pub projection: Vec<String>,
}

/// The contract every storage backend implements. Documents cross this
/// boundary as materialized value trees keyed by `_id`; the layers above own
/// validation, caching, and the operation queue.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Declares a collection and its schema. For relational stores this is
    /// where tables come from; document stores may treat it as a no-op.
    async fn register(&self, collection: &str, schema: &Schema) -> StoreResult<()>;

    async fn find(
        &self,
        collection: &str,
        schema: &Schema,
        filter: &FilterExpr,
        options: &FindOptions,
    ) -> StoreResult<Vec<bson::Document>>;

    async fn count(
        &self,
        collection: &str,
        schema: &Schema,
        filter: &FilterExpr,
    ) -> StoreResult<u64>;

    async fn aggregate(
        &self,
        collection: &str,
        schema: &Schema,
        pipeline: &Pipeline,
    ) -> StoreResult<Vec<bson::Document>>;

    /// Inserts a whole document. The `_id` field is already present.
    async fn insert(
        &self,
        collection: &str,
        schema: &Schema,
        document: &bson::Document,
    ) -> StoreResult<()>;

    /// Applies an operation batch to every matching document, returning how
    /// many were touched.
    async fn update(
        &self,
        collection: &str,
        schema: &Schema,
        filter: &FilterExpr,
        ops: &[AtomicOp],
    ) -> StoreResult<u64>;

    /// Deletes matching documents, returning how many were removed.
    async fn delete(
        &self,
        collection: &str,
        schema: &Schema,
        filter: &FilterExpr,
    ) -> StoreResult<u64>;
}

/// Shared handle to a backend, the form models hold it in.
pub type DynBackend = Arc<dyn StorageBackend>;

/// Compares two documents under a sort specification, missing fields first.
/// Backends that sort in memory share this so ordering matches everywhere.
pub fn compare_documents(a: &bson::Document, b: &bson::Document, sort: &[SortSpec]) -> std::cmp::Ordering {
    use crate::value::Comparable;
    use std::cmp::Ordering;

    for key in sort {
        let left = extract_field(a, &key.field).map(Comparable::from);
        let right = extract_field(b, &key.field).map(Comparable::from);
        let ord = match (left, right) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(l), Some(r)) => l.partial_cmp(&r).unwrap_or(Ordering::Equal),
        };
        let ord = match key.direction {
            SortDirection::Ascending => ord,
            SortDirection::Descending => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    std::cmp::Ordering::Equal
}

/// Applies a top-level projection, always keeping `_id`.
pub fn project_document(doc: &bson::Document, projection: &[String]) -> bson::Document {
    if projection.is_empty() {
        return doc.clone();
    }
    let mut out = bson::Document::new();
    if let Some(id) = doc.get("_id") {
        out.insert("_id", id.clone());
    }
    for field in projection {
        if let Some(value) = doc.get(field) {
            out.insert(field.clone(), value.clone());
        }
    }
    out
}

/// Extracts a possibly dotted field from a materialized document, used by
/// in-memory filtering and aggregation.
pub fn extract_field<'a>(doc: &'a bson::Document, field: &str) -> Option<&'a Bson> {
    let mut parts = field.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Bson::Document(inner) => inner.get(part)?,
            Bson::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
