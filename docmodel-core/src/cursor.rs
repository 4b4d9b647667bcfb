//! Lazy find cursors.
//!
//! A cursor chains pagination, ordering, and projection onto a parsed
//! filter. Nothing reaches the backend until [`Cursor::exec`] (or one of its
//! shorthands) runs, so option order does not matter.

use std::sync::Arc;

use crate::backend::{FindOptions, SortDirection, SortSpec};
use crate::document::Document;
use crate::error::StoreResult;
use crate::filter::FilterExpr;
use crate::model::Model;

#[must_use = "a cursor does nothing until executed"]
pub struct Cursor<'a> {
    model: &'a Model,
    filter: FilterExpr,
    options: FindOptions,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(model: &'a Model, filter: FilterExpr) -> Self {
        Cursor { model, filter, options: FindOptions::default() }
    }

    pub fn skip(mut self, n: u64) -> Self {
        self.options.skip = Some(n);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.options.limit = Some(n);
        self
    }

    pub fn sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.options.sort.push(SortSpec { field: field.into(), direction });
        self
    }

    pub fn sort_asc(self, field: impl Into<String>) -> Self {
        self.sort(field, SortDirection::Ascending)
    }

    pub fn sort_desc(self, field: impl Into<String>) -> Self {
        self.sort(field, SortDirection::Descending)
    }

    /// Restricts the materialized shape to the named top-level fields.
    /// Projected documents bypass the identity cache.
    pub fn project<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.projection = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Executes the find against the backend.
    pub async fn exec(self) -> StoreResult<Vec<Arc<Document>>> {
        self.model.run_find(&self.filter, &self.options).await
    }

    /// Alias for [`Cursor::exec`], reading as a collection literal.
    pub async fn to_array(self) -> StoreResult<Vec<Arc<Document>>> {
        self.exec().await
    }

    /// Executes and returns the first match, if any.
    pub async fn first(mut self) -> StoreResult<Option<Arc<Document>>> {
        self.options.limit = Some(1);
        let mut docs = self.model.run_find(&self.filter, &self.options).await?;
        Ok(docs.pop())
    }

    /// Counts matches without materializing them. Pagination options do not
    /// apply.
    pub async fn count(self) -> StoreResult<u64> {
        self.model.run_count(&self.filter).await
    }
}

impl std::fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("collection", &self.model.name())
            .field("filter", &self.filter)
            .field("options", &self.options)
            .finish()
    }
}
