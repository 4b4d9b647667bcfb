//! Path selections over a live document.
//!
//! A [`Query`] is a resolved selection inside one document: it narrows with
//! `prop`, `id`, and `index`, reads with `get`/`val`, and mutates with the
//! atomic operations. Every mutation applies to the snapshot immediately and
//! queues for the next save.

use std::sync::Arc;

use bson::Bson;

use crate::document::Document;
use crate::error::StoreResult;
use crate::path::{self, PathStep};

#[derive(Clone)]
pub struct Query {
    doc: Arc<Document>,
    steps: Vec<PathStep>,
}

impl Query {
    pub(crate) fn new(doc: Arc<Document>, steps: Vec<PathStep>) -> StoreResult<Self> {
        Ok(Query { doc, steps })
    }

    /// Narrows the selection by a relative path.
    pub fn prop(mut self, rel: &str) -> StoreResult<Self> {
        self.steps = path::join(&self.steps, path::parse(rel)?);
        Ok(self)
    }

    /// Narrows the selection by a relative path with `$label` placeholders.
    pub fn prop_with(mut self, rel: &str, data: &bson::Document) -> StoreResult<Self> {
        self.steps = path::join(&self.steps, path::parse_with(rel, Some(data))?);
        Ok(self)
    }

    /// Narrows into an array element by its identity key.
    pub fn id(mut self, id: impl Into<Bson>) -> Self {
        self.steps.push(PathStep::IdLookup(id.into()));
        self
    }

    /// Narrows into an array element by position.
    pub fn index(mut self, idx: usize) -> Self {
        self.steps.push(PathStep::Index(idx));
        self
    }

    /// Reads the selected value. `Ok(None)` means the path is valid but
    /// nothing is there.
    pub fn get(&self) -> StoreResult<Option<Bson>> {
        self.doc.read_path(&self.steps)
    }

    /// Reads the selected value, collapsing absence to `Null`.
    pub fn val(&self) -> StoreResult<Bson> {
        Ok(self.get()?.unwrap_or(Bson::Null))
    }

    pub fn set(&self, value: impl Into<Bson>) -> StoreResult<()> {
        self.doc.set_path(&self.steps, value.into())
    }

    pub fn inc(&self, delta: impl Into<Bson>) -> StoreResult<()> {
        self.doc.inc_path(&self.steps, delta.into())
    }

    pub fn push(&self, value: impl Into<Bson>) -> StoreResult<()> {
        self.doc.push_path(&self.steps, value.into())
    }

    pub fn pull(&self, value: impl Into<Bson>) -> StoreResult<()> {
        self.doc.pull_path(&self.steps, value.into())
    }

    /// Removes the selected value: a field is unset, an array element is
    /// spliced out.
    pub fn remove(&self) -> StoreResult<()> {
        self.doc.remove_path(&self.steps)
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("document", &self.doc.id())
            .field("path", &path::display(&self.steps))
            .finish()
    }
}
