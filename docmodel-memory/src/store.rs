//! In-memory storage backend.
//!
//! Documents are stored as BSON value trees in nested maps behind an
//! async-aware read-write lock. Queries scan the collection; there is no
//! indexing, which is fine for the intended use of development, testing, and
//! small working sets.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bson::Bson;
use mea::rwlock::RwLock;

use docmodel_core::backend::{compare_documents, project_document, FindOptions, StorageBackend};
use docmodel_core::error::{StoreError, StoreResult};
use docmodel_core::filter::FilterExpr;
use docmodel_core::ops::{self, AtomicOp};
use docmodel_core::pipeline::Pipeline;
use docmodel_core::schema::Schema;

use crate::aggregate;
use crate::evaluator;

type CollectionMap = HashMap<String, bson::Document>;
type StoreMap = HashMap<String, CollectionMap>;

/// Thread-safe in-memory document store.
///
/// Cloning is cheap and clones share the same underlying data, so one
/// instance can serve any number of models across async tasks.
#[derive(Default, Clone, Debug)]
pub struct MemoryStore {
    store: Arc<RwLock<StoreMap>>,
}

impl MemoryStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn rows_matching(collection: Option<&CollectionMap>, filter: &FilterExpr) -> Vec<bson::Document> {
        let Some(collection) = collection else {
            return Vec::new();
        };
        // Identity filters skip the scan.
        if let Some(id) = filter.as_id_eq() {
            return collection.get(id).cloned().into_iter().collect();
        }
        collection
            .values()
            .filter(|row| evaluator::matches(row, filter))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StorageBackend for MemoryStore {
    async fn register(&self, collection: &str, _schema: &Schema) -> StoreResult<()> {
        let mut store = self.store.write().await;
        store.entry(collection.to_string()).or_default();
        tracing::debug!(collection, "collection registered");
        Ok(())
    }

    async fn find(
        &self,
        collection: &str,
        _schema: &Schema,
        filter: &FilterExpr,
        options: &FindOptions,
    ) -> StoreResult<Vec<bson::Document>> {
        let store = self.store.read().await;
        let mut rows = Self::rows_matching(store.get(collection), filter);
        drop(store);

        if !options.sort.is_empty() {
            rows.sort_by(|a, b| compare_documents(a, b, &options.sort));
        }
        if let Some(skip) = options.skip {
            let skip = (skip as usize).min(rows.len());
            rows.drain(..skip);
        }
        if let Some(limit) = options.limit {
            rows.truncate(limit as usize);
        }
        if !options.projection.is_empty() {
            rows = rows
                .iter()
                .map(|row| project_document(row, &options.projection))
                .collect();
        }
        Ok(rows)
    }

    async fn count(
        &self,
        collection: &str,
        _schema: &Schema,
        filter: &FilterExpr,
    ) -> StoreResult<u64> {
        let store = self.store.read().await;
        Ok(Self::rows_matching(store.get(collection), filter).len() as u64)
    }

    async fn aggregate(
        &self,
        collection: &str,
        _schema: &Schema,
        pipeline: &Pipeline,
    ) -> StoreResult<Vec<bson::Document>> {
        let store = self.store.read().await;
        let rows: Vec<bson::Document> = store
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default();
        drop(store);
        aggregate::run(pipeline, rows)
    }

    async fn insert(
        &self,
        collection: &str,
        _schema: &Schema,
        document: &bson::Document,
    ) -> StoreResult<()> {
        let id = match document.get("_id") {
            Some(Bson::String(id)) => id.clone(),
            other => {
                return Err(StoreError::Constraint(format!(
                    "insert without a string _id: {other:?}"
                )));
            }
        };

        let mut store = self.store.write().await;
        let rows = store.entry(collection.to_string()).or_default();
        if rows.contains_key(&id) {
            return Err(StoreError::Constraint(format!(
                "duplicate _id `{id}` in `{collection}`"
            )));
        }
        rows.insert(id, document.clone());
        Ok(())
    }

    async fn update(
        &self,
        collection: &str,
        schema: &Schema,
        filter: &FilterExpr,
        batch: &[AtomicOp],
    ) -> StoreResult<u64> {
        let mut store = self.store.write().await;
        let Some(rows) = store.get_mut(collection) else {
            return Ok(0);
        };

        let mut touched = 0;
        for row in rows.values_mut() {
            if !evaluator::matches(row, filter) {
                continue;
            }
            ops::apply_ops(schema, row, batch)?;
            touched += 1;
        }
        Ok(touched)
    }

    async fn delete(
        &self,
        collection: &str,
        _schema: &Schema,
        filter: &FilterExpr,
    ) -> StoreResult<u64> {
        let mut store = self.store.write().await;
        let Some(rows) = store.get_mut(collection) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|_, row| !evaluator::matches(row, filter));
        Ok((before - rows.len()) as u64)
    }
}
