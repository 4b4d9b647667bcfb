//! Collection models.
//!
//! A [`Model`] binds a collection name and schema to a backend and owns the
//! identity cache: at most one live [`Document`] per `_id`. Two finds that
//! hit the same stored document return the same `Arc`, so edits through one
//! handle are visible through the other. Models are built once at startup
//! and live for the process.

use std::collections::HashMap;
use std::sync::Arc;

use mea::rwlock::RwLock;

use crate::backend::{DynBackend, FindOptions};
use crate::cursor::Cursor;
use crate::document::Document;
use crate::error::{StoreError, StoreResult};
use crate::filter::FilterExpr;
use crate::ops;
use crate::schema::Schema;

pub(crate) struct ModelCore {
    pub(crate) name: String,
    pub(crate) schema: Schema,
    pub(crate) backend: DynBackend,
    pub(crate) cache: RwLock<HashMap<String, Arc<Document>>>,
}

pub struct Model {
    core: Arc<ModelCore>,
}

impl Model {
    /// Binds a collection to a backend, registering its schema. For
    /// relational backends this creates the table.
    pub async fn bind(backend: DynBackend, name: &str, schema: Schema) -> StoreResult<Self> {
        backend.register(name, &schema).await?;
        tracing::debug!(collection = name, "model bound");
        Ok(Model {
            core: Arc::new(ModelCore {
                name: name.to_string(),
                schema,
                backend,
                cache: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn schema(&self) -> &Schema {
        &self.core.schema
    }

    /// Instantiates a document locally without touching the backend. Data is
    /// validated and defaults applied; the document inserts on first save.
    pub async fn new_document(&self, data: bson::Document) -> StoreResult<Arc<Document>> {
        let doc = Document::fresh(self.core.clone(), data)?;
        let mut cache = self.core.cache.write().await;
        if let Some(existing) = cache.get(doc.id()) {
            tracing::debug!(
                collection = %self.core.name,
                id = %doc.id(),
                "document already instantiated, returning the live handle"
            );
            return Ok(existing.clone());
        }
        cache.insert(doc.id().to_string(), doc.clone());
        Ok(doc)
    }

    /// Instantiates and saves in one step.
    pub async fn create(&self, data: bson::Document) -> StoreResult<Arc<Document>> {
        let doc = self.new_document(data).await?;
        doc.save().await?;
        Ok(doc)
    }

    /// Creates one document per data entry, saving each.
    pub async fn insert_many(
        &self,
        batch: impl IntoIterator<Item = bson::Document>,
    ) -> StoreResult<Vec<Arc<Document>>> {
        let mut out = Vec::new();
        for data in batch {
            out.push(self.create(data).await?);
        }
        Ok(out)
    }

    /// Starts a lazy find. The filter is parsed and checked here; nothing
    /// reaches the backend until the cursor executes.
    pub fn find(&self, filter: bson::Document) -> StoreResult<Cursor<'_>> {
        let filter = FilterExpr::parse(&self.core.schema, &filter)?;
        Ok(Cursor::new(self, filter))
    }

    pub async fn find_one(&self, filter: bson::Document) -> StoreResult<Option<Arc<Document>>> {
        let filter = FilterExpr::parse(&self.core.schema, &filter)?;
        if let Some(id) = filter.as_id_eq() {
            return self.find_one_by_object_id(id).await;
        }
        let options = FindOptions { limit: Some(1), ..FindOptions::default() };
        let mut rows = self.run_find(&filter, &options).await?;
        Ok(rows.pop())
    }

    /// Looks a document up by `_id`, serving a cached live handle without
    /// touching the backend when one exists.
    pub async fn find_one_by_object_id(&self, id: &str) -> StoreResult<Option<Arc<Document>>> {
        {
            let cache = self.core.cache.read().await;
            if let Some(doc) = cache.get(id) {
                return Ok(Some(doc.clone()));
            }
        }
        let filter = FilterExpr::by_id(id);
        let options = FindOptions { limit: Some(1), ..FindOptions::default() };
        let rows = self
            .core
            .backend
            .find(&self.core.name, &self.core.schema, &filter, &options)
            .await?;
        match rows.into_iter().next() {
            Some(stored) => Ok(Some(self.publish(stored).await?)),
            None => Ok(None),
        }
    }

    pub async fn count(&self, filter: bson::Document) -> StoreResult<u64> {
        let filter = FilterExpr::parse(&self.core.schema, &filter)?;
        self.core
            .backend
            .count(&self.core.name, &self.core.schema, &filter)
            .await
    }

    /// Applies a `$`-operator update document to every match, returning how
    /// many documents were touched. Cached handles covered by the filter are
    /// dropped so the next find materializes fresh state.
    pub async fn update(
        &self,
        filter: bson::Document,
        update: bson::Document,
    ) -> StoreResult<u64> {
        let filter = FilterExpr::parse(&self.core.schema, &filter)?;
        let batch = ops::parse_update(&self.core.schema, &update)?;
        let touched = self
            .core
            .backend
            .update(&self.core.name, &self.core.schema, &filter, &batch)
            .await?;
        self.invalidate(&filter).await;
        Ok(touched)
    }

    /// Deletes every match, returning how many documents were removed.
    pub async fn delete(&self, filter: bson::Document) -> StoreResult<u64> {
        let filter = FilterExpr::parse(&self.core.schema, &filter)?;
        let removed = self
            .core
            .backend
            .delete(&self.core.name, &self.core.schema, &filter)
            .await?;
        self.invalidate(&filter).await;
        Ok(removed)
    }

    /// Runs an aggregation pipeline, returning raw result rows.
    pub async fn aggregate(&self, stages: &[bson::Document]) -> StoreResult<Vec<bson::Document>> {
        let pipeline = crate::pipeline::Pipeline::parse(&self.core.schema, stages)?;
        self.core
            .backend
            .aggregate(&self.core.name, &self.core.schema, &pipeline)
            .await
    }

    /// Drops one cached handle, forcing the next lookup through the backend.
    pub async fn drop_from_cache(&self, id: &str) {
        self.core.cache.write().await.remove(id);
    }

    pub(crate) async fn run_find(
        &self,
        filter: &FilterExpr,
        options: &FindOptions,
    ) -> StoreResult<Vec<Arc<Document>>> {
        let rows = self
            .core
            .backend
            .find(&self.core.name, &self.core.schema, filter, options)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        // Projected rows are partial and must not enter the identity cache.
        let partial = !options.projection.is_empty();
        for stored in rows {
            if partial {
                out.push(Document::materialize(self.core.clone(), stored)?);
            } else {
                out.push(self.publish(stored).await?);
            }
        }
        Ok(out)
    }

    pub(crate) async fn run_count(&self, filter: &FilterExpr) -> StoreResult<u64> {
        self.core
            .backend
            .count(&self.core.name, &self.core.schema, filter)
            .await
    }

    /// Admits a stored document into the identity cache. An occupied slot
    /// always wins: the cached handle is the live instance and a fresh read
    /// is at best as current. Saves republish through the document itself.
    async fn publish(&self, stored: bson::Document) -> StoreResult<Arc<Document>> {
        let id = stored
            .get_str("_id")
            .map_err(|_| StoreError::Backend("backend row without a string _id".to_string()))?
            .to_string();

        let mut cache = self.core.cache.write().await;
        if let Some(existing) = cache.get(&id) {
            return Ok(existing.clone());
        }
        let doc = Document::materialize(self.core.clone(), stored)?;
        cache.insert(id, doc.clone());
        Ok(doc)
    }

    async fn invalidate(&self, filter: &FilterExpr) {
        let mut cache = self.core.cache.write().await;
        match filter.as_id_eq() {
            Some(id) => {
                cache.remove(id);
            }
            None => {
                tracing::debug!(collection = %self.core.name, "clearing identity cache");
                cache.clear();
            }
        }
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model").field("name", &self.core.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StorageBackend;
    use crate::ops::OpKind;
    use crate::pipeline::Pipeline;
    use crate::schema::Definition;
    use async_trait::async_trait;
    use bson::{bson, doc, Bson};

    /// A backend for exercising the local document lifecycle; any call that
    /// would do I/O is a bug in the test.
    struct NullBackend;

    #[async_trait]
    impl StorageBackend for NullBackend {
        async fn register(&self, _: &str, _: &Schema) -> StoreResult<()> {
            Ok(())
        }
        async fn find(
            &self,
            _: &str,
            _: &Schema,
            _: &FilterExpr,
            _: &FindOptions,
        ) -> StoreResult<Vec<bson::Document>> {
            panic!("unexpected backend find")
        }
        async fn count(&self, _: &str, _: &Schema, _: &FilterExpr) -> StoreResult<u64> {
            panic!("unexpected backend count")
        }
        async fn aggregate(
            &self,
            _: &str,
            _: &Schema,
            _: &Pipeline,
        ) -> StoreResult<Vec<bson::Document>> {
            panic!("unexpected backend aggregate")
        }
        async fn insert(&self, _: &str, _: &Schema, _: &bson::Document) -> StoreResult<()> {
            panic!("unexpected backend insert")
        }
        async fn update(
            &self,
            _: &str,
            _: &Schema,
            _: &FilterExpr,
            _: &[crate::ops::AtomicOp],
        ) -> StoreResult<u64> {
            panic!("unexpected backend update")
        }
        async fn delete(&self, _: &str, _: &Schema, _: &FilterExpr) -> StoreResult<u64> {
            panic!("unexpected backend delete")
        }
    }

    fn schema() -> Schema {
        Schema::builder()
            .field("name", Definition::string())
            .field("level", Definition::int().with_default(1))
            .field("tags", Definition::array(Definition::string()))
            .field(
                "roles",
                Definition::array(Definition::object([
                    ("id", Definition::string()),
                    ("title", Definition::string()),
                ])),
            )
            .build()
    }

    async fn model() -> Model {
        Model::bind(Arc::new(NullBackend), "guilds", schema())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn set_is_visible_before_save() {
        let model = model().await;
        let doc = model.new_document(doc! { "name": "alpha" }).await.unwrap();
        doc.prop("name").unwrap().set("beta").unwrap();
        assert_eq!(doc.prop("name").unwrap().get().unwrap(), Some(bson!("beta")));
        assert!(doc.is_new());
    }

    #[tokio::test]
    async fn increments_merge_into_one_pending_op() {
        let model = model().await;
        let doc = model.new_document(doc! { "name": "alpha" }).await.unwrap();
        doc.prop("level").unwrap().inc(2).unwrap();
        doc.prop("level").unwrap().inc(3).unwrap();
        let pending = doc.pending_ops();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, OpKind::Inc);
        assert_eq!(pending[0].value, Bson::Int64(5));
        // Default 1, plus both increments.
        assert_eq!(doc.prop("level").unwrap().get().unwrap(), Some(bson!(6_i64)));
    }

    #[tokio::test]
    async fn pull_of_pending_push_leaves_no_op() {
        let model = model().await;
        let doc = model.new_document(doc! { "name": "alpha" }).await.unwrap();
        doc.prop("tags").unwrap().push("x").unwrap();
        doc.prop("tags").unwrap().pull("x").unwrap();
        assert!(doc.pending_ops().is_empty());
        assert_eq!(doc.prop("tags").unwrap().val().unwrap(), bson!([]));
    }

    #[tokio::test]
    async fn pull_cancels_repeated_pushes_of_the_same_value() {
        let model = model().await;
        let doc = model.new_document(doc! { "name": "alpha" }).await.unwrap();
        doc.prop("tags").unwrap().push("x").unwrap();
        doc.prop("tags").unwrap().push("x").unwrap();
        doc.prop("tags").unwrap().pull("x").unwrap();
        // The queue must replay to the same empty array the caller sees.
        assert!(doc.pending_ops().is_empty());
        assert_eq!(doc.prop("tags").unwrap().val().unwrap(), bson!([]));
    }

    #[tokio::test]
    async fn pull_of_a_stored_value_outlives_cancelled_pushes() {
        let model = model().await;
        let doc = Document::materialize(
            model.core.clone(),
            doc! { "_id": "g1", "name": "alpha", "tags": ["x"] },
        )
        .unwrap();
        doc.prop("tags").unwrap().push("x").unwrap();
        doc.prop("tags").unwrap().pull("x").unwrap();
        let pending = doc.pending_ops();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, OpKind::Pull);
        assert_eq!(doc.prop("tags").unwrap().val().unwrap(), bson!([]));
    }

    #[tokio::test]
    async fn identity_lookup_edits_the_right_element() {
        let model = model().await;
        let doc = model
            .new_document(doc! {
                "name": "alpha",
                "roles": [
                    { "id": "r1", "title": "admin" },
                    { "id": "r2", "title": "mod" },
                ],
            })
            .await
            .unwrap();
        doc.prop("roles")
            .unwrap()
            .id("r2")
            .prop("title")
            .unwrap()
            .set("owner")
            .unwrap();
        let roles = doc.prop("roles").unwrap().val().unwrap();
        assert_eq!(
            roles,
            bson!([
                { "id": "r1", "title": "admin" },
                { "id": "r2", "title": "owner" },
            ])
        );
        // The queued op carries the pinned position.
        assert_eq!(doc.pending_ops()[0].path, "roles.1.title");
    }

    #[tokio::test]
    async fn to_object_materializes_declared_shape_only() {
        let model = model().await;
        let doc = model.new_document(doc! { "name": "alpha" }).await.unwrap();
        let object = doc.to_object();
        assert_eq!(object.get("name").unwrap(), &bson!("alpha"));
        assert_eq!(object.get("level").unwrap(), &bson!(1_i64));
        assert!(!object.contains_key("_id"));
    }

    #[tokio::test]
    async fn new_document_rejects_undeclared_fields() {
        let model = model().await;
        let err = model
            .new_document(doc! { "name": "alpha", "stray": 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
    }
}
