//! Live document instances.
//!
//! A [`Document`] pairs a local snapshot of the stored value tree with a
//! queue of pending [`AtomicOp`]s. Mutations apply to the snapshot
//! immediately and queue an operation; [`Document::save`] flushes the queue
//! in one backend call. Instances are shared as `Arc<Document>` and interior
//! state sits behind a mutex, so two tasks holding the same handle observe
//! the same pending edits.

use std::sync::{Arc, Mutex, MutexGuard};

use bson::Bson;

use crate::error::{StoreError, StoreResult};
use crate::filter::FilterExpr;
use crate::model::ModelCore;
use crate::ops::{self, AtomicOp, OpKind};
use crate::path::{self, PathStep};
use crate::query::Query;
use crate::schema::Definition;
use crate::value::{values_equal, Number};

pub(crate) struct DocState {
    /// The declared shape of the document, without `_id`.
    pub(crate) snapshot: bson::Document,
    pub(crate) queue: Vec<AtomicOp>,
    /// True until the first successful save inserts the document.
    pub(crate) new: bool,
}

pub struct Document {
    id: String,
    core: Arc<ModelCore>,
    state: Mutex<DocState>,
}

impl Document {
    /// A document that does not exist in the backend yet. Data is validated
    /// and defaults are filled; `_id` may be supplied or is generated.
    pub(crate) fn fresh(core: Arc<ModelCore>, data: bson::Document) -> StoreResult<Arc<Self>> {
        let mut snapshot = core.schema.validate_document(&data)?;
        let id = match snapshot.remove("_id") {
            Some(Bson::String(id)) => id,
            Some(other) => return Err(StoreError::validation("_id", "string", &other)),
            None => uuid::Uuid::new_v4().simple().to_string(),
        };
        core.schema.apply_defaults(&mut snapshot);
        Ok(Arc::new(Document {
            id,
            core,
            state: Mutex::new(DocState { snapshot, queue: Vec::new(), new: true }),
        }))
    }

    /// A document materialized from backend output.
    pub(crate) fn materialize(
        core: Arc<ModelCore>,
        mut stored: bson::Document,
    ) -> StoreResult<Arc<Self>> {
        let id = match stored.remove("_id") {
            Some(Bson::String(id)) => id,
            other => {
                return Err(StoreError::Backend(format!(
                    "backend row without a string _id: {other:?}"
                )));
            }
        };
        let snapshot = core.schema.strip(&stored);
        Ok(Arc::new(Document {
            id,
            core,
            state: Mutex::new(DocState { snapshot, queue: Vec::new(), new: false }),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_new(&self) -> bool {
        self.state().new
    }

    pub fn has_pending_ops(&self) -> bool {
        let st = self.state();
        st.new || !st.queue.is_empty()
    }

    /// Materializes the declared shape of the current snapshot.
    pub fn to_object(&self) -> bson::Document {
        self.core.schema.strip(&self.state().snapshot)
    }

    /// The current snapshot as plain JSON, datetimes rendered as RFC 3339
    /// strings.
    pub fn to_json(&self) -> serde_json::Value {
        crate::convert::bson_to_json(&Bson::Document(self.to_object()))
    }

    /// Starts a path selection on this document.
    pub fn prop(self: &Arc<Self>, path: &str) -> StoreResult<Query> {
        Query::new(self.clone(), path::parse(path)?)
    }

    /// Starts a path selection with `$label` placeholders substituted from
    /// `data`.
    pub fn prop_with(self: &Arc<Self>, path: &str, data: &bson::Document) -> StoreResult<Query> {
        Query::new(self.clone(), path::parse_with(path, Some(data))?)
    }

    /// Flushes pending state in one backend call: a full insert for new
    /// documents, the queued operation batch otherwise. On failure the
    /// pending state is reinstated so a later save retries it. A successful
    /// save republishes this handle into the model's identity cache, so a
    /// lookup that follows a save always returns the saved instance.
    pub async fn save(self: &Arc<Self>) -> StoreResult<()> {
        enum Flush {
            Insert(bson::Document),
            Update(Vec<AtomicOp>),
            Nothing,
        }

        let flush = {
            let mut st = self.state();
            if st.new {
                let mut doc = bson::Document::new();
                doc.insert("_id", self.id.clone());
                doc.extend(st.snapshot.clone());
                st.new = false;
                st.queue.clear();
                Flush::Insert(doc)
            } else if st.queue.is_empty() {
                Flush::Nothing
            } else {
                Flush::Update(st.queue.drain(..).collect())
            }
        };

        match flush {
            Flush::Nothing => {}
            Flush::Insert(doc) => {
                let result = self
                    .core
                    .backend
                    .insert(&self.core.name, &self.core.schema, &doc)
                    .await;
                if let Err(err) = result {
                    self.state().new = true;
                    return Err(err);
                }
            }
            Flush::Update(batch) => {
                let result = self
                    .core
                    .backend
                    .update(
                        &self.core.name,
                        &self.core.schema,
                        &FilterExpr::by_id(&self.id),
                        &batch,
                    )
                    .await;
                if let Err(err) = result {
                    // Ops queued while the save was in flight stay behind
                    // the reinstated batch so replay order holds.
                    let mut st = self.state();
                    let mut queue = batch;
                    queue.append(&mut st.queue);
                    st.queue = queue;
                    return Err(err);
                }
            }
        }

        self.republish().await;
        Ok(())
    }

    /// Reinstates this handle in the identity cache after a save, so the
    /// next lookup serves it even if an earlier invalidation cleared the
    /// slot. A different live handle with pending operations is left alone.
    async fn republish(self: &Arc<Self>) {
        let mut cache = self.core.cache.write().await;
        if let Some(existing) = cache.get(&self.id) {
            if !Arc::ptr_eq(existing, self) && existing.has_pending_ops() {
                tracing::warn!(
                    collection = %self.core.name,
                    id = %self.id,
                    "not replacing a cached document with pending operations"
                );
                return;
            }
        }
        cache.insert(self.id.clone(), self.clone());
    }

    fn state(&self) -> MutexGuard<'_, DocState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Path selection internals, called through `Query`.

    pub(crate) fn read_path(&self, steps: &[PathStep]) -> StoreResult<Option<Bson>> {
        let st = self.state();
        Ok(self.core.schema.locate(&st.snapshot, steps)?.cloned())
    }

    pub(crate) fn set_path(&self, steps: &[PathStep], value: Bson) -> StoreResult<()> {
        let mut st = self.state();
        let (concrete, def) = self.core.schema.prepare_write(&mut st.snapshot, steps)?;
        let value = def.validate(&value, &path::display(steps))?;
        let op = AtomicOp::new(path::concrete_to_string(&concrete), OpKind::Set, value);
        self.queue_applied(&mut st, op)
    }

    pub(crate) fn inc_path(&self, steps: &[PathStep], delta: Bson) -> StoreResult<()> {
        let mut st = self.state();
        let (concrete, def) = self.core.schema.prepare_write(&mut st.snapshot, steps)?;
        if !matches!(
            def,
            Definition::Scalar { ty: crate::schema::ScalarType::Int, .. }
                | Definition::Scalar { ty: crate::schema::ScalarType::Float, .. }
        ) {
            return Err(StoreError::bad_path(
                path::display(steps),
                format!("cannot increment a {}", def.type_name()),
            ));
        }
        let delta = def.validate(&delta, &path::display(steps))?;
        if Number::from_bson(&delta).is_none() {
            return Err(StoreError::validation(path::display(steps), "numeric delta", &delta));
        }
        let op = AtomicOp::new(path::concrete_to_string(&concrete), OpKind::Inc, delta);
        self.queue_applied(&mut st, op)
    }

    pub(crate) fn push_path(&self, steps: &[PathStep], value: Bson) -> StoreResult<()> {
        let mut st = self.state();
        let (concrete, def) = self.core.schema.prepare_write(&mut st.snapshot, steps)?;
        let element = match def {
            Definition::Array { element, .. } => element,
            other => {
                return Err(StoreError::bad_path(
                    path::display(steps),
                    format!("cannot push into a {}", other.type_name()),
                ));
            }
        };
        let value = element.validate(&value, &path::display(steps))?;
        let op = AtomicOp::new(path::concrete_to_string(&concrete), OpKind::Push, value);
        self.queue_applied(&mut st, op)
    }

    pub(crate) fn pull_path(&self, steps: &[PathStep], value: Bson) -> StoreResult<()> {
        let mut st = self.state();
        let (concrete, def) = self.core.schema.prepare_write(&mut st.snapshot, steps)?;
        if !matches!(def, Definition::Array { .. }) {
            return Err(StoreError::bad_path(
                path::display(steps),
                format!("cannot pull from a {}", def.type_name()),
            ));
        }
        let op = AtomicOp::new(path::concrete_to_string(&concrete), OpKind::Pull, value);
        self.queue_applied(&mut st, op)
    }

    pub(crate) fn remove_path(&self, steps: &[PathStep]) -> StoreResult<()> {
        let mut st = self.state();
        let (concrete, _) = self.core.schema.prepare_write(&mut st.snapshot, steps)?;
        let op = AtomicOp::new(path::concrete_to_string(&concrete), OpKind::Unset, Bson::Null);
        self.queue_applied(&mut st, op)
    }

    fn queue_applied(&self, st: &mut DocState, op: AtomicOp) -> StoreResult<()> {
        if op.kind == OpKind::Pull {
            // Count before applying: the pull below removes every copy.
            let present = match path::get_concrete(&st.snapshot, &op.steps()) {
                Some(Bson::Array(items)) => {
                    items.iter().filter(|item| values_equal(item, &op.value)).count()
                }
                _ => 0,
            };
            ops::apply_op(&self.core.schema, &mut st.snapshot, &op)?;
            ops::merge_pull(&mut st.queue, op, present);
            return Ok(());
        }
        ops::apply_op(&self.core.schema, &mut st.snapshot, &op)?;
        ops::merge_op(&mut st.queue, op);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pending_ops(&self) -> Vec<AtomicOp> {
        self.state().queue.clone()
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state();
        f.debug_struct("Document")
            .field("id", &self.id)
            .field("collection", &self.core.name)
            .field("new", &st.new)
            .field("pending", &st.queue.len())
            .finish()
    }
}
