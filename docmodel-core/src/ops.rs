//! Queued atomic operations.
//!
//! Every mutation on a document is recorded as an [`AtomicOp`] against a
//! fully concrete path, applied immediately to the local snapshot, and
//! flushed to the backend on save. The queue is kept minimal: a later
//! assignment supersedes earlier operations on the same path, increments
//! accumulate, and a pull cancels every still-pending push of the same
//! value, staying queued itself only while the stored document holds a copy.

use bson::Bson;

use crate::error::{StoreError, StoreResult};
use crate::path::{self, ConcreteStep, PathStep};
use crate::schema::Schema;
use crate::value::{values_equal, Number};

/// The kind of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Set,
    Inc,
    Push,
    Pull,
    Unset,
}

impl OpKind {
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Set => "$set",
            OpKind::Inc => "$inc",
            OpKind::Push => "$push",
            OpKind::Pull => "$pull",
            OpKind::Unset => "$unset",
        }
    }
}

/// One pending mutation. `path` is canonical dotted form with every lookup
/// already pinned to a position (`roles.2.title`), so the operation stays
/// valid however the backend replays it.
#[derive(Debug, Clone, PartialEq)]
pub struct AtomicOp {
    pub path: String,
    pub kind: OpKind,
    pub value: Bson,
}

impl AtomicOp {
    pub fn new(path: impl Into<String>, kind: OpKind, value: Bson) -> Self {
        AtomicOp { path: path.into(), kind, value }
    }

    pub fn steps(&self) -> Vec<ConcreteStep> {
        path::concrete_from_string(&self.path)
    }
}

/// Folds `op` into `queue` under the pending-operation merge rules. The
/// queue keeps submission order for everything that survives.
pub fn merge_op(queue: &mut Vec<AtomicOp>, op: AtomicOp) {
    match op.kind {
        // An assignment or removal makes every earlier operation on the
        // identical path irrelevant.
        OpKind::Set | OpKind::Unset => {
            queue.retain(|pending| pending.path != op.path);
            queue.push(op);
        }
        // Increments against the same path collapse into one delta.
        OpKind::Inc => {
            if let Some(pending) = queue
                .iter_mut()
                .find(|pending| pending.kind == OpKind::Inc && pending.path == op.path)
            {
                let merged = Number::from_bson(&pending.value)
                    .zip(Number::from_bson(&op.value))
                    .map(|(a, b)| a.add(b).to_bson());
                if let Some(total) = merged {
                    pending.value = total;
                    return;
                }
            }
            queue.push(op);
        }
        OpKind::Push => queue.push(op),
        // Without the pre-pull element count a stored copy must be assumed,
        // so the pull stays queued. Callers that know the count go through
        // [`merge_pull`].
        OpKind::Pull => merge_pull(queue, op, usize::MAX),
    }
}

/// Folds a pull into the queue. `present` is how many equal elements the
/// array held before the pull ran. Every pending push of the value cancels
/// against it; the pull itself stays queued only when the stored document
/// holds a copy the pushes do not account for, so the merged queue replays
/// to the same state the caller observed locally.
pub fn merge_pull(queue: &mut Vec<AtomicOp>, op: AtomicOp, present: usize) {
    let cancelled = cancel_pushes(queue, &op);
    if present > cancelled {
        queue.push(op);
    }
}

fn cancel_pushes(queue: &mut Vec<AtomicOp>, op: &AtomicOp) -> usize {
    let before = queue.len();
    queue.retain(|pending| {
        !(pending.kind == OpKind::Push
            && pending.path == op.path
            && values_equal(&pending.value, &op.value))
    });
    before - queue.len()
}

fn concrete_to_steps(steps: &[ConcreteStep]) -> Vec<PathStep> {
    steps
        .iter()
        .map(|s| match s {
            ConcreteStep::Field(name) => PathStep::Field(name.clone()),
            ConcreteStep::Index(idx) => PathStep::Index(*idx),
        })
        .collect()
}

/// Replays one operation against a materialized document. Both the local
/// snapshot and the document-store backend go through this, so the two
/// always agree on the result.
pub fn apply_op(schema: &Schema, root: &mut bson::Document, op: &AtomicOp) -> StoreResult<()> {
    let concrete = op.steps();
    let steps = concrete_to_steps(&concrete);

    match op.kind {
        OpKind::Set => {
            schema.prepare_write(root, &steps)?;
            path::set_concrete(root, &concrete, op.value.clone())
        }
        OpKind::Unset => {
            path::remove_concrete(root, &concrete);
            Ok(())
        }
        OpKind::Inc => {
            schema.prepare_write(root, &steps)?;
            let delta = Number::from_bson(&op.value).ok_or_else(|| {
                StoreError::validation(&op.path, "numeric increment", &op.value)
            })?;
            let current = path::get_concrete(root, &concrete)
                .and_then(Number::from_bson)
                .unwrap_or(Number::Int(0));
            path::set_concrete(root, &concrete, current.add(delta).to_bson())
        }
        OpKind::Push => {
            schema.prepare_write(root, &steps)?;
            if path::get_concrete(root, &concrete).is_none() {
                path::set_concrete(root, &concrete, Bson::Array(Vec::new()))?;
            }
            match path::get_concrete_mut(root, &concrete) {
                Some(Bson::Array(items)) => {
                    items.push(op.value.clone());
                    Ok(())
                }
                Some(other) => Err(StoreError::validation(&op.path, "array", other)),
                None => Err(StoreError::bad_path(&op.path, "missing array container")),
            }
        }
        OpKind::Pull => {
            match path::get_concrete_mut(root, &concrete) {
                Some(Bson::Array(items)) => {
                    items.retain(|item| !values_equal(item, &op.value));
                    Ok(())
                }
                // Pulling from an absent array is a no-op.
                None => Ok(()),
                Some(other) => Err(StoreError::validation(&op.path, "array", other)),
            }
        }
    }
}

/// Replays a batch in submission order.
pub fn apply_ops(schema: &Schema, root: &mut bson::Document, ops: &[AtomicOp]) -> StoreResult<()> {
    for op in ops {
        apply_op(schema, root, op)?;
    }
    Ok(())
}

/// Parses a `$set`/`$inc`/`$push`/`$pull`/`$unset` update document into a
/// validated operation batch. Unknown operators are rejected before any I/O.
pub fn parse_update(schema: &Schema, update: &bson::Document) -> StoreResult<Vec<AtomicOp>> {
    let mut ops = Vec::new();

    for (operator, payload) in update.iter() {
        let kind = match operator.as_str() {
            "$set" => OpKind::Set,
            "$inc" => OpKind::Inc,
            "$push" => OpKind::Push,
            "$pull" => OpKind::Pull,
            "$unset" => OpKind::Unset,
            other => return Err(StoreError::UnsupportedOperator(other.to_string())),
        };

        let fields = payload.as_document().ok_or_else(|| {
            StoreError::validation(operator, "document of path/value pairs", payload)
        })?;

        for (raw_path, value) in fields.iter() {
            let steps = path::parse(raw_path)?;
            let def = schema.resolve(&steps)?;
            let value = match kind {
                OpKind::Set => def.validate(value, raw_path)?,
                OpKind::Unset => Bson::Null,
                _ => value.clone(),
            };
            ops.push(AtomicOp::new(raw_path.clone(), kind, value));
        }
    }

    Ok(ops)
}
