//! Declarative field-type tree and path resolution.
//!
//! A [`Schema`] binds named top-level fields to [`Definition`] nodes. Every
//! mutated path must resolve to exactly one node; unresolvable paths are
//! rejected synchronously, before any backend I/O. The schema also decides
//! the relational grouping: scalar top-level fields map to fixed columns,
//! structured fields are serialized into JSON columns.

use std::collections::BTreeMap;

use bson::Bson;

use crate::error::{StoreError, StoreResult};
use crate::path::{self, ConcreteStep, PathStep};
use crate::value::values_equal;

/// Scalar leaf types supported by the definition tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    String,
    Int,
    Float,
    Bool,
    DateTime,
}

impl ScalarType {
    pub fn name(self) -> &'static str {
        match self {
            ScalarType::String => "string",
            ScalarType::Int => "int",
            ScalarType::Float => "float",
            ScalarType::Bool => "bool",
            ScalarType::DateTime => "datetime",
        }
    }
}

/// One node of the field-type tree.
#[derive(Debug, Clone)]
pub enum Definition {
    /// A scalar leaf with an optional declared default.
    Scalar {
        ty: ScalarType,
        default: Option<Bson>,
    },
    /// An ordered list of same-shaped elements. `id_key` names the element
    /// field used by identity lookups.
    Array {
        element: Box<Definition>,
        id_key: String,
    },
    /// A fixed set of named fields.
    Object { fields: BTreeMap<String, Definition> },
    /// Free-form string keys over one value shape.
    Map { value: Box<Definition> },
}

impl Definition {
    pub fn string() -> Self {
        Definition::Scalar { ty: ScalarType::String, default: None }
    }

    pub fn int() -> Self {
        Definition::Scalar { ty: ScalarType::Int, default: None }
    }

    pub fn float() -> Self {
        Definition::Scalar { ty: ScalarType::Float, default: None }
    }

    pub fn boolean() -> Self {
        Definition::Scalar { ty: ScalarType::Bool, default: None }
    }

    pub fn datetime() -> Self {
        Definition::Scalar { ty: ScalarType::DateTime, default: None }
    }

    /// Attaches a declared default. Only meaningful on scalar nodes. The
    /// value takes the same numeric widening as validated writes so that
    /// defaulted and written fields read back identically.
    pub fn with_default(self, value: impl Into<Bson>) -> Self {
        match self {
            Definition::Scalar { ty, .. } => {
                let default = match (ty, value.into()) {
                    (ScalarType::Int, Bson::Int32(n)) => Bson::Int64(n.into()),
                    (ScalarType::Float, Bson::Int32(n)) => Bson::Double(n.into()),
                    (ScalarType::Float, Bson::Int64(n)) => Bson::Double(n as f64),
                    (_, v) => v,
                };
                Definition::Scalar { ty, default: Some(default) }
            }
            other => other,
        }
    }

    /// An array whose elements are identified by the default `id` key.
    pub fn array(element: Definition) -> Self {
        Definition::Array { element: Box::new(element), id_key: "id".to_string() }
    }

    /// An array with an explicit identity key for `id()` lookups.
    pub fn array_keyed(element: Definition, id_key: impl Into<String>) -> Self {
        Definition::Array { element: Box::new(element), id_key: id_key.into() }
    }

    pub fn object<K: Into<String>>(fields: impl IntoIterator<Item = (K, Definition)>) -> Self {
        Definition::Object {
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn map(value: Definition) -> Self {
        Definition::Map { value: Box::new(value) }
    }

    /// Human-readable shape name for error messages.
    pub fn type_name(&self) -> String {
        match self {
            Definition::Scalar { ty, .. } => ty.name().to_string(),
            Definition::Array { element, .. } => format!("array<{}>", element.type_name()),
            Definition::Object { .. } => "object".to_string(),
            Definition::Map { value } => format!("map<{}>", value.type_name()),
        }
    }

    /// Validates `value` against this node and returns the normalized copy:
    /// integers widen to i64 and floats to f64 so values round-trip
    /// identically through both backends. `Null` is accepted everywhere and
    /// denotes absence.
    pub fn validate(&self, value: &Bson, at: &str) -> StoreResult<Bson> {
        if matches!(value, Bson::Null) {
            return Ok(Bson::Null);
        }

        match self {
            Definition::Scalar { ty, .. } => match (ty, value) {
                (ScalarType::String, Bson::String(_)) => Ok(value.clone()),
                (ScalarType::Int, Bson::Int32(v)) => Ok(Bson::Int64(*v as i64)),
                (ScalarType::Int, Bson::Int64(_)) => Ok(value.clone()),
                (ScalarType::Float, Bson::Double(_)) => Ok(value.clone()),
                (ScalarType::Float, Bson::Int32(v)) => Ok(Bson::Double(*v as f64)),
                (ScalarType::Float, Bson::Int64(v)) => Ok(Bson::Double(*v as f64)),
                (ScalarType::Bool, Bson::Boolean(_)) => Ok(value.clone()),
                (ScalarType::DateTime, Bson::DateTime(_)) => Ok(value.clone()),
                _ => Err(StoreError::validation(at, ty.name(), value)),
            },
            Definition::Array { element, .. } => match value {
                Bson::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for (i, item) in items.iter().enumerate() {
                        out.push(element.validate(item, &format!("{at}.{i}"))?);
                    }
                    Ok(Bson::Array(out))
                }
                _ => Err(StoreError::validation(at, self.type_name(), value)),
            },
            Definition::Object { fields } => match value {
                Bson::Document(doc) => {
                    let mut out = bson::Document::new();
                    for (key, item) in doc.iter() {
                        let field = fields.get(key).ok_or_else(|| {
                            StoreError::bad_path(
                                format!("{at}.{key}"),
                                "field not declared in definition",
                            )
                        })?;
                        out.insert(key.clone(), field.validate(item, &format!("{at}.{key}"))?);
                    }
                    Ok(Bson::Document(out))
                }
                _ => Err(StoreError::validation(at, "object", value)),
            },
            Definition::Map { value: value_def } => match value {
                Bson::Document(doc) => {
                    let mut out = bson::Document::new();
                    for (key, item) in doc.iter() {
                        out.insert(key.clone(), value_def.validate(item, &format!("{at}.{key}"))?);
                    }
                    Ok(Bson::Document(out))
                }
                _ => Err(StoreError::validation(at, "map", value)),
            },
        }
    }

    /// The empty container this node materializes as when `set()` has to
    /// auto-create an intermediate. Shaped by the definition, not by the
    /// value being assigned.
    pub fn empty_container(&self) -> Option<Bson> {
        match self {
            Definition::Array { .. } => Some(Bson::Array(Vec::new())),
            Definition::Object { .. } | Definition::Map { .. } => {
                Some(Bson::Document(bson::Document::new()))
            }
            Definition::Scalar { .. } => None,
        }
    }

    /// The declared default for this node: the scalar default, or for
    /// objects a document of the nested declared defaults.
    pub fn default_value(&self) -> Option<Bson> {
        match self {
            Definition::Scalar { default, .. } => default.clone(),
            Definition::Object { fields } => {
                let mut doc = bson::Document::new();
                for (key, def) in fields {
                    if let Some(v) = def.default_value() {
                        doc.insert(key.clone(), v);
                    }
                }
                if doc.is_empty() { None } else { Some(Bson::Document(doc)) }
            }
            _ => None,
        }
    }

    fn id_key(&self) -> Option<&str> {
        match self {
            Definition::Array { id_key, .. } => Some(id_key),
            _ => None,
        }
    }
}

/// How a top-level field is persisted by the relational backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Real,
    /// Serialized JSON in a TEXT column.
    Json,
}

/// A declarative schema for one collection.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: BTreeMap<String, Definition>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Definition)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn field(&self, name: &str) -> Option<&Definition> {
        self.fields.get(name)
    }

    /// The relational column grouping: one fixed column per scalar top-level
    /// field, one JSON column per structured field.
    pub fn columns(&self) -> Vec<(&str, ColumnKind)> {
        self.fields
            .iter()
            .map(|(name, def)| {
                let kind = match def {
                    Definition::Scalar { ty, .. } => match ty {
                        ScalarType::String | ScalarType::DateTime => ColumnKind::Text,
                        ScalarType::Int | ScalarType::Bool => ColumnKind::Integer,
                        ScalarType::Float => ColumnKind::Real,
                    },
                    _ => ColumnKind::Json,
                };
                (name.as_str(), kind)
            })
            .collect()
    }

    /// Resolves a step sequence to the single Definition node governing it.
    pub fn resolve(&self, steps: &[PathStep]) -> StoreResult<&Definition> {
        let mut node: Option<&Definition> = None;

        for step in steps {
            node = Some(match node {
                None => self.resolve_top(step, steps)?,
                Some(def) => Self::child(def, step, steps)?,
            });
        }

        node.ok_or_else(|| StoreError::bad_path(path::display(steps), "empty path"))
    }

    fn resolve_top(&self, step: &PathStep, all: &[PathStep]) -> StoreResult<&Definition> {
        let name = match step {
            PathStep::Field(name) => name.clone(),
            PathStep::Lookup(v) => path::lookup_as_field(v).ok_or_else(|| {
                StoreError::bad_path(path::display(all), "placeholder does not name a field")
            })?,
            _ => {
                return Err(StoreError::bad_path(
                    path::display(all),
                    "document root is addressed by field name",
                ));
            }
        };
        self.fields.get(&name).ok_or_else(|| {
            StoreError::bad_path(path::display(all), format!("unknown field `{name}`"))
        })
    }

    fn child<'a>(def: &'a Definition, step: &PathStep, all: &[PathStep]) -> StoreResult<&'a Definition> {
        match (def, step) {
            (Definition::Array { element, .. }, _) => Ok(element),
            (Definition::Object { fields }, PathStep::Field(name)) => {
                fields.get(name).ok_or_else(|| {
                    StoreError::bad_path(path::display(all), format!("unknown field `{name}`"))
                })
            }
            (Definition::Object { fields }, PathStep::Lookup(v)) => {
                let name = path::lookup_as_field(v).ok_or_else(|| {
                    StoreError::bad_path(path::display(all), "placeholder does not name a field")
                })?;
                fields.get(&name).ok_or_else(|| {
                    StoreError::bad_path(path::display(all), format!("unknown field `{name}`"))
                })
            }
            (Definition::Map { value }, PathStep::Field(_) | PathStep::Lookup(_)) => Ok(value),
            (Definition::Scalar { .. }, _) => Err(StoreError::bad_path(
                path::display(all),
                "path descends past a scalar leaf",
            )),
            _ => Err(StoreError::bad_path(
                path::display(all),
                format!("step `{step}` does not fit {}", def.type_name()),
            )),
        }
    }

    /// Reads the value at `steps` from a live snapshot. `Ok(None)` means the
    /// path is schema-valid but the value is absent; `Err` means the path
    /// does not resolve at all.
    pub fn locate<'a>(
        &self,
        root: &'a bson::Document,
        steps: &[PathStep],
    ) -> StoreResult<Option<&'a Bson>> {
        self.resolve(steps)?;

        let mut parent_def: Option<&Definition> = None;
        let mut current: Option<&'a Bson> = None;

        for (i, step) in steps.iter().enumerate() {
            let holder: Holder<'a, '_> = if i == 0 {
                Holder::Root(root)
            } else {
                match current {
                    Some(v) => Holder::Value(v),
                    None => return Ok(None),
                }
            };
            current = descend(holder, parent_def, step);
            parent_def = Some(match parent_def {
                None => self.resolve_top(step, steps)?,
                Some(def) => Self::child(def, step, steps)?,
            });
        }

        Ok(current)
    }

    /// Resolves `steps` against a live snapshot into a fully concrete path,
    /// creating any missing intermediate containers shaped by their
    /// Definition. Returns the concrete path and the target node; the leaf
    /// itself is not created.
    pub fn prepare_write(
        &self,
        root: &mut bson::Document,
        steps: &[PathStep],
    ) -> StoreResult<(Vec<ConcreteStep>, &Definition)> {
        let target = self.resolve(steps)?;
        let mut concrete: Vec<ConcreteStep> = Vec::with_capacity(steps.len());

        // First pass: pin every lookup to a field or position using
        // read-only traversal of the snapshot.
        {
            let mut parent_def: Option<&Definition> = None;
            let mut current: Option<&Bson> = None;

            for (i, step) in steps.iter().enumerate() {
                let holder: Holder<'_, '_> = if i == 0 {
                    Holder::Root(root)
                } else {
                    match current {
                        Some(v) => Holder::Value(v),
                        None => Holder::Missing,
                    }
                };

                let next_def = match parent_def {
                    None => self.resolve_top(step, steps)?,
                    Some(def) => Self::child(def, step, steps)?,
                };

                let concrete_step = match step {
                    PathStep::Field(name) => ConcreteStep::Field(name.clone()),
                    PathStep::Index(idx) => ConcreteStep::Index(*idx),
                    PathStep::IdLookup(id) => {
                        let id_key = parent_def.and_then(|d| d.id_key()).unwrap_or("id");
                        match holder.find_by_id(id_key, id) {
                            Some(idx) => ConcreteStep::Index(idx),
                            None => {
                                return Err(StoreError::bad_path(
                                    path::display(steps),
                                    format!("no array element with {id_key} = {id}"),
                                ));
                            }
                        }
                    }
                    PathStep::Lookup(v) => match parent_def {
                        Some(Definition::Array { id_key, .. }) => {
                            match holder.find_by_id(id_key, v) {
                                Some(idx) => ConcreteStep::Index(idx),
                                None => match path::lookup_as_index(v) {
                                    Some(idx) => ConcreteStep::Index(idx),
                                    None => {
                                        return Err(StoreError::bad_path(
                                            path::display(steps),
                                            format!("no array element matching {v}"),
                                        ));
                                    }
                                },
                            }
                        }
                        _ => ConcreteStep::Field(path::lookup_as_field(v).ok_or_else(|| {
                            StoreError::bad_path(
                                path::display(steps),
                                "placeholder does not name a field",
                            )
                        })?),
                    },
                };

                current = descend(holder, parent_def, step);
                parent_def = Some(next_def);
                concrete.push(concrete_step);
            }
        }

        // Second pass: materialize missing intermediates, each shaped by the
        // Definition at its position.
        let mut defs: Vec<&Definition> = Vec::with_capacity(concrete.len());
        {
            let mut node: Option<&Definition> = None;
            for step in steps {
                node = Some(match node {
                    None => self.resolve_top(step, steps)?,
                    Some(def) => Self::child(def, step, steps)?,
                });
                defs.push(node.unwrap());
            }
        }
        for depth in 0..concrete.len().saturating_sub(1) {
            if path::get_concrete(root, &concrete[..=depth]).is_none() {
                let container = defs[depth].empty_container().ok_or_else(|| {
                    StoreError::bad_path(path::display(steps), "path descends past a scalar leaf")
                })?;
                path::set_concrete(root, &concrete[..=depth], container)?;
            }
        }

        Ok((concrete, target))
    }

    /// Materializes only the schema-declared shape of `doc`, dropping any
    /// field outside the Definition.
    pub fn strip(&self, doc: &bson::Document) -> bson::Document {
        let mut out = bson::Document::new();
        for (key, value) in doc.iter() {
            if let Some(def) = self.fields.get(key) {
                out.insert(key.clone(), strip_value(def, value));
            }
        }
        out
    }

    /// Fills declared defaults for absent top-level fields.
    pub fn apply_defaults(&self, doc: &mut bson::Document) {
        for (name, def) in &self.fields {
            if !doc.contains_key(name) {
                if let Some(default) = def.default_value() {
                    doc.insert(name.clone(), default);
                }
            }
        }
    }

    /// Validates all fields of a whole document, returning the normalized
    /// copy. `_id` passes through untouched.
    pub fn validate_document(&self, doc: &bson::Document) -> StoreResult<bson::Document> {
        let mut out = bson::Document::new();
        for (key, value) in doc.iter() {
            if key == "_id" {
                out.insert("_id", value.clone());
                continue;
            }
            let def = self.fields.get(key).ok_or_else(|| {
                StoreError::bad_path(key, "field not declared in definition")
            })?;
            out.insert(key.clone(), def.validate(value, key)?);
        }
        Ok(out)
    }
}

fn strip_value(def: &Definition, value: &Bson) -> Bson {
    match (def, value) {
        (Definition::Object { fields }, Bson::Document(doc)) => {
            let mut out = bson::Document::new();
            for (key, v) in doc.iter() {
                if let Some(field) = fields.get(key) {
                    out.insert(key.clone(), strip_value(field, v));
                }
            }
            Bson::Document(out)
        }
        (Definition::Map { value: value_def }, Bson::Document(doc)) => {
            let mut out = bson::Document::new();
            for (key, v) in doc.iter() {
                out.insert(key.clone(), strip_value(value_def, v));
            }
            Bson::Document(out)
        }
        (Definition::Array { element, .. }, Bson::Array(items)) => {
            Bson::Array(items.iter().map(|v| strip_value(element, v)).collect())
        }
        _ => value.clone(),
    }
}

enum Holder<'a, 'b> {
    Root(&'b bson::Document),
    Value(&'a Bson),
    Missing,
}

impl<'a, 'b> Holder<'a, 'b>
where
    'b: 'a,
{
    fn as_document(&self) -> Option<&'a bson::Document> {
        match self {
            Holder::Root(doc) => Some(doc),
            Holder::Value(Bson::Document(doc)) => Some(doc),
            _ => None,
        }
    }

    fn as_array(&self) -> Option<&'a Vec<Bson>> {
        match self {
            Holder::Value(Bson::Array(items)) => Some(items),
            _ => None,
        }
    }

    fn find_by_id(&self, id_key: &str, id: &Bson) -> Option<usize> {
        self.as_array()?.iter().position(|elem| {
            let Some(doc) = elem.as_document() else { return false };
            // Elements carrying an `_id` answer to it as well as the
            // declared identity key.
            doc.get(id_key)
                .or_else(|| doc.get("_id"))
                .is_some_and(|v| values_equal(v, id))
        })
    }
}

fn descend<'a, 'b: 'a>(
    holder: Holder<'a, 'b>,
    parent_def: Option<&Definition>,
    step: &PathStep,
) -> Option<&'a Bson> {
    match step {
        PathStep::Field(name) => holder.as_document()?.get(name),
        PathStep::Index(idx) => holder.as_array()?.get(*idx),
        PathStep::IdLookup(id) => {
            let id_key = parent_def.and_then(|d| d.id_key()).unwrap_or("id");
            let idx = holder.find_by_id(id_key, id)?;
            holder.as_array()?.get(idx)
        }
        PathStep::Lookup(v) => match parent_def {
            Some(Definition::Array { id_key, .. }) => {
                if let Some(idx) = holder.find_by_id(id_key, v) {
                    holder.as_array()?.get(idx)
                } else {
                    holder.as_array()?.get(path::lookup_as_index(v)?)
                }
            }
            _ => holder.as_document()?.get(&path::lookup_as_field(v)?),
        },
    }
}

/// Fluent construction of a [`Schema`].
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    fields: BTreeMap<String, Definition>,
}

impl SchemaBuilder {
    pub fn field(mut self, name: impl Into<String>, definition: Definition) -> Self {
        self.fields.insert(name.into(), definition);
        self
    }

    pub fn build(self) -> Schema {
        Schema { fields: self.fields }
    }
}
