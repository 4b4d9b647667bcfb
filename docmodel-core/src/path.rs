//! Path grammar for addressing values inside a document.
//!
//! A path is a dot-separated string resolved once per call into a sequence of
//! explicit steps instead of being re-parsed repeatedly. Segments starting
//! with `$` are template placeholders substituted from caller-supplied data;
//! a substituted value is tried as an identity match before being treated as
//! a positional index, so one expression can address "the Nth entry" or "the
//! entry with this id" interchangeably.

use std::fmt;

use bson::Bson;

use crate::error::{StoreError, StoreResult};

/// One resolved step of a path.
#[derive(Debug, Clone, PartialEq)]
pub enum PathStep {
    /// Descend into a named field.
    Field(String),
    /// Descend into an array element by position.
    Index(usize),
    /// Descend into an array element by its identity key. Linear scan; this
    /// is a documented O(n) contract for small embedded lists, not a hidden
    /// index.
    IdLookup(Bson),
    /// A substituted `$label` value: tried as an identity match first, then
    /// as a positional index.
    Lookup(Bson),
}

impl fmt::Display for PathStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathStep::Field(name) => write!(f, "{name}"),
            PathStep::Index(i) => write!(f, "{i}"),
            PathStep::IdLookup(id) => write!(f, "[id={id}]"),
            PathStep::Lookup(v) => write!(f, "[{v}]"),
        }
    }
}

/// A fully concrete location inside a document: fields and positions only,
/// every lookup already resolved against the live snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConcreteStep {
    Field(String),
    Index(usize),
}

/// Renders a concrete path in the canonical dotted form (`a.0.b`) used by
/// queued atomic operations.
pub fn concrete_to_string(steps: &[ConcreteStep]) -> String {
    let mut out = String::new();
    for (i, step) in steps.iter().enumerate() {
        if i > 0 {
            out.push('.');
        }
        match step {
            ConcreteStep::Field(name) => out.push_str(name),
            ConcreteStep::Index(idx) => out.push_str(&idx.to_string()),
        }
    }
    out
}

/// Splits a canonical dotted path back into concrete steps. Numeric segments
/// become positions.
pub fn concrete_from_string(path: &str) -> Vec<ConcreteStep> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .map(|seg| match seg.parse::<usize>() {
            Ok(idx) => ConcreteStep::Index(idx),
            Err(_) => ConcreteStep::Field(seg.to_string()),
        })
        .collect()
}

/// Parses a path without template data. `$label` segments are rejected.
pub fn parse(path: &str) -> StoreResult<Vec<PathStep>> {
    parse_with(path, None)
}

/// Parses a path, substituting `$label` segments from `data`.
pub fn parse_with(path: &str, data: Option<&bson::Document>) -> StoreResult<Vec<PathStep>> {
    let mut steps = Vec::new();

    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }

        if let Some(label) = segment.strip_prefix('$') {
            let data = data.ok_or_else(|| {
                StoreError::bad_path(path, format!("placeholder `${label}` used without data"))
            })?;
            let value = data.get(label).ok_or_else(|| {
                StoreError::bad_path(path, format!("no value supplied for placeholder `${label}`"))
            })?;
            steps.push(PathStep::Lookup(value.clone()));
        } else if let Ok(index) = segment.parse::<usize>() {
            steps.push(PathStep::Index(index));
        } else {
            steps.push(PathStep::Field(segment.to_string()));
        }
    }

    Ok(steps)
}

/// Joins a selection prefix with a relative path.
pub fn join(prefix: &[PathStep], rest: Vec<PathStep>) -> Vec<PathStep> {
    let mut steps = prefix.to_vec();
    steps.extend(rest);
    steps
}

/// Renders a step sequence for error messages.
pub fn display(steps: &[PathStep]) -> String {
    steps
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

/// Interprets a lookup value as a positional index, the fallback when no
/// identity match is found.
pub fn lookup_as_index(value: &Bson) -> Option<usize> {
    match value {
        Bson::Int32(v) if *v >= 0 => Some(*v as usize),
        Bson::Int64(v) if *v >= 0 => Some(*v as usize),
        Bson::String(s) => s.parse::<usize>().ok(),
        _ => None,
    }
}

/// Interprets a lookup value as a field name, for descents into objects and
/// maps.
pub fn lookup_as_field(value: &Bson) -> Option<String> {
    match value {
        Bson::String(s) => Some(s.clone()),
        Bson::Int32(v) => Some(v.to_string()),
        Bson::Int64(v) => Some(v.to_string()),
        _ => None,
    }
}

/// Reads the value at a concrete path, `None` if any step is absent.
pub fn get_concrete<'a>(root: &'a bson::Document, steps: &[ConcreteStep]) -> Option<&'a Bson> {
    let (first, rest) = steps.split_first()?;
    let mut current = match first {
        ConcreteStep::Field(name) => root.get(name)?,
        ConcreteStep::Index(_) => return None,
    };
    for step in rest {
        current = match step {
            ConcreteStep::Field(name) => current.as_document()?.get(name)?,
            ConcreteStep::Index(idx) => current.as_array()?.get(*idx)?,
        };
    }
    Some(current)
}

/// Mutable variant of [`get_concrete`].
pub fn get_concrete_mut<'a>(
    root: &'a mut bson::Document,
    steps: &[ConcreteStep],
) -> Option<&'a mut Bson> {
    let (first, rest) = steps.split_first()?;
    let mut current = match first {
        ConcreteStep::Field(name) => root.get_mut(name)?,
        ConcreteStep::Index(_) => return None,
    };
    for step in rest {
        current = match step {
            ConcreteStep::Field(name) => current.as_document_mut()?.get_mut(name)?,
            ConcreteStep::Index(idx) => current.as_array_mut()?.get_mut(*idx)?,
        };
    }
    Some(current)
}

/// Writes `value` at a concrete path. Intermediate containers must already
/// exist; an index one past the end appends, a larger index pads the array
/// with nulls first.
pub fn set_concrete(
    root: &mut bson::Document,
    steps: &[ConcreteStep],
    value: Bson,
) -> StoreResult<()> {
    let (last, parents) = steps
        .split_last()
        .ok_or_else(|| StoreError::bad_path("", "empty path"))?;

    if parents.is_empty() {
        match last {
            ConcreteStep::Field(name) => {
                root.insert(name.clone(), value);
                Ok(())
            }
            ConcreteStep::Index(_) => Err(StoreError::bad_path(
                concrete_to_string(steps),
                "document root is addressed by field name",
            )),
        }
    } else {
        let parent = get_concrete_mut(root, parents).ok_or_else(|| {
            StoreError::bad_path(concrete_to_string(steps), "missing intermediate container")
        })?;
        match (last, parent) {
            (ConcreteStep::Field(name), Bson::Document(doc)) => {
                doc.insert(name.clone(), value);
                Ok(())
            }
            (ConcreteStep::Index(idx), Bson::Array(items)) => {
                if *idx < items.len() {
                    items[*idx] = value;
                } else {
                    while items.len() < *idx {
                        items.push(Bson::Null);
                    }
                    items.push(value);
                }
                Ok(())
            }
            _ => Err(StoreError::bad_path(
                concrete_to_string(steps),
                "container shape does not fit the final step",
            )),
        }
    }
}

/// Removes and returns the value at a concrete path. A field is deleted from
/// its document, an element is spliced out of its array.
pub fn remove_concrete(root: &mut bson::Document, steps: &[ConcreteStep]) -> Option<Bson> {
    let (last, parents) = steps.split_last()?;

    if parents.is_empty() {
        match last {
            ConcreteStep::Field(name) => root.remove(name),
            ConcreteStep::Index(_) => None,
        }
    } else {
        match (last, get_concrete_mut(root, parents)?) {
            (ConcreteStep::Field(name), Bson::Document(doc)) => doc.remove(name),
            (ConcreteStep::Index(idx), Bson::Array(items)) if *idx < items.len() => {
                Some(items.remove(*idx))
            }
            _ => None,
        }
    }
}
