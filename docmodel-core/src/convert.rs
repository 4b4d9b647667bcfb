//! Bridging between the canonical value tree and plain JSON.
//!
//! JSON has no datetime, so the conversion is definition-driven: datetimes
//! serialize as RFC 3339 strings with millisecond precision and are restored
//! by consulting the field's [`Definition`] on the way back in.

use bson::Bson;
use chrono::SecondsFormat;
use serde_json::Value;

use crate::error::{StoreError, StoreResult};
use crate::schema::{Definition, ScalarType};

/// Renders a canonical value as plain JSON.
pub fn bson_to_json(value: &Bson) -> Value {
    match value {
        Bson::Null => Value::Null,
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Int32(v) => Value::from(*v),
        Bson::Int64(v) => Value::from(*v),
        Bson::Double(v) => serde_json::Number::from_f64(*v)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Bson::String(s) => Value::String(s.clone()),
        Bson::DateTime(dt) => {
            Value::String(dt.to_chrono().to_rfc3339_opts(SecondsFormat::Millis, true))
        }
        Bson::Array(items) => Value::Array(items.iter().map(bson_to_json).collect()),
        Bson::Document(doc) => Value::Object(
            doc.iter()
                .map(|(k, v)| (k.clone(), bson_to_json(v)))
                .collect(),
        ),
        _ => Value::Null,
    }
}

/// Restores a canonical value from JSON under the shape its definition
/// declares.
pub fn json_to_bson(def: &Definition, value: &Value) -> StoreResult<Bson> {
    let mismatch = |expected: &str| {
        StoreError::Serialization(format!("expected {expected}, found {value}"))
    };

    if matches!(value, Value::Null) {
        return Ok(Bson::Null);
    }

    match def {
        Definition::Scalar { ty, .. } => match (ty, value) {
            (ScalarType::String, Value::String(s)) => Ok(Bson::String(s.clone())),
            (ScalarType::Int, Value::Number(n)) => n
                .as_i64()
                .map(Bson::Int64)
                .ok_or_else(|| mismatch("integer")),
            (ScalarType::Float, Value::Number(n)) => n
                .as_f64()
                .map(Bson::Double)
                .ok_or_else(|| mismatch("float")),
            (ScalarType::Bool, Value::Bool(b)) => Ok(Bson::Boolean(*b)),
            (ScalarType::DateTime, Value::String(s)) => {
                let parsed = chrono::DateTime::parse_from_rfc3339(s)
                    .map_err(|e| StoreError::Serialization(format!("bad datetime `{s}`: {e}")))?;
                Ok(Bson::DateTime(bson::DateTime::from_chrono(parsed)))
            }
            _ => Err(mismatch(ty.name())),
        },
        Definition::Array { element, .. } => match value {
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(json_to_bson(element, item)?);
                }
                Ok(Bson::Array(out))
            }
            _ => Err(mismatch("array")),
        },
        Definition::Object { fields } => match value {
            Value::Object(map) => {
                let mut out = bson::Document::new();
                for (key, item) in map {
                    let field = fields
                        .get(key)
                        .ok_or_else(|| StoreError::Serialization(format!("undeclared field `{key}`")))?;
                    out.insert(key.clone(), json_to_bson(field, item)?);
                }
                Ok(Bson::Document(out))
            }
            _ => Err(mismatch("object")),
        },
        Definition::Map { value: value_def } => match value {
            Value::Object(map) => {
                let mut out = bson::Document::new();
                for (key, item) in map {
                    out.insert(key.clone(), json_to_bson(value_def, item)?);
                }
                Ok(Bson::Document(out))
            }
            _ => Err(mismatch("map")),
        },
    }
}
