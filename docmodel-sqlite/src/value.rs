//! Value conversion between the canonical tree and SQLite storage.
//!
//! Scalar top-level fields live in typed columns: strings and datetimes as
//! TEXT (datetimes as RFC 3339 with millisecond precision, so lexicographic
//! order is chronological), integers and booleans as INTEGER, floats as
//! REAL. Structured fields are serialized to JSON text and restored through
//! their Definition, which is what brings datetimes nested inside JSON back
//! as datetimes.

use bson::Bson;
use chrono::SecondsFormat;
use rusqlite::types::{Value as SqlValue, ValueRef};

use docmodel_core::convert::{bson_to_json, json_to_bson};
use docmodel_core::error::{StoreError, StoreResult};
use docmodel_core::schema::{Definition, Schema};

pub(crate) fn datetime_to_text(dt: &bson::DateTime) -> String {
    dt.to_chrono().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Converts a canonical value into the parameter bound for a typed column
/// or a comparison against one.
pub(crate) fn scalar_param(value: &Bson) -> StoreResult<SqlValue> {
    match value {
        Bson::Null => Ok(SqlValue::Null),
        Bson::Boolean(b) => Ok(SqlValue::Integer(*b as i64)),
        Bson::Int32(v) => Ok(SqlValue::Integer(*v as i64)),
        Bson::Int64(v) => Ok(SqlValue::Integer(*v)),
        Bson::Double(v) => Ok(SqlValue::Real(*v)),
        Bson::String(s) => Ok(SqlValue::Text(s.clone())),
        Bson::DateTime(dt) => Ok(SqlValue::Text(datetime_to_text(dt))),
        other => Err(StoreError::Serialization(format!(
            "value has no scalar column form: {other}"
        ))),
    }
}

/// Serializes a canonical value as JSON text, the form JSON columns and
/// `json(?)` parameters take.
pub(crate) fn json_param(value: &Bson) -> StoreResult<SqlValue> {
    let text = serde_json::to_string(&bson_to_json(value))?;
    Ok(SqlValue::Text(text))
}

/// The parameter for storing a whole field, picked by its definition.
pub(crate) fn column_param(def: &Definition, value: &Bson) -> StoreResult<SqlValue> {
    match def {
        Definition::Scalar { .. } => scalar_param(value),
        _ => match value {
            Bson::Null => Ok(SqlValue::Null),
            other => json_param(other),
        },
    }
}

/// Restores one column's stored value. `Ok(None)` means SQL NULL, i.e. the
/// field is absent.
pub(crate) fn column_value(def: &Definition, raw: ValueRef<'_>) -> StoreResult<Option<Bson>> {
    use docmodel_core::schema::ScalarType;

    if matches!(raw, ValueRef::Null) {
        return Ok(None);
    }

    let out = match def {
        Definition::Scalar { ty, .. } => match (ty, raw) {
            (ScalarType::String, ValueRef::Text(t)) => Bson::String(text(t)?),
            (ScalarType::Int, ValueRef::Integer(v)) => Bson::Int64(v),
            (ScalarType::Bool, ValueRef::Integer(v)) => Bson::Boolean(v != 0),
            (ScalarType::Float, ValueRef::Real(v)) => Bson::Double(v),
            (ScalarType::Float, ValueRef::Integer(v)) => Bson::Double(v as f64),
            (ScalarType::DateTime, ValueRef::Text(t)) => {
                let text = text(t)?;
                let parsed = chrono::DateTime::parse_from_rfc3339(&text).map_err(|e| {
                    StoreError::Serialization(format!("bad stored datetime `{text}`: {e}"))
                })?;
                Bson::DateTime(bson::DateTime::from_chrono(parsed))
            }
            (ty, raw) => {
                return Err(StoreError::Serialization(format!(
                    "stored value does not fit {}: {raw:?}",
                    ty.name()
                )));
            }
        },
        structured => match raw {
            ValueRef::Text(t) => {
                let parsed: serde_json::Value = serde_json::from_str(&text(t)?)?;
                json_to_bson(structured, &parsed)?
            }
            other => {
                return Err(StoreError::Serialization(format!(
                    "JSON column holds non-text value: {other:?}"
                )));
            }
        },
    };
    Ok(Some(out))
}

/// Materializes a whole row into a document, `_id` first, schema columns in
/// declaration order.
pub(crate) fn row_to_document(schema: &Schema, row: &rusqlite::Row<'_>) -> StoreResult<bson::Document> {
    let mut doc = bson::Document::new();
    let id: String = row
        .get(0)
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    doc.insert("_id", id);

    for (idx, (name, def)) in schema.fields().enumerate() {
        let raw = row
            .get_ref(idx + 1)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        if let Some(value) = column_value(def, raw)? {
            doc.insert(name.to_string(), value);
        }
    }
    Ok(doc)
}

fn text(bytes: &[u8]) -> StoreResult<String> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| StoreError::Serialization(format!("non-UTF-8 text column: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::bson;
    use chrono::TimeZone;

    #[test]
    fn scalar_params_map_to_storage_classes() {
        assert_eq!(scalar_param(&bson!(true)).unwrap(), SqlValue::Integer(1));
        assert_eq!(scalar_param(&bson!(3_i32)).unwrap(), SqlValue::Integer(3));
        assert_eq!(scalar_param(&bson!(2.5)).unwrap(), SqlValue::Real(2.5));
        assert_eq!(
            scalar_param(&bson!("x")).unwrap(),
            SqlValue::Text("x".to_string())
        );
    }

    #[test]
    fn datetime_text_is_utc_with_millis() {
        let instant = chrono::Utc.with_ymd_and_hms(2024, 5, 17, 12, 30, 45).unwrap();
        let dt = bson::DateTime::from_chrono(instant);
        assert_eq!(datetime_to_text(&dt), "2024-05-17T12:30:45.000Z");
    }

    #[test]
    fn structured_values_serialize_as_json_text() {
        let param = json_param(&bson!({ "a": [1, 2] })).unwrap();
        assert_eq!(param, SqlValue::Text(r#"{"a":[1,2]}"#.to_string()));
    }
}
