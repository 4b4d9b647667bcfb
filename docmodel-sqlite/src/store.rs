//! SQLite storage backend.
//!
//! Each collection maps to one table: `_id TEXT PRIMARY KEY`, a typed column
//! per scalar top-level field, and a TEXT column of JSON per structured
//! field. All statements are parameterized; filters, updates, and pipelines
//! arrive pre-parsed and compile through the where-clause, update, and
//! aggregation compilers in this crate.

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::ToSql;

use docmodel_core::backend::{project_document, FindOptions, StorageBackend};
use docmodel_core::error::{StoreError, StoreResult};
use docmodel_core::filter::FilterExpr;
use docmodel_core::ops::AtomicOp;
use docmodel_core::pipeline::Pipeline;
use docmodel_core::schema::{ColumnKind, Schema};

use crate::aggregate;
use crate::update;
use crate::value::{column_param, row_to_document};
use crate::where_clause::{self, field_expr, quote_ident, SqlWriter};

type DbPool = Pool<SqliteConnectionManager>;
type DbConn = PooledConnection<SqliteConnectionManager>;

/// Relational backend over SQLite with JSON-column emulation for structured
/// fields.
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    /// Opens (or creates) a database file.
    pub fn open(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let store = Self { pool };
        store.init()?;
        Ok(store)
    }

    /// An in-memory database, one connection so every query sees the same
    /// data. Intended for tests.
    pub fn in_memory() -> StoreResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let store = Self { pool };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        let _: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(())
    }

    fn conn(&self) -> StoreResult<DbConn> {
        self.pool
            .get()
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    fn select_columns(schema: &Schema) -> String {
        std::iter::once(quote_ident("_id"))
            .chain(schema.fields().map(|(name, _)| quote_ident(name)))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn map_sql_err(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(code, message)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Constraint(message.clone().unwrap_or_else(|| code.to_string()))
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

fn to_sql_params(params: &[SqlValue]) -> Vec<&dyn ToSql> {
    params.iter().map(|p| p as &dyn ToSql).collect()
}

#[async_trait]
impl StorageBackend for SqliteStore {
    async fn register(&self, collection: &str, schema: &Schema) -> StoreResult<()> {
        let mut columns = vec![format!("{} TEXT PRIMARY KEY", quote_ident("_id"))];
        for (name, kind) in schema.columns() {
            let sql_type = match kind {
                ColumnKind::Text | ColumnKind::Json => "TEXT",
                ColumnKind::Integer => "INTEGER",
                ColumnKind::Real => "REAL",
            };
            columns.push(format!("{} {sql_type}", quote_ident(name)));
        }
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(collection),
            columns.join(", ")
        );
        tracing::debug!(collection, %sql, "registering table");
        self.conn()?.execute(&sql, []).map_err(map_sql_err)?;
        Ok(())
    }

    async fn find(
        &self,
        collection: &str,
        schema: &Schema,
        filter: &FilterExpr,
        options: &FindOptions,
    ) -> StoreResult<Vec<bson::Document>> {
        let mut w = SqlWriter::default();
        let mut sql = format!(
            "SELECT {} FROM {}",
            Self::select_columns(schema),
            quote_ident(collection)
        );
        if let Some(clause) = where_clause::compile(schema, filter, &mut w)? {
            sql.push_str(&format!(" WHERE {clause}"));
        }
        if !options.sort.is_empty() {
            let mut keys = Vec::with_capacity(options.sort.len());
            for spec in &options.sort {
                let expr = field_expr(schema, &spec.field, &mut w)?;
                keys.push(format!("{expr} {}", spec.direction));
            }
            sql.push_str(&format!(" ORDER BY {}", keys.join(", ")));
        }
        match (options.limit, options.skip) {
            (Some(limit), Some(skip)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {skip}")),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            (None, Some(skip)) => sql.push_str(&format!(" LIMIT -1 OFFSET {skip}")),
            (None, None) => {}
        }

        let params = w.into_params();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql).map_err(map_sql_err)?;
        let mut rows = stmt
            .query(&to_sql_params(&params)[..])
            .map_err(map_sql_err)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(map_sql_err)? {
            let doc = row_to_document(schema, row)?;
            if options.projection.is_empty() {
                out.push(doc);
            } else {
                out.push(project_document(&doc, &options.projection));
            }
        }
        Ok(out)
    }

    async fn count(
        &self,
        collection: &str,
        schema: &Schema,
        filter: &FilterExpr,
    ) -> StoreResult<u64> {
        let mut w = SqlWriter::default();
        let mut sql = format!("SELECT COUNT(*) FROM {}", quote_ident(collection));
        if let Some(clause) = where_clause::compile(schema, filter, &mut w)? {
            sql.push_str(&format!(" WHERE {clause}"));
        }
        let params = w.into_params();
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row(&sql, &to_sql_params(&params)[..], |row| row.get(0))
            .map_err(map_sql_err)?;
        Ok(count as u64)
    }

    async fn aggregate(
        &self,
        collection: &str,
        schema: &Schema,
        pipeline: &Pipeline,
    ) -> StoreResult<Vec<bson::Document>> {
        let compiled = aggregate::compile(schema, collection, pipeline)?;
        tracing::debug!(collection, sql = %compiled.sql, "running pipeline");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&compiled.sql).map_err(map_sql_err)?;
        let mut rows = stmt
            .query(&to_sql_params(&compiled.params)[..])
            .map_err(map_sql_err)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(map_sql_err)? {
            if compiled.raw_rows {
                out.push(aggregate::raw_row_to_document(row)?);
            } else {
                out.push(row_to_document(schema, row)?);
            }
        }
        Ok(out)
    }

    async fn insert(
        &self,
        collection: &str,
        schema: &Schema,
        document: &bson::Document,
    ) -> StoreResult<()> {
        let id = document
            .get_str("_id")
            .map_err(|_| StoreError::Constraint("insert without a string _id".to_string()))?;

        let mut names = vec![quote_ident("_id")];
        let mut params: Vec<SqlValue> = vec![SqlValue::Text(id.to_string())];
        for (name, def) in schema.fields() {
            names.push(quote_ident(name));
            match document.get(name) {
                Some(value) => params.push(column_param(def, value)?),
                None => params.push(SqlValue::Null),
            }
        }
        let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(collection),
            names.join(", "),
            placeholders.join(", ")
        );

        self.conn()?
            .execute(&sql, &to_sql_params(&params)[..])
            .map_err(map_sql_err)?;
        Ok(())
    }

    async fn update(
        &self,
        collection: &str,
        schema: &Schema,
        filter: &FilterExpr,
        batch: &[AtomicOp],
    ) -> StoreResult<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut w = SqlWriter::default();
        let assignments = update::compile(schema, batch, &mut w)?;
        let set_sql: Vec<String> = assignments
            .into_iter()
            .map(|(column, expr)| format!("{column} = {expr}"))
            .collect();
        let mut sql = format!(
            "UPDATE {} SET {}",
            quote_ident(collection),
            set_sql.join(", ")
        );
        if let Some(clause) = where_clause::compile(schema, filter, &mut w)? {
            sql.push_str(&format!(" WHERE {clause}"));
        }
        tracing::debug!(collection, %sql, "running update");

        let params = w.into_params();
        let touched = self
            .conn()?
            .execute(&sql, &to_sql_params(&params)[..])
            .map_err(map_sql_err)?;
        Ok(touched as u64)
    }

    async fn delete(
        &self,
        collection: &str,
        schema: &Schema,
        filter: &FilterExpr,
    ) -> StoreResult<u64> {
        let mut w = SqlWriter::default();
        let mut sql = format!("DELETE FROM {}", quote_ident(collection));
        if let Some(clause) = where_clause::compile(schema, filter, &mut w)? {
            sql.push_str(&format!(" WHERE {clause}"));
        }
        let params = w.into_params();
        let removed = self
            .conn()?
            .execute(&sql, &to_sql_params(&params)[..])
            .map_err(map_sql_err)?;
        Ok(removed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{bson, doc, Bson};
    use docmodel_core::backend::SortSpec;
    use docmodel_core::ops::OpKind;
    use docmodel_core::schema::Definition;

    fn schema() -> Schema {
        Schema::builder()
            .field("name", Definition::string())
            .field("level", Definition::int())
            .field("tags", Definition::array(Definition::string()))
            .field(
                "profile",
                Definition::object([
                    ("age", Definition::int()),
                    ("joined", Definition::datetime()),
                ]),
            )
            .build()
    }

    async fn seeded() -> SqliteStore {
        let store = SqliteStore::in_memory().unwrap();
        let schema = schema();
        store.register("guilds", &schema).await.unwrap();
        for (id, name, level, age) in
            [("a", "alpha", 3_i64, 20_i64), ("b", "beta", 7, 30), ("c", "gamma", 5, 25)]
        {
            store
                .insert(
                    "guilds",
                    &schema,
                    &doc! {
                        "_id": id,
                        "name": name,
                        "level": level,
                        "tags": ["seed"],
                        "profile": { "age": age },
                    },
                )
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn rows_round_trip_with_declared_widths() {
        let store = seeded().await;
        let schema = schema();
        let rows = store
            .find("guilds", &schema, &FilterExpr::by_id("a"), &FindOptions::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("level").unwrap(), &Bson::Int64(3));
        assert_eq!(rows[0].get("tags").unwrap(), &bson!(["seed"]));
        assert_eq!(rows[0].get("profile").unwrap(), &bson!({ "age": 20_i64 }));
    }

    #[tokio::test]
    async fn json_filters_reach_nested_fields() {
        let store = seeded().await;
        let schema = schema();
        let filter =
            FilterExpr::parse(&schema, &doc! { "profile.age": { "$gte": 25 } }).unwrap();
        let options = FindOptions {
            sort: vec![SortSpec::asc("profile.age")],
            ..FindOptions::default()
        };
        let rows = store.find("guilds", &schema, &filter, &options).await.unwrap();
        let names: Vec<&str> = rows.iter().map(|r| r.get_str("name").unwrap()).collect();
        assert_eq!(names, ["gamma", "beta"]);
    }

    #[tokio::test]
    async fn duplicate_id_maps_to_constraint_error() {
        let store = seeded().await;
        let schema = schema();
        let err = store
            .insert("guilds", &schema, &doc! { "_id": "a", "name": "again" })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[tokio::test]
    async fn update_batch_rewrites_scalar_and_json_columns() {
        let store = seeded().await;
        let schema = schema();
        let batch = vec![
            AtomicOp::new("level", OpKind::Inc, bson!(10_i64)),
            AtomicOp::new("profile.age", OpKind::Set, bson!(40_i64)),
            AtomicOp::new("tags", OpKind::Push, bson!("updated")),
            AtomicOp::new("tags", OpKind::Pull, bson!("seed")),
        ];
        let touched = store
            .update("guilds", &schema, &FilterExpr::by_id("b"), &batch)
            .await
            .unwrap();
        assert_eq!(touched, 1);

        let rows = store
            .find("guilds", &schema, &FilterExpr::by_id("b"), &FindOptions::default())
            .await
            .unwrap();
        assert_eq!(rows[0].get("level").unwrap(), &Bson::Int64(17));
        assert_eq!(rows[0].get("tags").unwrap(), &bson!(["updated"]));
        assert_eq!(
            rows[0].get("profile").unwrap(),
            &bson!({ "age": 40_i64 })
        );
    }

    #[tokio::test]
    async fn datetime_round_trips_through_text_column() {
        let store = SqliteStore::in_memory().unwrap();
        let schema = schema();
        store.register("guilds", &schema).await.unwrap();

        let joined = bson::DateTime::from_chrono(
            chrono::DateTime::parse_from_rfc3339("2024-05-17T12:30:45.000Z").unwrap(),
        );
        store
            .insert(
                "guilds",
                &schema,
                &doc! { "_id": "d", "name": "delta", "profile": { "joined": joined } },
            )
            .await
            .unwrap();

        let rows = store
            .find("guilds", &schema, &FilterExpr::by_id("d"), &FindOptions::default())
            .await
            .unwrap();
        assert_eq!(
            rows[0].get("profile").unwrap(),
            &bson!({ "joined": Bson::DateTime(joined) })
        );
    }

    #[tokio::test]
    async fn aggregate_groups_with_sql_functions() {
        let store = seeded().await;
        let schema = schema();
        let pipeline = Pipeline::parse(
            &schema,
            &[
                doc! { "$match": { "level": { "$gte": 4 } } },
                doc! { "$group": { "_id": null, "total": { "$sum": "$level" } } },
            ],
        )
        .unwrap();
        let out = store.aggregate("guilds", &schema, &pipeline).await.unwrap();
        assert_eq!(out, vec![doc! { "_id": Bson::Null, "total": 12_i64 }]);
    }

    #[tokio::test]
    async fn delete_reports_removed_count() {
        let store = seeded().await;
        let schema = schema();
        let filter = FilterExpr::parse(&schema, &doc! { "level": { "$lt": 6 } }).unwrap();
        assert_eq!(store.delete("guilds", &schema, &filter).await.unwrap(), 2);
        assert_eq!(
            store.count("guilds", &schema, &FilterExpr::all()).await.unwrap(),
            1
        );
    }
}
