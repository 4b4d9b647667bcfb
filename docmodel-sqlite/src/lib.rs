//! SQLite storage backend for docmodel.
//!
//! Emulates a document store over a relational engine: one table per
//! collection with typed columns for scalar top-level fields and JSON text
//! columns for structured fields. Filters, update batches, and aggregation
//! pipelines compile to parameterized SQL, leaning on SQLite's `json_*`
//! functions for anything below the top level.
//!
//! A model bound to [`SqliteStore`] is observably interchangeable with one
//! bound to the in-memory document store: same validation, same operation
//! semantics, same numeric behavior in aggregations.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use bson::doc;
//! use docmodel_core::{Definition, Model, Schema};
//! use docmodel_sqlite::SqliteStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = Arc::new(SqliteStore::open("data/app.db".as_ref())?);
//!     let schema = Schema::builder()
//!         .field("name", Definition::string())
//!         .build();
//!     let guilds = Model::bind(backend, "guilds", schema).await?;
//!     guilds.create(doc! { "name": "alpha" }).await?;
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmodel_sqlite;

pub mod store;

mod aggregate;
mod update;
mod value;
mod where_clause;

pub use store::SqliteStore;
