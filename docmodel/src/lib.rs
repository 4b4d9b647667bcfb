//! Schema-driven document modeling over interchangeable storage backends.
//!
//! This crate is the primary entry point for users of the docmodel project.
//! It re-exports the core model layer and provides convenient access to the
//! storage backends.
//!
//! # Features
//!
//! - **Declarative schemas** - Field-type trees validate every write before it queues
//! - **Live documents** - One shared instance per stored document, with a queue of
//!   atomic operations flushed on save
//! - **Two backends, one behavior** - An in-memory document store and a SQLite
//!   emulation that compiles filters, updates, and pipelines to parameterized SQL
//! - **Aggregation** - `$match`/`$group`/`$project`/`$sort`/`$skip`/`$limit`
//!   pipelines with identical numeric semantics on both backends
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use bson::doc;
//! use docmodel::{prelude::*, memory::MemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = Arc::new(MemoryStore::new());
//!
//!     let schema = Schema::builder()
//!         .field("name", Definition::string())
//!         .field("level", Definition::int().with_default(1))
//!         .field(
//!             "roles",
//!             Definition::array(Definition::object([
//!                 ("id", Definition::string()),
//!                 ("title", Definition::string()),
//!             ])),
//!         )
//!         .build();
//!
//!     let guilds = Model::bind(backend, "guilds", schema).await?;
//!
//!     let guild = guilds.create(doc! { "name": "alpha" }).await?;
//!     guild.prop("level")?.inc(2)?;
//!     guild.prop("roles")?.push(doc! { "id": "r1", "title": "admin" })?;
//!     guild.save().await?;
//!
//!     let found = guilds.find_one_by_object_id(guild.id()).await?;
//!     assert!(std::sync::Arc::ptr_eq(&guild, &found.unwrap()));
//!     Ok(())
//! }
//! ```
//!
//! # Backends
//!
//! - [`memory`] - In-memory document store for development and testing
//! - [`sqlite`] - SQLite relational emulation (requires the `sqlite` feature)

pub mod prelude;

pub use docmodel_core::{
    backend, convert, cursor, document, error, filter, model, ops, path, pipeline, query, schema,
    value,
};

// Re-export BSON types for convenience
pub use bson;

/// In-memory storage backend.
pub mod memory {
    pub use docmodel_memory::MemoryStore;
}

/// SQLite storage backend.
///
/// This module is only available when the `sqlite` feature is enabled.
#[cfg(feature = "sqlite")]
pub mod sqlite {
    pub use docmodel_sqlite::SqliteStore;
}
