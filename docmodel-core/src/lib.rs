//! Schema-driven document modeling over interchangeable storage backends.
//!
//! This crate is the core of the docmodel project and provides:
//!
//! - **Schemas** ([`schema`]) - Declarative field-type trees that validate writes and drive path resolution
//! - **Models** ([`model`]) - Collection handles owning the per-`_id` identity cache
//! - **Documents** ([`document`]) - Live instances with a snapshot and a queue of pending atomic operations
//! - **Path selections** ([`query`]) - Dotted-path navigation with positional and identity lookups
//! - **Filters** ([`filter`]) - Filter documents parsed once into a backend-agnostic conjunction
//! - **Pipelines** ([`pipeline`]) - Aggregation stages parsed into canonical clause slots
//! - **Backend contract** ([`backend`]) - The async trait every storage backend implements
//! - **Error handling** ([`error`]) - Error and result types shared across the project
//!
//! # Example
//!
//! ```ignore
//! use docmodel_core::prelude::*;
//! use bson::doc;
//!
//! let schema = Schema::builder()
//!     .field("name", Definition::string())
//!     .field("level", Definition::int().with_default(1))
//!     .build();
//!
//! let model = Model::bind(backend, "guilds", schema).await?;
//! let guild = model.create(doc! { "name": "alpha" }).await?;
//! guild.prop("level")?.inc(2)?;
//! guild.save().await?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmodel_core;

pub mod backend;
pub mod convert;
pub mod cursor;
pub mod document;
pub mod error;
pub mod filter;
pub mod model;
pub mod ops;
pub mod path;
pub mod pipeline;
pub mod query;
pub mod schema;
pub mod value;

pub use backend::{DynBackend, FindOptions, SortDirection, SortSpec, StorageBackend};
pub use cursor::Cursor;
pub use document::Document;
pub use error::{StoreError, StoreResult};
pub use filter::{FieldFilter, FilterExpr, FilterOp};
pub use model::Model;
pub use ops::{AtomicOp, OpKind};
pub use pipeline::{Accumulator, GroupClause, Pipeline, ValueExpr};
pub use query::Query;
pub use schema::{ColumnKind, Definition, ScalarType, Schema, SchemaBuilder};
