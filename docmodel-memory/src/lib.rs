//! In-memory storage backend for docmodel.
//!
//! A thread-safe, scan-based implementation of the `StorageBackend` trait,
//! intended for development, testing, and small working sets. It shares the
//! atomic-operation and filter semantics of the core crate, so a model bound
//! to this backend behaves exactly like one bound to a persistent store.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use bson::doc;
//! use docmodel_core::{Definition, Model, Schema};
//! use docmodel_memory::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = Arc::new(MemoryStore::new());
//!     let schema = Schema::builder()
//!         .field("name", Definition::string())
//!         .build();
//!     let guilds = Model::bind(backend, "guilds", schema).await?;
//!     guilds.create(doc! { "name": "alpha" }).await?;
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmodel_memory;

pub mod store;

mod aggregate;
mod evaluator;

pub use store::MemoryStore;
