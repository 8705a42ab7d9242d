//! Schema registry for sqlmapper.
//!
//! This crate provides:
//! - Entity, column and relationship descriptors with builder methods
//! - A JSON schema document format
//! - [`SchemaRegistry`], which validates descriptors once and serves them
//!   read-only to every session
//!
//! # Example
//!
//! ```ignore
//! use sqlmapper_schema::*;
//!
//! let mut registry = SchemaRegistry::new();
//! registry.register_all(vec![
//!     EntityDescriptor::new("authors")
//!         .column(ColumnDescriptor::new("id", ColumnType::BigInt).primary_key())
//!         .column(ColumnDescriptor::new("name", ColumnType::Text))
//!         .relationship(
//!             RelationshipDescriptor::one_to_many("articles", "articles", "author_id")
//!                 .strategy(LoadStrategy::BatchedIn),
//!         ),
//!     EntityDescriptor::new("articles")
//!         .column(ColumnDescriptor::new("id", ColumnType::BigInt).primary_key())
//!         .column(ColumnDescriptor::new("author_id", ColumnType::BigInt))
//!         .relationship(RelationshipDescriptor::many_to_one("author", "authors", "author_id")),
//! ])?;
//! ```

mod config;
pub mod descriptor;
pub mod registry;

pub use descriptor::{
    ColumnDescriptor, ColumnType, EntityDescriptor, JoinTable, KeyLocation, LoadStrategy,
    OwningSide, RelationshipDescriptor, RelationshipKind,
};
pub use registry::{ForeignKeyRef, SchemaRegistry};
