//! Core types and traits for sqlmapper.
//!
//! This crate provides the foundational pieces every other sqlmapper crate
//! builds on:
//!
//! - `Value` and `Row` for moving column data
//! - `Model` for mapping structs to rows
//! - `Connection`, the storage driver contract
//! - `Error`, the error taxonomy shared by all crates
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod dialect;
pub mod error;
pub mod model;
pub mod row;
pub mod value;

pub use connection::{Connection, IsolationLevel, TransactionHandle};
pub use dialect::Dialect;
pub use error::{
    ConcurrencyConflictError, ConfigError, ConfigErrorKind, ConnectionError, ConnectionErrorKind,
    ConstraintKind, ConstraintViolationError, DetachedInstanceError, Error,
    LazyLoadForbiddenError, NotFoundError, QueryError, QueryErrorKind, Result, TransactionError,
    TransactionErrorKind, TypeError,
};
pub use model::Model;
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
