//! sqlmapper - data-mapper persistence for Rust.
//!
//! sqlmapper keeps an in-memory object graph consistent with a relational
//! store:
//!
//! - Entity types are plain structs implementing [`Model`]; all metadata lives
//!   in a [`SchemaRegistry`]
//! - A [`Session`] guarantees one instance per row (identity map)
//! - Changes are written in one dependency-ordered, all-or-nothing flush
//!   (unit of work)
//! - Associations load lazily, by join, by sub-select or batched IN list,
//!   or refuse to load on access
//!
//! # Quick Start
//!
//! ```ignore
//! use sqlmapper::prelude::*;
//!
//! #[derive(Debug)]
//! struct Author {
//!     id: i64,
//!     name: String,
//! }
//!
//! impl Model for Author {
//!     const TABLE_NAME: &'static str = "authors";
//!
//!     fn to_row(&self) -> Vec<(&'static str, Value)> {
//!         vec![("id", self.id.into()), ("name", self.name.clone().into())]
//!     }
//!
//!     fn from_row(row: &Row) -> Result<Self> {
//!         Ok(Self { id: row.get_named("id")?, name: row.get_named("name")? })
//!     }
//! }
//!
//! async fn example(cx: &Cx, conn: impl Connection) -> Outcome<(), Error> {
//!     let registry = SchemaRegistry::from_path("schema.json")?;
//!     let mut session = Session::new(conn, Arc::new(registry));
//!
//!     let author = session.add(Author { id: 1, name: "A".into() })?;
//!     session.commit(cx).await?;
//!
//!     let again = session.get::<Author>(cx, 1_i64).await?;
//!     assert!(EntityRef::ptr_eq(&author, &again));
//!
//!     let articles = again
//!         .related::<Article>("articles")
//!         .ensure_loaded(cx, &mut session)
//!         .await?;
//!     Outcome::Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - **Explicit I/O**: relationship proxies only touch storage in
//!   `ensure_loaded`
//! - **Minimal writes**: updates carry only the columns that changed
//! - **Structured concurrency**: built on asupersync for cancel-correct
//!   operations; an interrupted flush is always rolled back

pub use sqlmapper_core::{
    ConcurrencyConflictError, ConfigError, ConfigErrorKind, Connection, ConstraintKind,
    ConstraintViolationError, Cx, DetachedInstanceError, Dialect, Error, FromValue,
    IsolationLevel, LazyLoadForbiddenError, Model, NotFoundError, Outcome, QueryError,
    QueryErrorKind, Result, Row, TransactionError, TransactionErrorKind, TransactionHandle,
    Value,
};

pub use sqlmapper_query::{
    Delete, Expr, Insert, Join, JoinType, OrderBy, OrderDirection, Select, Statement, Update,
};

pub use sqlmapper_schema::{
    ColumnDescriptor, ColumnType, EntityDescriptor, ForeignKeyRef, JoinTable, KeyLocation,
    LoadStrategy, OwningSide, RelationshipDescriptor, RelationshipKind, SchemaRegistry,
};

pub use sqlmapper_session::{
    EntityRef, EntityState, FlushResult, IdentityKey, IdentityMap, LinkAction, ManagedEntity,
    N1QueryTracker, N1Stats, PendingCounts, Query, Related, Session, SessionConfig,
    SessionDebugInfo,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use sqlmapper::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // Core traits and types
        Connection,
        Cx,
        // Entities
        EntityRef,
        EntityState,
        Error,
        // Query building
        Expr,
        FlushResult,
        LoadStrategy,
        Model,
        OrderBy,
        Outcome,
        Related,
        Result,
        Row,
        // Schema
        SchemaRegistry,
        // Session
        Session,
        SessionConfig,
        Value,
    };
    pub use std::sync::Arc;
}
