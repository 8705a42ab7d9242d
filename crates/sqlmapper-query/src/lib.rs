//! Parametrized SQL statement builder for sqlmapper.
//!
//! `sqlmapper-query` turns expressions and entity descriptors into SQL text
//! plus an ordered parameter list. Values are always bound, never spliced
//! into the text; identifiers are quoted for the connection's dialect.
//!
//! - [`Expr`]: WHERE / ON / ORDER BY expressions
//! - [`Select`], [`Insert`], [`Update`], [`Delete`]: statement builders
//! - [`entity`]: statements derived from an `EntityDescriptor`
//! - [`Statement`]: runs any of the above through a `Connection`
//!
//! # Example
//!
//! ```ignore
//! let (sql, params) = Select::from("articles")
//!     .filter(Expr::col("author_id").in_list([1_i64, 2, 3]))
//!     .order_by(OrderBy::asc("id"))
//!     .build(Dialect::Postgres);
//! assert_eq!(
//!     sql,
//!     "SELECT * FROM \"articles\" WHERE \"author_id\" IN ($1, $2, $3) ORDER BY \"id\" ASC"
//! );
//! ```

pub mod builder;
pub mod clause;
pub mod entity;
pub mod expr;
pub mod join;
pub mod select;

pub use builder::{Delete, Insert, Statement, Update};
pub use clause::{OrderBy, OrderDirection, OrderTarget};
pub use expr::{BinaryOp, Expr};
pub use join::{Join, JoinType};
pub use select::{Select, SelectItem, Source};
pub use sqlmapper_core::Dialect;
