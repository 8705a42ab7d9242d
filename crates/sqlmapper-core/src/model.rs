//! Model trait for mapping plain structs to table rows.
//!
//! A `Model` only knows how to turn itself into column values and back.
//! Table layout, keys and relationships live in the schema registry, and
//! every persistence operation goes through a session.

use crate::Result;
use crate::row::Row;
use crate::value::Value;

/// Row mapping for an entity type.
///
/// # Example
///
/// ```ignore
/// struct Author {
///     id: i64,
///     name: String,
/// }
///
/// impl Model for Author {
///     const TABLE_NAME: &'static str = "authors";
///
///     fn to_row(&self) -> Vec<(&'static str, Value)> {
///         vec![("id", self.id.into()), ("name", self.name.clone().into())]
///     }
///
///     fn from_row(row: &Row) -> Result<Self> {
///         Ok(Self {
///             id: row.get_named("id")?,
///             name: row.get_named("name")?,
///         })
///     }
/// }
/// ```
pub trait Model: Sized + Send + Sync + 'static {
    /// Table this type is registered under.
    const TABLE_NAME: &'static str;

    /// Current column values. Every column the registry declares for the
    /// table must be present.
    fn to_row(&self) -> Vec<(&'static str, Value)>;

    /// Build an instance from a result row. Extra columns must be ignored.
    #[allow(clippy::result_large_err)]
    fn from_row(row: &Row) -> Result<Self>;
}
