//! Statements derived from an [`EntityDescriptor`].
//!
//! Column lists always follow descriptor declaration order, which is also
//! the order of snapshot values kept by the session.

use crate::builder::{Delete, Insert, Update};
use crate::expr::Expr;
use crate::select::{Select, SelectItem};
use sqlmapper_core::Value;
use sqlmapper_schema::EntityDescriptor;

/// Separator between a table alias and a column in joined result rows.
pub const ALIAS_SEPARATOR: &str = "__";

/// Row prefix used for columns selected under `alias`.
pub fn column_prefix(alias: &str) -> String {
    format!("{alias}{ALIAS_SEPARATOR}")
}

/// `pk1 = $n AND pk2 = $m ...` for one entity.
pub fn key_predicate(desc: &EntityDescriptor, key: &[Value]) -> Expr {
    Expr::all(
        desc.primary_key()
            .into_iter()
            .zip(key)
            .map(|(col, value)| Expr::col(col).eq(value.clone())),
    )
    // No key columns: match nothing.
    .unwrap_or_else(|| Expr::col(desc.table()).in_list(Vec::<Expr>::new()))
}

/// `SELECT <all columns> FROM table`.
pub fn select_all(desc: &EntityDescriptor) -> Select {
    Select::from(desc.table()).columns(desc.column_names())
}

/// Select one entity by primary key.
pub fn select_by_key(desc: &EntityDescriptor, key: &[Value]) -> Select {
    select_all(desc).filter(key_predicate(desc, key))
}

/// Select entities whose `column` is one of `values`.
pub fn select_where_in(desc: &EntityDescriptor, column: &str, values: Vec<Value>) -> Select {
    select_all(desc).filter(Expr::col(column).in_list(values))
}

/// Every column of `desc` qualified with `alias` and aliased as
/// `{alias}__{column}`.
pub fn aliased_columns(desc: &EntityDescriptor, alias: &str) -> Vec<SelectItem> {
    let prefix = column_prefix(alias);
    desc.column_names()
        .map(|col| SelectItem {
            expr: Expr::qualified(alias, col),
            alias: Some(format!("{prefix}{col}")),
        })
        .collect()
}

/// INSERT for one entity from values in declaration order.
///
/// With `generated_key`, primary key columns are left to the database and
/// the statement returns the stored row.
pub fn insert(desc: &EntityDescriptor, values: &[Value], generated_key: bool) -> Insert {
    let mut insert = Insert::into(desc.table());
    for (column, value) in desc.columns().iter().zip(values) {
        if generated_key && column.primary_key {
            continue;
        }
        insert = insert.value(column.name.as_str(), value.clone());
    }
    if generated_key {
        insert = insert.returning();
    }
    insert
}

/// Version check carried by UPDATE and DELETE.
#[derive(Debug, Clone, Copy)]
pub struct VersionCheck<'a> {
    pub column: &'a str,
    /// Value the row must still hold.
    pub expected: &'a Value,
}

/// UPDATE of the given columns for one entity.
///
/// `changes` holds `(column, new value)` pairs. With a version check the
/// version column is bumped to `next_version` and guarded by the old value.
pub fn update(
    desc: &EntityDescriptor,
    key: &[Value],
    changes: &[(&str, Value)],
    version: Option<(VersionCheck<'_>, Value)>,
) -> Update {
    let mut update = Update::table(desc.table());
    for (column, value) in changes {
        update = update.set(*column, value.clone());
    }
    update = update.filter(key_predicate(desc, key));
    if let Some((check, next_version)) = version {
        update = update
            .set(check.column, next_version)
            .filter(Expr::col(check.column).eq(check.expected.clone()));
    }
    update
}

/// DELETE of one entity.
pub fn delete(desc: &EntityDescriptor, key: &[Value], version: Option<VersionCheck<'_>>) -> Delete {
    let mut delete = Delete::from(desc.table()).filter(key_predicate(desc, key));
    if let Some(check) = version {
        delete = delete.filter(Expr::col(check.column).eq(check.expected.clone()));
    }
    delete
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlmapper_core::Dialect;
    use sqlmapper_schema::{ColumnDescriptor, ColumnType};

    fn docs() -> EntityDescriptor {
        EntityDescriptor::new("docs")
            .column(ColumnDescriptor::new("id", ColumnType::BigInt).primary_key())
            .column(ColumnDescriptor::new("title", ColumnType::Text))
            .column(ColumnDescriptor::new("version", ColumnType::Integer))
            .version_column("version")
    }

    #[test]
    fn select_by_key_lists_declared_columns() {
        let (sql, params) = select_by_key(&docs(), &[Value::BigInt(7)]).build(Dialect::Postgres);
        assert_eq!(
            sql,
            "SELECT \"id\", \"title\", \"version\" FROM \"docs\" WHERE \"id\" = $1"
        );
        assert_eq!(params, vec![Value::BigInt(7)]);
    }

    #[test]
    fn composite_key_predicate() {
        let desc = EntityDescriptor::new("article_tags")
            .column(ColumnDescriptor::new("article_id", ColumnType::BigInt).primary_key())
            .column(ColumnDescriptor::new("tag_id", ColumnType::BigInt).primary_key());
        let (sql, params) = key_predicate(&desc, &[Value::BigInt(1), Value::BigInt(2)])
            .build(Dialect::Postgres);
        assert_eq!(sql, "\"article_id\" = $1 AND \"tag_id\" = $2");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn insert_with_generated_key_skips_key_and_returns_row() {
        let values = [Value::Null, Value::Text("T".into()), Value::Int(1)];
        let (sql, params) = insert(&docs(), &values, true).build(Dialect::Postgres);
        assert_eq!(
            sql,
            "INSERT INTO \"docs\" (\"title\", \"version\") VALUES ($1, $2) RETURNING *"
        );
        assert_eq!(params.len(), 2);

        let (sql, _) = insert(&docs(), &values, false).build(Dialect::Postgres);
        assert!(!sql.contains("RETURNING"));
        assert!(sql.contains("(\"id\", \"title\", \"version\")"));
    }

    #[test]
    fn update_only_changed_columns_with_version() {
        let expected = Value::Int(3);
        let stmt = update(
            &docs(),
            &[Value::BigInt(7)],
            &[("title", Value::Text("New".into()))],
            Some((
                VersionCheck {
                    column: "version",
                    expected: &expected,
                },
                Value::Int(4),
            )),
        );
        let (sql, params) = stmt.build(Dialect::Postgres);
        assert_eq!(
            sql,
            "UPDATE \"docs\" SET \"title\" = $1, \"version\" = $2 WHERE \"id\" = $3 AND \"version\" = $4"
        );
        assert_eq!(
            params,
            vec![
                Value::Text("New".into()),
                Value::Int(4),
                Value::BigInt(7),
                Value::Int(3)
            ]
        );
    }

    #[test]
    fn delete_with_and_without_version() {
        let (sql, _) = delete(&docs(), &[Value::BigInt(7)], None).build(Dialect::Postgres);
        assert_eq!(sql, "DELETE FROM \"docs\" WHERE \"id\" = $1");

        let expected = Value::Int(2);
        let check = VersionCheck {
            column: "version",
            expected: &expected,
        };
        let (sql, params) = delete(&docs(), &[Value::BigInt(7)], Some(check)).build(Dialect::Postgres);
        assert_eq!(
            sql,
            "DELETE FROM \"docs\" WHERE \"id\" = $1 AND \"version\" = $2"
        );
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn aliased_columns_use_prefix() {
        let (sql, _) = Select::from("docs")
            .alias("t0")
            .project(Vec::new())
            .build(Dialect::Postgres);
        assert_eq!(sql, "SELECT \"t0\".* FROM \"docs\" AS \"t0\"");

        let items = aliased_columns(&docs(), "t1");
        assert_eq!(items.len(), 3);
        assert_eq!(items[1].alias.as_deref(), Some("t1__title"));
        assert_eq!(column_prefix("t1"), "t1__");
    }
}
