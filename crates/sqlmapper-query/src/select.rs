//! SELECT statement builder.

use crate::clause::OrderBy;
use crate::expr::{Expr, bind};
use crate::join::Join;
use sqlmapper_core::{Dialect, Value};

/// What a SELECT reads from.
#[derive(Debug, Clone)]
pub enum Source {
    Table(String),
    /// A nested SELECT, rendered as a derived table.
    Derived(Box<Select>),
}

/// One item of the select list.
#[derive(Debug, Clone)]
pub struct SelectItem {
    pub expr: Expr,
    pub alias: Option<String>,
}

/// A SELECT statement.
///
/// When an alias is set, unqualified columns in the select list, WHERE and
/// ORDER BY are qualified with it.
#[derive(Debug, Clone)]
pub struct Select {
    source: Source,
    alias: Option<String>,
    items: Vec<SelectItem>,
    joins: Vec<Join>,
    filter: Option<Expr>,
    order_by: Vec<OrderBy>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl Select {
    /// `SELECT * FROM table`.
    #[allow(clippy::should_implement_trait)]
    pub fn from(table: impl Into<String>) -> Self {
        Self::with_source(Source::Table(table.into()))
    }

    /// `SELECT * FROM (inner) AS alias`.
    pub fn from_derived(inner: Select, alias: impl Into<String>) -> Self {
        let mut select = Self::with_source(Source::Derived(Box::new(inner)));
        select.alias = Some(alias.into());
        select
    }

    fn with_source(source: Source) -> Self {
        Self {
            source,
            alias: None,
            items: Vec::new(),
            joins: Vec::new(),
            filter: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// Alias for the FROM table.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Add unqualified columns to the select list.
    pub fn columns<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.items.extend(names.into_iter().map(|n| SelectItem {
            expr: Expr::col(n),
            alias: None,
        }));
        self
    }

    /// Add an expression to the select list.
    pub fn column(mut self, expr: Expr) -> Self {
        self.items.push(SelectItem { expr, alias: None });
        self
    }

    /// Add an aliased expression to the select list.
    pub fn column_as(mut self, expr: Expr, alias: impl Into<String>) -> Self {
        self.items.push(SelectItem {
            expr,
            alias: Some(alias.into()),
        });
        self
    }

    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    /// Add a WHERE condition, ANDed with any existing one.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    /// Set LIMIT.
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Set OFFSET.
    pub fn offset(mut self, n: u64) -> Self {
        self.offset = Some(n);
        self
    }

    // ==================== Accessors ====================

    pub fn table(&self) -> Option<&str> {
        match &self.source {
            Source::Table(t) => Some(t),
            Source::Derived(_) => None,
        }
    }

    pub fn alias_name(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn where_expr(&self) -> Option<&Expr> {
        self.filter.as_ref()
    }

    pub fn ordering(&self) -> &[OrderBy] {
        &self.order_by
    }

    /// Whether LIMIT or OFFSET restrict the row set.
    pub fn is_windowed(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }

    /// A copy restricted to the given select list with ordering and paging
    /// kept, for use as a sub-select.
    pub fn project(&self, items: Vec<SelectItem>) -> Select {
        let mut select = self.clone();
        select.items = items;
        select
    }

    /// A copy without ORDER BY / LIMIT / OFFSET.
    pub fn unwindowed(&self) -> Select {
        let mut select = self.clone();
        select.order_by.clear();
        select.limit = None;
        select.offset = None;
        select
    }

    // ==================== SQL Generation ====================

    /// Build SQL and parameters.
    pub fn build(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = self.render(dialect, &mut params);
        (sql, params)
    }

    pub(crate) fn render(&self, dialect: Dialect, params: &mut Vec<Value>) -> String {
        let qualifier = self.alias.as_deref();
        let mut sql = String::from("SELECT ");

        if self.items.is_empty() {
            match qualifier {
                Some(q) => {
                    sql.push_str(&dialect.quote_identifier(q));
                    sql.push_str(".*");
                }
                None => sql.push('*'),
            }
        } else {
            let items: Vec<String> = self
                .items
                .iter()
                .map(|item| {
                    let expr_sql = item.expr.render(dialect, qualifier, params);
                    match &item.alias {
                        Some(alias) => format!("{expr_sql} AS {}", dialect.quote_identifier(alias)),
                        None => expr_sql,
                    }
                })
                .collect();
            sql.push_str(&items.join(", "));
        }

        // FROM
        sql.push_str(" FROM ");
        match &self.source {
            Source::Table(table) => {
                sql.push_str(&dialect.quote_identifier(table));
                if let Some(alias) = qualifier {
                    sql.push_str(" AS ");
                    sql.push_str(&dialect.quote_identifier(alias));
                }
            }
            Source::Derived(inner) => {
                sql.push('(');
                sql.push_str(&inner.render(dialect, params));
                sql.push_str(") AS ");
                sql.push_str(&dialect.quote_identifier(qualifier.unwrap_or("sub")));
            }
        }

        for join in &self.joins {
            sql.push_str(&join.render(dialect, params));
        }

        // WHERE
        if let Some(filter) = &self.filter {
            sql.push_str(" WHERE ");
            sql.push_str(&filter.render(dialect, qualifier, params));
        }

        // ORDER BY
        if !self.order_by.is_empty() {
            let order_strs: Vec<_> = self
                .order_by
                .iter()
                .map(|o| o.render(dialect, qualifier, params))
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&order_strs.join(", "));
        }

        // LIMIT / OFFSET are bound like any other value
        if let Some(n) = self.limit {
            sql.push_str(" LIMIT ");
            sql.push_str(&bind(dialect, params, count_value(n)));
        }
        if let Some(n) = self.offset {
            sql.push_str(" OFFSET ");
            sql.push_str(&bind(dialect, params, count_value(n)));
        }

        sql
    }
}

fn count_value(n: u64) -> Value {
    Value::BigInt(i64::try_from(n).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_star() {
        let (sql, params) = Select::from("heroes").build(Dialect::Postgres);
        assert_eq!(sql, "SELECT * FROM \"heroes\"");
        assert!(params.is_empty());
    }

    #[test]
    fn test_select_columns_filter_order_limit() {
        let (sql, params) = Select::from("heroes")
            .columns(["id", "name"])
            .filter(Expr::col("age").gt(18))
            .filter(Expr::col("team_id").eq(2_i64))
            .order_by(OrderBy::asc("name"))
            .limit(10)
            .offset(20)
            .build(Dialect::Postgres);
        assert_eq!(
            sql,
            "SELECT \"id\", \"name\" FROM \"heroes\" WHERE \"age\" > $1 AND \"team_id\" = $2 \
             ORDER BY \"name\" ASC LIMIT $3 OFFSET $4"
        );
        assert_eq!(
            params,
            vec![
                Value::Int(18),
                Value::BigInt(2),
                Value::BigInt(10),
                Value::BigInt(20)
            ]
        );
    }

    #[test]
    fn test_alias_qualifies_everything() {
        let (sql, _) = Select::from("authors")
            .alias("t0")
            .column_as(Expr::col("id"), "t0__id")
            .filter(Expr::col("name").eq("A"))
            .order_by(OrderBy::desc("id"))
            .build(Dialect::Sqlite);
        assert_eq!(
            sql,
            "SELECT \"t0\".\"id\" AS \"t0__id\" FROM \"authors\" AS \"t0\" \
             WHERE \"t0\".\"name\" = ?1 ORDER BY \"t0\".\"id\" DESC"
        );
    }

    #[test]
    fn test_derived_source_numbers_params_in_order() {
        let inner = Select::from("authors")
            .filter(Expr::col("name").like("A%"))
            .limit(5);
        let (sql, params) = Select::from_derived(inner, "t0")
            .join(
                Join::left(
                    "articles",
                    Expr::qualified("t1", "author_id").eq(Expr::qualified("t0", "id")),
                )
                .alias("t1"),
            )
            .filter(Expr::col("id").gt(0_i64))
            .build(Dialect::Postgres);
        assert_eq!(
            sql,
            "SELECT \"t0\".* FROM (SELECT * FROM \"authors\" WHERE \"name\" LIKE $1 LIMIT $2) AS \"t0\" \
             LEFT JOIN \"articles\" AS \"t1\" ON \"t1\".\"author_id\" = \"t0\".\"id\" \
             WHERE \"t0\".\"id\" > $3"
        );
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_in_subquery_shares_parameters() {
        let owners = Select::from("authors")
            .column(Expr::col("id"))
            .filter(Expr::col("name").eq("A"));
        let (sql, params) = Select::from("articles")
            .filter(Expr::col("author_id").in_subquery(owners))
            .filter(Expr::col("draft").eq(false))
            .build(Dialect::Postgres);
        assert_eq!(
            sql,
            "SELECT * FROM \"articles\" WHERE \"author_id\" IN \
             (SELECT \"id\" FROM \"authors\" WHERE \"name\" = $1) AND \"draft\" = $2"
        );
        assert_eq!(params, vec![Value::Text("A".into()), Value::Bool(false)]);
    }

    #[test]
    fn test_unwindowed_drops_paging() {
        let select = Select::from("a").order_by(OrderBy::asc("id")).limit(3);
        assert!(select.is_windowed());
        let plain = select.unwindowed();
        assert!(!plain.is_windowed());
        assert!(plain.ordering().is_empty());
        assert_eq!(plain.build(Dialect::Postgres).0, "SELECT * FROM \"a\"");
    }
}
