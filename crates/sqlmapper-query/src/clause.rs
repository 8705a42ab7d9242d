//! ORDER BY clause.

use crate::expr::Expr;
use sqlmapper_core::{Dialect, Value};

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

/// One ORDER BY term.
#[derive(Debug, Clone)]
pub struct OrderBy {
    pub expr: Expr,
    pub direction: OrderDirection,
}

impl OrderBy {
    /// Create an ascending order by clause.
    pub fn asc(expr: impl Into<OrderTarget>) -> Self {
        Self {
            expr: expr.into().0,
            direction: OrderDirection::Asc,
        }
    }

    /// Create a descending order by clause.
    pub fn desc(expr: impl Into<OrderTarget>) -> Self {
        Self {
            expr: expr.into().0,
            direction: OrderDirection::Desc,
        }
    }

    pub(crate) fn render(
        &self,
        dialect: Dialect,
        qualifier: Option<&str>,
        params: &mut Vec<Value>,
    ) -> String {
        let expr_sql = self.expr.render(dialect, qualifier, params);
        match self.direction {
            OrderDirection::Asc => format!("{expr_sql} ASC"),
            OrderDirection::Desc => format!("{expr_sql} DESC"),
        }
    }
}

/// What an ORDER BY term sorts on: an expression, or a column given by name.
#[derive(Debug, Clone)]
pub struct OrderTarget(Expr);

impl From<Expr> for OrderTarget {
    fn from(expr: Expr) -> Self {
        Self(expr)
    }
}

impl From<&str> for OrderTarget {
    fn from(column: &str) -> Self {
        Self(Expr::col(column))
    }
}

impl From<String> for OrderTarget {
    fn from(column: String) -> Self {
        Self(Expr::col(column))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_by_column_name() {
        let mut params = Vec::new();
        let sql = OrderBy::desc("created_at").render(Dialect::Postgres, None, &mut params);
        assert_eq!(sql, "\"created_at\" DESC");
        assert!(params.is_empty());
    }

    #[test]
    fn test_order_by_qualified_in_alias() {
        let mut params = Vec::new();
        let sql = Expr::col("name")
            .asc()
            .render(Dialect::Sqlite, Some("t0"), &mut params);
        assert_eq!(sql, "\"t0\".\"name\" ASC");
    }
}
