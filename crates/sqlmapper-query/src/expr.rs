//! SQL expressions for query building.
//!
//! Expressions never inline values: every literal becomes a bound parameter
//! and only identifiers reach the SQL text, quoted for the dialect.

use crate::clause::OrderBy;
use crate::select::Select;
use sqlmapper_core::{Dialect, Value};

/// A SQL expression that can be used in WHERE, ON and ORDER BY.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Column reference with optional table qualifier
    Column {
        /// Table name or alias. Unqualified columns pick up the alias of the
        /// statement they are rendered in.
        table: Option<String>,
        name: String,
    },

    /// Bound parameter value
    Literal(Value),

    /// Binary operation (e.g., a = b, a AND b)
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },

    /// NOT expr
    Not(Box<Expr>),

    /// IN / NOT IN over a value list
    In {
        expr: Box<Expr>,
        values: Vec<Expr>,
        negated: bool,
    },

    /// IN / NOT IN over a sub-select
    InSubquery {
        expr: Box<Expr>,
        query: Box<Select>,
        negated: bool,
    },

    /// BETWEEN expression
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
    },

    /// IS NULL / IS NOT NULL
    IsNull { expr: Box<Expr>, negated: bool },

    /// LIKE / NOT LIKE pattern
    Like {
        expr: Box<Expr>,
        pattern: String,
        negated: bool,
    },

    /// Parenthesized expression
    Paren(Box<Expr>),
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// Equal (=)
    Eq,
    /// Not equal (<>)
    Ne,
    /// Less than (<)
    Lt,
    /// Less than or equal (<=)
    Le,
    /// Greater than (>)
    Gt,
    /// Greater than or equal (>=)
    Ge,
    And,
    Or,
}

impl BinaryOp {
    /// Get the SQL representation of this operator.
    pub const fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
        }
    }

    /// Get the precedence of this operator (higher = binds tighter).
    pub const fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge => 3,
        }
    }
}

impl Expr {
    // ==================== Constructors ====================

    /// Unqualified column reference.
    pub fn col(name: impl Into<String>) -> Self {
        Expr::Column {
            table: None,
            name: name.into(),
        }
    }

    /// Column reference qualified with a table name or alias.
    pub fn qualified(table: impl Into<String>, column: impl Into<String>) -> Self {
        Expr::Column {
            table: Some(table.into()),
            name: column.into(),
        }
    }

    /// Literal value, always bound as a parameter.
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    /// AND of all expressions, `None` when empty.
    pub fn all(exprs: impl IntoIterator<Item = Expr>) -> Option<Self> {
        exprs.into_iter().reduce(Expr::and)
    }

    // ==================== Comparison ====================

    fn binary(self, op: BinaryOp, other: impl Into<Expr>) -> Self {
        Expr::Binary {
            left: Box::new(self),
            op,
            right: Box::new(other.into()),
        }
    }

    pub fn eq(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Eq, other)
    }

    pub fn ne(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ne, other)
    }

    pub fn lt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Lt, other)
    }

    pub fn le(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Le, other)
    }

    pub fn gt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Gt, other)
    }

    pub fn ge(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ge, other)
    }

    // ==================== Logical ====================

    pub fn and(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::And, other)
    }

    pub fn or(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Or, other)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }

    // ==================== Null / pattern / range ====================

    pub fn is_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: true,
        }
    }

    pub fn like(self, pattern: impl Into<String>) -> Self {
        Expr::Like {
            expr: Box::new(self),
            pattern: pattern.into(),
            negated: false,
        }
    }

    pub fn not_like(self, pattern: impl Into<String>) -> Self {
        Expr::Like {
            expr: Box::new(self),
            pattern: pattern.into(),
            negated: true,
        }
    }

    pub fn between(self, low: impl Into<Expr>, high: impl Into<Expr>) -> Self {
        Expr::Between {
            expr: Box::new(self),
            low: Box::new(low.into()),
            high: Box::new(high.into()),
        }
    }

    // ==================== Membership ====================

    /// `expr IN (...)`. An empty list matches nothing.
    pub fn in_list<V: Into<Expr>>(self, values: impl IntoIterator<Item = V>) -> Self {
        Expr::In {
            expr: Box::new(self),
            values: values.into_iter().map(Into::into).collect(),
            negated: false,
        }
    }

    /// `expr NOT IN (...)`. An empty list matches everything.
    pub fn not_in_list<V: Into<Expr>>(self, values: impl IntoIterator<Item = V>) -> Self {
        Expr::In {
            expr: Box::new(self),
            values: values.into_iter().map(Into::into).collect(),
            negated: true,
        }
    }

    /// `expr IN (SELECT ...)`.
    pub fn in_subquery(self, query: Select) -> Self {
        Expr::InSubquery {
            expr: Box::new(self),
            query: Box::new(query),
            negated: false,
        }
    }

    pub fn paren(self) -> Self {
        Expr::Paren(Box::new(self))
    }

    // ==================== Ordering ====================

    pub fn asc(self) -> OrderBy {
        OrderBy::asc(self)
    }

    pub fn desc(self) -> OrderBy {
        OrderBy::desc(self)
    }

    // ==================== SQL Generation ====================

    /// Build SQL and parameters on its own (numbering starts at 1).
    pub fn build(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = self.render(dialect, None, &mut params);
        (sql, params)
    }

    /// Render into a statement whose parameters are being collected in
    /// `params`. Unqualified columns are qualified with `qualifier` if given.
    pub fn render(&self, dialect: Dialect, qualifier: Option<&str>, params: &mut Vec<Value>) -> String {
        match self {
            Expr::Column { table, name } => match table.as_deref().or(qualifier) {
                Some(t) => format!(
                    "{}.{}",
                    dialect.quote_identifier(t),
                    dialect.quote_identifier(name)
                ),
                None => dialect.quote_identifier(name),
            },

            Expr::Literal(value) => bind(dialect, params, value.clone()),

            Expr::Binary { left, op, right } => {
                let left_sql = left.render_operand(*op, dialect, qualifier, params);
                let right_sql = right.render_operand(*op, dialect, qualifier, params);
                format!("{left_sql} {} {right_sql}", op.as_str())
            }

            Expr::Not(expr) => {
                let expr_sql = expr.render(dialect, qualifier, params);
                match **expr {
                    Expr::Binary { .. } => format!("NOT ({expr_sql})"),
                    _ => format!("NOT {expr_sql}"),
                }
            }

            Expr::In {
                expr,
                values,
                negated,
            } => {
                if values.is_empty() {
                    // IN () is not valid SQL
                    return if *negated { "1 = 1" } else { "1 = 0" }.to_string();
                }
                let expr_sql = expr.render(dialect, qualifier, params);
                let value_sqls: Vec<_> = values
                    .iter()
                    .map(|v| v.render(dialect, qualifier, params))
                    .collect();
                let not_str = if *negated { "NOT " } else { "" };
                format!("{expr_sql} {not_str}IN ({})", value_sqls.join(", "))
            }

            Expr::InSubquery {
                expr,
                query,
                negated,
            } => {
                let expr_sql = expr.render(dialect, qualifier, params);
                let query_sql = query.render(dialect, params);
                let not_str = if *negated { "NOT " } else { "" };
                format!("{expr_sql} {not_str}IN ({query_sql})")
            }

            Expr::Between { expr, low, high } => {
                let expr_sql = expr.render(dialect, qualifier, params);
                let low_sql = low.render(dialect, qualifier, params);
                let high_sql = high.render(dialect, qualifier, params);
                format!("{expr_sql} BETWEEN {low_sql} AND {high_sql}")
            }

            Expr::IsNull { expr, negated } => {
                let expr_sql = expr.render(dialect, qualifier, params);
                let not_str = if *negated { " NOT" } else { "" };
                format!("{expr_sql} IS{not_str} NULL")
            }

            Expr::Like {
                expr,
                pattern,
                negated,
            } => {
                let expr_sql = expr.render(dialect, qualifier, params);
                let param = bind(dialect, params, Value::Text(pattern.clone()));
                let not_str = if *negated { "NOT " } else { "" };
                format!("{expr_sql} {not_str}LIKE {param}")
            }

            Expr::Paren(expr) => {
                let expr_sql = expr.render(dialect, qualifier, params);
                format!("({expr_sql})")
            }
        }
    }

    /// Operand of a binary operator, parenthesized when it binds looser.
    fn render_operand(
        &self,
        parent: BinaryOp,
        dialect: Dialect,
        qualifier: Option<&str>,
        params: &mut Vec<Value>,
    ) -> String {
        let sql = self.render(dialect, qualifier, params);
        match self {
            Expr::Binary { op, .. } if op.precedence() < parent.precedence() => format!("({sql})"),
            _ => sql,
        }
    }
}

/// Push a parameter and return its placeholder.
pub(crate) fn bind(dialect: Dialect, params: &mut Vec<Value>, value: Value) -> String {
    params.push(value);
    dialect.placeholder(params.len())
}

// ==================== Conversions ====================

impl From<Value> for Expr {
    fn from(v: Value) -> Self {
        Expr::Literal(v)
    }
}

impl From<&str> for Expr {
    fn from(s: &str) -> Self {
        Expr::Literal(Value::Text(s.to_string()))
    }
}

impl From<String> for Expr {
    fn from(s: String) -> Self {
        Expr::Literal(Value::Text(s))
    }
}

impl From<i32> for Expr {
    fn from(n: i32) -> Self {
        Expr::Literal(Value::Int(n))
    }
}

impl From<i64> for Expr {
    fn from(n: i64) -> Self {
        Expr::Literal(Value::BigInt(n))
    }
}

impl From<bool> for Expr {
    fn from(b: bool) -> Self {
        Expr::Literal(Value::Bool(b))
    }
}

impl From<f64> for Expr {
    fn from(n: f64) -> Self {
        Expr::Literal(Value::Double(n))
    }
}
