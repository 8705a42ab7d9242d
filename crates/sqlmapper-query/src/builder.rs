//! Query builders for INSERT, UPDATE, DELETE, and the [`Statement`] wrapper
//! that runs any of them against a connection.

use crate::expr::{Expr, bind};
use crate::select::Select;
use asupersync::{Cx, Outcome};
use sqlmapper_core::{Connection, Dialect, Error, Row, Value};

/// INSERT statement.
#[derive(Debug, Clone)]
pub struct Insert {
    table: String,
    columns: Vec<String>,
    values: Vec<Value>,
    returning: bool,
}

impl Insert {
    #[allow(clippy::should_implement_trait, clippy::wrong_self_convention)]
    pub fn into(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            values: Vec::new(),
            returning: false,
        }
    }

    /// Add a column value.
    pub fn value(mut self, column: impl Into<String>, value: Value) -> Self {
        self.columns.push(column.into());
        self.values.push(value);
        self
    }

    /// Append `RETURNING *` so database-generated columns come back.
    pub fn returning(mut self) -> Self {
        self.returning = true;
        self
    }

    pub fn has_returning(&self) -> bool {
        self.returning
    }

    /// Build the INSERT SQL and parameters.
    pub fn build(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let table = dialect.quote_identifier(&self.table);
        let mut params = Vec::with_capacity(self.values.len());
        let mut sql = if self.columns.is_empty() {
            format!("INSERT INTO {table} DEFAULT VALUES")
        } else {
            let columns: Vec<_> = self
                .columns
                .iter()
                .map(|c| dialect.quote_identifier(c))
                .collect();
            let placeholders: Vec<_> = self
                .values
                .iter()
                .map(|v| bind(dialect, &mut params, v.clone()))
                .collect();
            format!(
                "INSERT INTO {table} ({}) VALUES ({})",
                columns.join(", "),
                placeholders.join(", ")
            )
        };
        if self.returning {
            sql.push_str(" RETURNING *");
        }
        (sql, params)
    }
}

/// UPDATE statement.
#[derive(Debug, Clone)]
pub struct Update {
    table: String,
    set: Vec<(String, Value)>,
    filter: Option<Expr>,
}

impl Update {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            set: Vec::new(),
            filter: None,
        }
    }

    /// Add a `column = value` assignment.
    pub fn set(mut self, column: impl Into<String>, value: Value) -> Self {
        self.set.push((column.into(), value));
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

    /// Build the UPDATE SQL and parameters.
    pub fn build(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let set_clauses: Vec<_> = self
            .set
            .iter()
            .map(|(column, value)| {
                format!(
                    "{} = {}",
                    dialect.quote_identifier(column),
                    bind(dialect, &mut params, value.clone())
                )
            })
            .collect();

        let mut sql = format!(
            "UPDATE {} SET {}",
            dialect.quote_identifier(&self.table),
            set_clauses.join(", ")
        );
        if let Some(filter) = &self.filter {
            sql.push_str(" WHERE ");
            sql.push_str(&filter.render(dialect, None, &mut params));
        }
        (sql, params)
    }
}

/// DELETE statement.
#[derive(Debug, Clone)]
pub struct Delete {
    table: String,
    filter: Option<Expr>,
}

impl Delete {
    #[allow(clippy::should_implement_trait)]
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
        }
    }

    /// Add a WHERE condition, ANDed with any existing one.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    /// Build the DELETE SQL and parameters.
    pub fn build(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut sql = format!("DELETE FROM {}", dialect.quote_identifier(&self.table));
        let mut params = Vec::new();
        if let Some(filter) = &self.filter {
            sql.push_str(" WHERE ");
            sql.push_str(&filter.render(dialect, None, &mut params));
        }
        (sql, params)
    }
}

/// Any statement the mapper issues.
#[derive(Debug, Clone)]
pub enum Statement {
    Select(Select),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
}

impl Statement {
    pub fn build(&self, dialect: Dialect) -> (String, Vec<Value>) {
        match self {
            Statement::Select(s) => s.build(dialect),
            Statement::Insert(s) => s.build(dialect),
            Statement::Update(s) => s.build(dialect),
            Statement::Delete(s) => s.build(dialect),
        }
    }

    /// Run the statement and return its result rows.
    pub async fn fetch<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<Vec<Row>, Error> {
        let (sql, params) = self.build(conn.dialect());
        tracing::trace!(sql = %sql, params = params.len(), "Executing query");
        conn.query(cx, &sql, &params).await
    }

    /// Run the statement and return the number of affected rows.
    pub async fn execute<C: Connection>(&self, cx: &Cx, conn: &C) -> Outcome<u64, Error> {
        let (sql, params) = self.build(conn.dialect());
        tracing::trace!(sql = %sql, params = params.len(), "Executing statement");
        conn.execute(cx, &sql, &params).await
    }
}

impl From<Select> for Statement {
    fn from(s: Select) -> Self {
        Statement::Select(s)
    }
}

impl From<Insert> for Statement {
    fn from(s: Insert) -> Self {
        Statement::Insert(s)
    }
}

impl From<Update> for Statement {
    fn from(s: Update) -> Self {
        Statement::Update(s)
    }
}

impl From<Delete> for Statement {
    fn from(s: Delete) -> Self {
        Statement::Delete(s)
    }
}
