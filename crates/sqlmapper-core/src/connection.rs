//! Storage driver contract.
//!
//! The mapper never talks to a database directly. Everything it needs from
//! storage goes through [`Connection`]:
//!
//! - [`Connection::query`] / [`Connection::execute`] run one parametrized
//!   statement
//! - [`Connection::begin`] hands out a [`TransactionHandle`]
//! - [`Connection::commit`] / [`Connection::rollback`] consume that handle
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! context for proper cancellation and timeout handling.

use crate::dialect::Dialect;
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};

/// Transaction isolation level.
///
/// Concurrent sessions are isolated from each other only through this
/// setting; the mapper adds no locking of its own beyond version checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Read uncommitted: transactions can see uncommitted changes from others.
    ReadUncommitted,

    /// Read committed: transactions only see committed changes from others.
    #[default]
    ReadCommitted,

    /// Repeatable read: transactions see a consistent snapshot of the database.
    RepeatableRead,

    /// Serializable: transactions appear to execute sequentially.
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Opaque handle for an open driver transaction.
///
/// Not `Clone`. [`Connection::commit`] and [`Connection::rollback`] take it
/// by value, so a transaction is finished at most once.
#[derive(Debug, PartialEq, Eq)]
pub struct TransactionHandle {
    id: u64,
}

impl TransactionHandle {
    /// Create a handle. Called by drivers, not by application code.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self { id }
    }

    /// Driver-assigned identifier.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }
}

/// A storage driver connection.
///
/// Statements run inside whatever transaction the connection currently has
/// open; the session guarantees it only holds one at a time.
///
/// # Example
///
/// ```rust,ignore
/// let tx = conn.begin(&cx, IsolationLevel::ReadCommitted).await?;
/// conn.execute(&cx, "DELETE FROM \"authors\" WHERE \"id\" = $1", &[Value::BigInt(1)]).await?;
/// conn.commit(&cx, tx).await?;
/// ```
pub trait Connection: Send + Sync {
    /// SQL dialect used to render statements for this connection.
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    /// Execute a statement and return all result rows.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Execute a statement (INSERT, UPDATE, DELETE) and return rows affected.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Begin a transaction.
    fn begin(
        &self,
        cx: &Cx,
        isolation: IsolationLevel,
    ) -> impl Future<Output = Outcome<TransactionHandle, crate::Error>> + Send;

    /// Commit the transaction, making all changes permanent.
    fn commit(
        &self,
        cx: &Cx,
        tx: TransactionHandle,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Roll the transaction back, discarding all changes.
    fn rollback(
        &self,
        cx: &Cx,
        tx: TransactionHandle,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_level_default() {
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
    }

    #[test]
    fn test_isolation_level_as_sql() {
        assert_eq!(IsolationLevel::Serializable.as_sql(), "SERIALIZABLE");
        assert_eq!(IsolationLevel::RepeatableRead.as_sql(), "REPEATABLE READ");
    }

    #[test]
    fn test_isolation_level_deserialize() {
        let level: IsolationLevel = serde_json::from_str("\"serializable\"").unwrap();
        assert_eq!(level, IsolationLevel::Serializable);
    }

    #[test]
    fn test_transaction_handle_id() {
        let tx = TransactionHandle::new(7);
        assert_eq!(tx.id(), 7);
    }
}
