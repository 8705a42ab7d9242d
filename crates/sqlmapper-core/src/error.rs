//! Error types for sqlmapper operations.

use crate::value::Value;
use std::fmt;

/// The primary error type for all sqlmapper operations.
#[derive(Debug)]
pub enum Error {
    /// Bad or conflicting registry entries, or a mapping that does not match
    /// the registry
    Config(ConfigError),
    /// `get` on a key that has no row
    NotFound(NotFoundError),
    /// Operation on an entity (or session) that is no longer attached
    Detached(DetachedInstanceError),
    /// Access to a relationship whose strategy forbids loading on access
    LazyLoadForbidden(LazyLoadForbiddenError),
    /// Driver-reported constraint violation, with identity context
    Constraint(ConstraintViolationError),
    /// Optimistic version check failed during flush
    Concurrency(ConcurrencyConflictError),
    /// Connection-related errors (connect, disconnect)
    Connection(ConnectionError),
    /// Statement execution errors reported by the driver
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction errors
    Transaction(TransactionError),
    /// I/O errors
    Io(std::io::Error),
    /// Operation timed out
    Timeout,
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConfigError {
    pub kind: ConfigErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// Table registered twice
    DuplicateTable,
    /// Entity declares no primary key column
    MissingPrimaryKey,
    /// Relationship targets a table that is not registered
    UnknownTarget,
    /// Column referenced by a relationship, version check or mapping is unknown
    UnknownColumn,
    /// Same column or relationship name declared twice
    DuplicateName,
    /// Table, column or relationship name is not a plain SQL identifier
    InvalidIdentifier,
    /// Relationship shape is inconsistent (missing join table, composite key...)
    InvalidRelationship,
    /// Entity type used with a session but never registered
    UnregisteredEntity,
    /// Identity map already holds a different instance for a key
    IdentityConflict,
    /// Foreign keys among pending inserts form a cycle
    DependencyCycle,
    /// Schema configuration document could not be read
    Parse,
    /// Anything else
    Invalid,
}

#[derive(Debug)]
pub struct NotFoundError {
    pub table: String,
    pub key: Vec<Value>,
}

#[derive(Debug)]
pub struct DetachedInstanceError {
    pub table: Option<String>,
    pub key: Option<Vec<Value>>,
    pub message: String,
}

#[derive(Debug)]
pub struct LazyLoadForbiddenError {
    pub table: String,
    pub relationship: String,
}

#[derive(Debug)]
pub struct ConstraintViolationError {
    pub kind: ConstraintKind,
    pub table: String,
    pub key: Vec<Value>,
    pub source: QueryError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Unique,
    ForeignKey,
    NotNull,
    Check,
    Other,
}

#[derive(Debug)]
pub struct ConcurrencyConflictError {
    pub table: String,
    pub key: Vec<Value>,
    pub expected_version: Value,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Authentication failed
    Authentication,
    /// Connection lost during operation
    Disconnected,
    /// Connection refused
    Refused,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub detail: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure
    Serialization,
    /// Statement timeout
    Timeout,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// No transaction is open
    NotActive,
    /// A transaction is already open
    AlreadyActive,
    /// The driver does not support the requested feature
    Unsupported,
}

impl ConfigError {
    pub fn new(kind: ConfigErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }
}

impl Error {
    /// Shorthand for a configuration error without a source.
    pub fn config(kind: ConfigErrorKind, message: impl Into<String>) -> Self {
        Error::Config(ConfigError::new(kind, message))
    }

    /// Shorthand for a detached-instance error.
    pub fn detached(table: Option<&str>, key: Option<&[Value]>, message: impl Into<String>) -> Self {
        Error::Detached(DetachedInstanceError {
            table: table.map(str::to_string),
            key: key.map(<[Value]>::to_vec),
            message: message.into(),
        })
    }

    /// Is this a generic driver failure (I/O, statement error, timeout)?
    pub fn is_database_error(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Query(_) | Error::Timeout | Error::Io(_)
        )
    }

    /// Is this a retryable error (deadlock, serialization, timeouts)?
    ///
    /// Nothing in the session retries on its own; callers decide.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization | QueryErrorKind::Timeout
            ),
            Error::Concurrency(_) | Error::Timeout => true,
            _ => false,
        }
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            Error::Constraint(c) => c.source.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            Error::Constraint(c) => c.source.sql.as_deref(),
            _ => None,
        }
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }

    /// Classify this error as a constraint violation, if it is one.
    ///
    /// SQLSTATE class 23 is "integrity constraint violation".
    pub fn constraint_kind(&self) -> Option<ConstraintKind> {
        match self.sqlstate.as_deref() {
            Some("23505") => Some(ConstraintKind::Unique),
            Some("23503") => Some(ConstraintKind::ForeignKey),
            Some("23502") => Some(ConstraintKind::NotNull),
            Some("23514") => Some(ConstraintKind::Check),
            Some(state) if state.starts_with("23") => Some(ConstraintKind::Other),
            _ if self.kind == QueryErrorKind::Constraint => Some(ConstraintKind::Other),
            _ => None,
        }
    }
}

fn fmt_key(key: &[Value]) -> String {
    let parts: Vec<String> = key.iter().map(Value::to_string).collect();
    format!("({})", parts.join(", "))
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::NotFound(e) => write!(f, "Not found: {}", e),
            Error::Detached(e) => write!(f, "Detached instance: {}", e),
            Error::LazyLoadForbidden(e) => write!(f, "Lazy load forbidden: {}", e),
            Error::Constraint(e) => write!(f, "Constraint violation: {}", e),
            Error::Concurrency(e) => write!(f, "Concurrency conflict: {}", e),
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Constraint(e) => Some(&e.source),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no row in '{}' for key {}", self.table, fmt_key(&self.key))
    }
}

impl fmt::Display for DetachedInstanceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.table, &self.key) {
            (Some(table), Some(key)) => write!(f, "{} ({} {})", self.message, table, fmt_key(key)),
            (Some(table), None) => write!(f, "{} ({})", self.message, table),
            _ => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for LazyLoadForbiddenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "relationship '{}.{}' is not loaded and its strategy forbids loading on access",
            self.table, self.relationship
        )
    }
}

impl fmt::Display for ConstraintViolationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} constraint failed for '{}' {}: {}",
            self.kind,
            self.table,
            fmt_key(&self.key),
            self.source
        )
    }
}

impl fmt::Display for ConcurrencyConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "row '{}' {} no longer has version {}",
            self.table,
            fmt_key(&self.key),
            self.expected_version
        )
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn std::error::Error + 'static))
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<NotFoundError> for Error {
    fn from(err: NotFoundError) -> Self {
        Error::NotFound(err)
    }
}

impl From<DetachedInstanceError> for Error {
    fn from(err: DetachedInstanceError) -> Self {
        Error::Detached(err)
    }
}

impl From<LazyLoadForbiddenError> for Error {
    fn from(err: LazyLoadForbiddenError) -> Self {
        Error::LazyLoadForbidden(err)
    }
}

impl From<ConstraintViolationError> for Error {
    fn from(err: ConstraintViolationError) -> Self {
        Error::Constraint(err)
    }
}

impl From<ConcurrencyConflictError> for Error {
    fn from(err: ConcurrencyConflictError) -> Self {
        Error::Concurrency(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for sqlmapper operations.
pub type Result<T> = std::result::Result<T, Error>;
