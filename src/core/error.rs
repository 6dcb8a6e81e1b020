//! Error types for the data access layer
//!
//! Every fallible operation returns [`Result`]. Backend errors are carried
//! verbatim (wrapped with the operation and target that produced them), while
//! outcomes callers branch on (`NotFound`, `NoMoreRows`, `Cancelled`) have
//! dedicated variants.

/// Result type alias for database operations
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Error types for database operations
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// Connection error (open failures, pool creation)
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Connection timeout
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout { timeout_ms: u64 },

    /// Connection pool exhausted
    #[error("Connection pool exhausted: {active}/{max} connections in use")]
    PoolExhausted { active: usize, max: usize },

    /// The session was closed and can no longer be used
    #[error("Session is closed")]
    SessionClosed,

    /// A single-row fetch produced zero rows
    #[error("No rows found in {0}")]
    NotFound(String),

    /// End-of-rows sentinel: the cursor has no further rows
    #[error("No more rows in this result set")]
    NoMoreRows,

    /// Row to record mapping failure
    #[error("Mapping error for {record}.{column}: {message}")]
    Mapping {
        record: String,
        column: String,
        message: String,
    },

    /// Type conversion error
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// Backend error annotated with the operation and target that produced it
    #[error("{operation} on {target} failed: {source}")]
    Statement {
        operation: String,
        target: String,
        #[source]
        source: Box<DatabaseError>,
    },

    /// Query timeout
    #[error("Query timeout after {timeout_ms}ms")]
    QueryTimeout { timeout_ms: u64 },

    /// Operation cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Transaction error (begin/commit/rollback failures)
    #[error("Transaction error: {0}")]
    TransactionError(String),

    /// A transaction-scoped handle was used after the transaction ended
    #[error("Transaction has already been {0}")]
    TransactionClosed(&'static str),

    /// Transactions cannot be nested
    #[error("Nested transactions are not supported")]
    NestedTransaction,

    /// Statement fragments from different sessions or transactions were combined
    #[error("Scope mismatch: {0}")]
    ScopeMismatch(String),

    /// The pinned transaction connection is held by a live cursor
    #[error("Connection busy: {0}")]
    ConnectionBusy(String),

    /// The transaction body failed and the rollback failed too
    #[error("{original} (rollback also failed: {rollback})")]
    Rollback {
        #[source]
        original: Box<DatabaseError>,
        rollback: Box<DatabaseError>,
    },

    /// The statement could not be built
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Invalid connection string
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    /// Unsupported operation
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// SQLite error
    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// PostgreSQL error
    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    PostgresError(#[from] tokio_postgres::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl DatabaseError {
    /// Create a new connection error (generic)
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        DatabaseError::ConnectionError(msg.into())
    }

    /// Create a connection timeout error
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        DatabaseError::ConnectionTimeout { timeout_ms }
    }

    /// Create a pool exhausted error
    pub fn pool_exhausted(active: usize, max: usize) -> Self {
        DatabaseError::PoolExhausted { active, max }
    }

    /// Create a not-found error for the given target
    pub fn not_found<S: Into<String>>(target: S) -> Self {
        DatabaseError::NotFound(target.into())
    }

    /// Create a mapping error
    pub fn mapping(
        record: impl Into<String>,
        column: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        DatabaseError::Mapping {
            record: record.into(),
            column: column.into(),
            message: message.into(),
        }
    }

    /// Create a query timeout error
    pub fn query_timeout(timeout_ms: u64) -> Self {
        DatabaseError::QueryTimeout { timeout_ms }
    }

    /// Create a new type mismatch error
    pub fn type_mismatch(expected: &str, actual: &str) -> Self {
        DatabaseError::TypeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Create a new transaction error
    pub fn transaction<S: Into<String>>(msg: S) -> Self {
        DatabaseError::TransactionError(msg.into())
    }

    /// Create an invalid query error
    pub fn invalid_query<S: Into<String>>(msg: S) -> Self {
        DatabaseError::InvalidQuery(msg.into())
    }

    /// Create a new unsupported operation error
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        DatabaseError::UnsupportedOperation(msg.into())
    }

    /// Create a generic error
    pub fn other<S: Into<String>>(msg: S) -> Self {
        DatabaseError::Other(msg.into())
    }

    /// Annotate an error with the operation and target that produced it.
    ///
    /// Errors that callers branch on (cancellation, timeouts, sentinels) are
    /// returned unchanged so they stay matchable.
    pub fn context(self, operation: impl Into<String>, target: impl Into<String>) -> Self {
        match self {
            DatabaseError::Cancelled
            | DatabaseError::QueryTimeout { .. }
            | DatabaseError::ConnectionTimeout { .. }
            | DatabaseError::SessionClosed
            | DatabaseError::NoMoreRows
            | DatabaseError::NotFound(_)
            | DatabaseError::Mapping { .. }
            | DatabaseError::ScopeMismatch(_)
            | DatabaseError::ConnectionBusy(_)
            | DatabaseError::TransactionClosed(_)
            | DatabaseError::Statement { .. } => self,
            other => DatabaseError::Statement {
                operation: operation.into(),
                target: target.into(),
                source: Box::new(other),
            },
        }
    }

    /// Strip `Statement` context wrappers
    pub fn root(&self) -> &DatabaseError {
        match self {
            DatabaseError::Statement { source, .. } => source.root(),
            DatabaseError::Rollback { original, .. } => original.root(),
            other => other,
        }
    }

    /// True for the single-row not-found outcome
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), DatabaseError::NotFound(_))
    }

    /// True for the end-of-rows sentinel
    pub fn is_no_more_rows(&self) -> bool {
        matches!(self.root(), DatabaseError::NoMoreRows)
    }

    /// True when the caller cancelled the operation
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), DatabaseError::Cancelled)
    }
}
