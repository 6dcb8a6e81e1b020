//! Driver traits
//!
//! This module defines the contract every backend implements. A [`Driver`]
//! owns a connection pool; a [`Connection`] is one leased member of that pool;
//! a [`RowStream`] yields the rows of one running query lazily.
//!
//! The engine above these traits never sees backend types: statements go in as
//! [`Statement`] values with `?` placeholders, rows come out as [`DatabaseRow`].

use super::database_types::DatabaseType;
use super::dialect::Dialect;
use super::error::Result;
use super::statement::Statement;
use super::value::DatabaseRow;
use async_trait::async_trait;

/// Outcome of a statement that does not produce rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecResult {
    /// Number of rows inserted, updated or deleted
    pub rows_affected: u64,
    /// Rowid of the last inserted row, for backends that report it
    pub last_insert_id: Option<i64>,
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Total number of connections in the pool
    pub size: usize,
    /// Number of available connections
    pub available: usize,
    /// Number of requests waiting for a connection
    pub waiting: usize,
}

/// A backend: one connection pool plus the dialect it speaks
#[async_trait]
pub trait Driver: Send + Sync {
    /// Get the database type
    fn database_type(&self) -> DatabaseType;

    /// SQL dialect used to rebind and introspect
    fn dialect(&self) -> Dialect;

    /// Lease a connection from the pool
    ///
    /// The connection returns to the pool when the box is dropped.
    async fn acquire(&self) -> Result<Box<dyn Connection>>;

    /// Close the pool; outstanding leases are discarded when dropped
    async fn close(&self) -> Result<()>;

    /// Current pool statistics
    fn stats(&self) -> PoolStats;
}

/// One pooled backend connection
///
/// Statements arrive with `?` placeholders; the connection rebinds them for
/// its dialect. Every call is bounded by the driver's operation timeout.
#[async_trait]
pub trait Connection: Send {
    /// Execute a statement that doesn't return rows (INSERT, UPDATE, DELETE, DDL)
    async fn execute(&mut self, stmt: &Statement) -> Result<ExecResult>;

    /// Start a query and return its rows as a lazy stream
    ///
    /// The stream stays valid for as long as this connection is leased.
    async fn query(&mut self, stmt: &Statement) -> Result<Box<dyn RowStream>>;

    /// Begin a transaction
    async fn begin(&mut self) -> Result<()>;

    /// Commit the current transaction
    async fn commit(&mut self) -> Result<()>;

    /// Rollback the current transaction
    async fn rollback(&mut self) -> Result<()>;
}

/// Rows of one running query
#[async_trait]
pub trait RowStream: Send {
    /// Fetch the next row; `None` once the result set is exhausted
    async fn next_row(&mut self) -> Result<Option<DatabaseRow>>;

    /// Stop the query and release its backend resources
    ///
    /// Calling `close` more than once is a no-op.
    async fn close(&mut self) -> Result<()>;
}

/// Drain a stream into memory, closing it afterwards
pub async fn fetch_all(stream: &mut dyn RowStream) -> Result<Vec<DatabaseRow>> {
    let mut rows = Vec::new();
    let result = loop {
        match stream.next_row().await {
            Ok(Some(row)) => rows.push(row),
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    stream.close().await?;
    result.map(|_| rows)
}
