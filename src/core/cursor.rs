//! Lazy, single-pass traversal of a result set
//!
//! A [`Cursor`] holds the connection lease its rows come from until it is
//! closed, so close it (or run it to exhaustion) promptly:
//!
//! ```no_run
//! use rust_data_access::prelude::*;
//!
//! # #[derive(Debug, Default)] struct Book { id: i64, title: String }
//! # impl Record for Book {
//! #     fn describe(m: &mut MappingBuilder<Self>) {
//! #         m.field("id", |b| &b.id, |b| &mut b.id);
//! #         m.field("title", |b| &b.title, |b| &mut b.title);
//! #     }
//! # }
//! # async fn run(sess: &Session) -> Result<()> {
//! let mut cursor = sess.collection("books").find().order_by("title").cursor().await?;
//! let mut book = Book::default();
//! while cursor.next(&mut book).await {
//!     println!("{} {}", book.id, book.title);
//! }
//! if let Some(err) = cursor.err() {
//!     eprintln!("iteration failed: {}", err);
//! }
//! cursor.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::core::context::Context;
use crate::core::database::{ExecResult, RowStream};
use crate::core::error::{DatabaseError, Result};
use crate::core::mapper::{mapping, Record};
use crate::core::query_builder::Selector;
use crate::core::session::{Lease, Scope};
use crate::core::value::DatabaseRow;
use std::fmt;

/// Lifecycle of a cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// No row fetched yet
    Open,
    /// At least one fetch attempted
    Iterating,
    /// Resources released
    Closed,
}

/// Stateful handle over the rows of one executed query
pub struct Cursor {
    scope: Scope,
    ctx: Context,
    // Field order matters: the stream is dropped before its lease.
    stream: Option<Box<dyn RowStream>>,
    lease: Option<Lease>,
    state: CursorState,
    err: Option<DatabaseError>,
    source: Option<Selector>,
    target: String,
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("target", &self.target)
            .field("state", &self.state)
            .field("err", &self.err)
            .finish()
    }
}

impl Cursor {
    pub(crate) fn new(
        scope: Scope,
        ctx: Context,
        lease: Lease,
        stream: Box<dyn RowStream>,
        target: String,
        source: Option<Selector>,
    ) -> Self {
        Self {
            scope,
            ctx,
            stream: Some(stream),
            lease: Some(lease),
            state: CursorState::Open,
            err: None,
            source,
            target,
        }
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == CursorState::Closed
    }

    /// Error that ended iteration, if any
    pub fn err(&self) -> Option<&DatabaseError> {
        self.err.as_ref()
    }

    /// Fetch the next raw row; `None` once the rows are exhausted.
    ///
    /// Exhaustion and errors release the underlying connection. Fetching from
    /// a closed cursor yields `None`.
    pub async fn next_row(&mut self) -> Result<Option<DatabaseRow>> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        self.state = CursorState::Iterating;
        let res = self.ctx.run(stream.next_row()).await;
        match res {
            Ok(Some(row)) => Ok(Some(row)),
            Ok(None) => {
                self.release().await?;
                Ok(None)
            }
            Err(e) => {
                let e = e.context("fetch", self.target.as_str());
                // The fetch error takes precedence over a failing close.
                let _ = self.release().await;
                Err(e)
            }
        }
    }

    /// Decode the next row into a new record
    pub async fn fetch<T: Record>(&mut self) -> Result<Option<T>> {
        let mapping = mapping::<T>()?;
        match self.next_row().await? {
            Some(row) => mapping.decode(&row).map(Some),
            None => Ok(None),
        }
    }

    /// Decode the next row into `record`.
    ///
    /// Returns `false` when the rows are exhausted or an error occurred;
    /// check [`Cursor::err`] to tell the two apart.
    pub async fn next<T: Record>(&mut self, record: &mut T) -> bool {
        let res = async {
            let mapping = mapping::<T>()?;
            match self.next_row().await? {
                Some(row) => {
                    mapping.decode_into(&row, record)?;
                    Ok::<_, DatabaseError>(true)
                }
                None => Ok(false),
            }
        }
        .await;
        match res {
            Ok(more) => more,
            Err(e) => {
                let _ = self.release().await;
                self.err = Some(e);
                false
            }
        }
    }

    /// Append every remaining record to `out`, then close the cursor.
    ///
    /// On a decode or fetch error the records appended so far stay in `out`.
    pub async fn all<T: Record>(&mut self, out: &mut Vec<T>) -> Result<()> {
        let res = async {
            let mapping = mapping::<T>()?;
            while let Some(row) = self.next_row().await? {
                out.push(mapping.decode(&row)?);
            }
            Ok::<_, DatabaseError>(())
        }
        .await;
        let closed = self.close().await;
        res.and(closed)
    }

    /// Decode the next row and close the cursor
    ///
    /// # Errors
    ///
    /// Returns `NoMoreRows` when the cursor has no further row.
    pub async fn one<T: Record>(&mut self) -> Result<T> {
        let res = match self.fetch::<T>().await {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(DatabaseError::NoMoreRows),
            Err(e) => Err(e),
        };
        let closed = self.close().await;
        let record = res?;
        closed?;
        Ok(record)
    }

    async fn release(&mut self) -> Result<()> {
        let res = match self.stream.take() {
            Some(mut stream) => stream.close().await,
            None => Ok(()),
        };
        self.lease = None;
        self.state = CursorState::Closed;
        res
    }

    /// Release the result set and its connection; closing twice is a no-op
    pub async fn close(&mut self) -> Result<()> {
        if self.state == CursorState::Closed {
            return Ok(());
        }
        self.release().await
    }

    fn source(&self, op: &str) -> Result<Selector> {
        self.source.clone().ok_or_else(|| {
            DatabaseError::invalid_query(format!(
                "{} needs a cursor opened from a selector, not a raw statement",
                op
            ))
        })
    }

    /// Update every row the producing query selects with `record`'s fields.
    ///
    /// The cursor is closed first so the statement can reuse its connection.
    pub async fn update<T: Record>(&mut self, record: &T) -> Result<ExecResult> {
        let source = self.source("update")?;
        self.close().await?;
        source.with_context(self.ctx.clone()).update(record).await
    }

    /// Delete every row the producing query selects
    pub async fn delete(&mut self) -> Result<ExecResult> {
        let source = self.source("delete")?;
        self.close().await?;
        source.with_context(self.ctx.clone()).delete().await
    }

    pub(crate) fn in_transaction(&self) -> bool {
        self.scope.in_transaction()
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if self.state != CursorState::Closed {
            tracing::debug!(
                target_name = %self.target,
                in_transaction = self.in_transaction(),
                "Cursor dropped without close"
            );
        }
    }
}

