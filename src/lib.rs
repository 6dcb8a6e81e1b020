//! # Rust Data Access
//!
//! A session-based relational data access layer. One abstraction covers
//! several stores; on top of it sit an immutable query builder, lazy cursors,
//! declarative record mapping (including inline composition for join
//! results), pagination and function-scoped transactions.
//!
//! ## Features
//!
//! - **Immutable queries**: every builder call returns a new value, so a base
//!   query can be shared and narrowed freely
//! - **Lazy cursors**: rows are fetched one at a time from a leased connection
//! - **Record mapping**: columns declared once per type with
//!   `name[,omitempty|inline|-]` tags
//! - **Transactions**: closures run on one pinned connection with automatic
//!   commit or rollback
//! - **Cancellation**: a [`Context`] bounds every terminal call
//! - **Connection pooling**: `deadpool` pools for every backend
//!
//! ## Supported Databases
//!
//! | Database | Feature | Pool |
//! |----------|---------|------|
//! | SQLite | `sqlite` (default) | deadpool-sqlite |
//! | PostgreSQL | `postgres` | deadpool-postgres |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rust_data_access::prelude::*;
//!
//! #[derive(Debug, Default)]
//! struct Book {
//!     id: i64,
//!     title: String,
//!     author_id: Option<i64>,
//! }
//!
//! impl Record for Book {
//!     fn describe(m: &mut MappingBuilder<Self>) {
//!         m.field("id,omitempty", |b| &b.id, |b| &mut b.id)
//!             .field("title", |b| &b.title, |b| &mut b.title)
//!             .field("author_id", |b| &b.author_id, |b| &mut b.author_id);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let sess = Session::open_url("sqlite:///tmp/booktown.db").await?;
//!     let books = sess.collection("books");
//!
//!     let by_title = books.find().order_by("title");
//!     let p_books: Vec<Book> = by_title.and(cond("title LIKE", "P%")).all().await?;
//!     println!("{} of {} books start with P", p_books.len(), by_title.count().await?);
//!
//!     let page = by_title.paginate(10)?.page(2);
//!     for book in page.all::<Book>().await? {
//!         println!("{}", book.title);
//!     }
//!
//!     sess.with_transaction(|tx| async move {
//!         tx.collection("books").find_where(cond("author_id", 4156)).delete().await?;
//!         Ok(())
//!     })
//!     .await?;
//!
//!     sess.close().await
//! }
//! ```
//!
//! ## Project Structure
//!
//! ```text
//! rust_data_access/
//! ├── src/
//! │   ├── core/              # Engine: mapper, builders, cursors, sessions
//! │   ├── backends/          # Drivers: sqlite.rs, postgres.rs
//! │   └── lib.rs
//! ├── tests/                 # Integration and property tests
//! ├── benches/               # Criterion benchmarks
//! └── Cargo.toml
//! ```

/// Core engine types and traits
pub mod core;

/// Database backend implementations
pub mod backends;

/// Prelude for convenient imports
///
/// ```rust
/// use rust_data_access::prelude::*;
///
/// let q = Selector::new().from("books").where_(cond("id", 7));
/// assert_eq!(q.to_string(), "SELECT * FROM books WHERE id = ?");
/// ```
pub mod prelude {
    pub use crate::core::{
        cond, CancelHandle, Collection, Condition, ConnectionBuilder, ConnectionSettings, Context,
        Cursor, DatabaseError, DatabaseRow, DatabaseType, DatabaseValue, Deleter, Dialect,
        ExecResult, InsertResult, Inserter, MappingBuilder, Model, NoopLogger, Paginator,
        QueryLogger, Record, Result, Selector, Session, SessionOptions, Statement, TracingLogger,
        Tx, Updater,
    };
}

// Re-export at root level for convenience
pub use core::{
    cond, Collection, Condition, ConnectionSettings, Context, Cursor, DatabaseError, DatabaseRow,
    DatabaseType, DatabaseValue, Record, Result, Selector, Session, SessionOptions, Tx,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prelude_imports() {
        use prelude::*;

        let db_type = DatabaseType::Sqlite;
        assert_eq!(db_type.to_str(), "sqlite");

        let settings: ConnectionSettings = "sqlite:///tmp/app.db".parse().unwrap();
        assert_eq!(settings.database(), "/tmp/app.db");
    }

    #[test]
    fn test_value_conversions() {
        use prelude::*;

        let val: DatabaseValue = 42.into();
        assert_eq!(val.as_long(), Some(42));

        let val: DatabaseValue = "test".into();
        assert_eq!(val.as_str(), Some("test"));

        let val: DatabaseValue = None::<i64>.into();
        assert!(val.is_null());
    }
}
