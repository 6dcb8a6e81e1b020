//! Core data-access engine
//!
//! This module provides the building blocks of the engine: the error and value
//! types, the record mapper, the condition model and statement builders,
//! cursors, sessions, transactions and the driver traits backends implement.

pub mod condition;
pub mod context;
pub mod cursor;
pub mod database;
pub mod database_types;
pub mod dialect;
pub mod error;
pub mod logger;
pub mod mapper;
pub mod model;
pub mod paginator;
pub mod query_builder;
pub mod session;
pub mod settings;
pub mod statement;
pub mod transaction;
pub mod value;

// Re-export commonly used types
pub use condition::{cond, Condition, Operator};
pub use context::{CancelHandle, Context};
pub use cursor::{Cursor, CursorState};
pub use database::{Connection, Driver, ExecResult, PoolStats, RowStream};
pub use database_types::DatabaseType;
pub use dialect::Dialect;
pub use error::{DatabaseError, Result};
pub use logger::{NoopLogger, QueryEvent, QueryLogger, TracingLogger};
pub use mapper::{FieldMapping, MappingBuilder, Record};
pub use model::Model;
pub use paginator::Paginator;
pub use query_builder::{Deleter, Inserter, JoinType, OrderDirection, Selector, Updater};
pub use session::{Collection, InsertResult, Session};
pub use settings::{ConnectionBuilder, ConnectionSettings, SessionOptions};
pub use statement::Statement;
pub use transaction::Tx;
pub use value::{ColumnValue, DatabaseRow, DatabaseValue};
