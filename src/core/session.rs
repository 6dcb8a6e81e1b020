//! Sessions and collections
//!
//! A [`Session`] owns a backend connection pool. It is cheap to clone and safe
//! to share between tasks: every operation leases its own pooled connection
//! for the duration of the statement (or, for cursors, until the cursor is
//! closed). A [`Collection`] is a named table or view reached through a
//! session or a transaction.
//!
//! ```no_run
//! use rust_data_access::prelude::*;
//!
//! # async fn run() -> Result<()> {
//! let settings: ConnectionSettings = "sqlite:///tmp/booktown.db".parse()?;
//! let sess = Session::open(&settings).await?;
//!
//! let books = sess.collection("books");
//! let total = books.find().count().await?;
//! let p_titles = books.find().order_by("title").and(cond("title LIKE", "P%"));
//! println!("{} books, {} starting with P", total, p_titles.count().await?);
//!
//! sess.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::backends;
use crate::core::condition::{cond, Condition};
use crate::core::context::Context;
use crate::core::cursor::Cursor;
use crate::core::database::{fetch_all, Connection, Driver, ExecResult, PoolStats};
use crate::core::dialect::Dialect;
use crate::core::error::{DatabaseError, Result};
use crate::core::logger::QueryEvent;
use crate::core::mapper::{mapping, Record};
use crate::core::model::{self, Model};
use crate::core::query_builder::{Deleter, Inserter, ScopeKey, Selector, Updater};
use crate::core::settings::{without_pool_options, ConnectionSettings, SessionOptions};
use crate::core::statement::Statement;
use crate::core::transaction::{PinnedConnection, Tx};
use crate::core::value::{ColumnValue, DatabaseRow, DatabaseValue};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct SessionInner {
    pub(crate) id: u64,
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) settings: ConnectionSettings,
    pub(crate) options: SessionOptions,
    closed: AtomicBool,
    primary_keys: RwLock<HashMap<String, Arc<[String]>>>,
}

/// Handle to an open database
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
    ctx: Option<Context>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("settings", &self.inner.settings)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    /// Open a session with default options.
    ///
    /// Pool options given as URI options (`max_connections`,
    /// `pool_timeout_ms`) override the defaults.
    pub async fn open(settings: &ConnectionSettings) -> Result<Session> {
        let options = SessionOptions::from_settings(settings)?;
        Self::open_with(settings, options).await
    }

    /// Open a session from a connection URI
    pub async fn open_url(url: &str) -> Result<Session> {
        let settings: ConnectionSettings = url.parse()?;
        Self::open(&settings).await
    }

    /// Open a session with explicit options
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedOperation` when no driver for the backend was
    /// compiled in, or a connection error when the pool cannot be created.
    pub async fn open_with(settings: &ConnectionSettings, options: SessionOptions) -> Result<Session> {
        let driver = backends::open_driver(&without_pool_options(settings), &options).await?;
        let inner = SessionInner {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            driver,
            settings: settings.clone(),
            options,
            closed: AtomicBool::new(false),
            primary_keys: RwLock::new(HashMap::new()),
        };
        tracing::info!(
            session = inner.id,
            backend = %settings.database_type(),
            database = settings.database(),
            max_connections = inner.options.max_size,
            "Session opened"
        );
        Ok(Session {
            inner: Arc::new(inner),
            ctx: None,
        })
    }

    /// Database name (file path for SQLite)
    pub fn name(&self) -> &str {
        self.inner.settings.database()
    }

    /// Canonical connection URI
    pub fn connection_url(&self) -> String {
        self.inner.settings.connection_url()
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.inner.settings
    }

    pub fn dialect(&self) -> Dialect {
        self.inner.driver.dialect()
    }

    /// Pool statistics
    pub fn stats(&self) -> PoolStats {
        self.inner.driver.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close the session and its pool.
    ///
    /// Every clone of the session is closed too; later operations fail with
    /// `SessionClosed`. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.driver.close().await?;
        tracing::info!(session = self.inner.id, "Session closed");
        Ok(())
    }

    /// Copy of this handle whose operations run under `ctx`
    pub fn with_context(&self, ctx: Context) -> Session {
        Session {
            inner: self.inner.clone(),
            ctx: Some(ctx),
        }
    }

    pub(crate) fn context(&self) -> Context {
        self.ctx
            .clone()
            .unwrap_or_else(|| self.inner.options.context.clone())
    }

    pub(crate) fn scope(&self) -> Scope {
        Scope::Session(self.clone())
    }

    /// Handle to a table or view
    pub fn collection(&self, name: &str) -> Collection {
        Collection::new(self.scope(), name)
    }

    /// Names of all tables and views
    pub async fn collections(&self) -> Result<Vec<String>> {
        self.scope().collections(&self.context()).await
    }

    /// `SELECT columns`
    pub fn select(&self, columns: &[&str]) -> Selector {
        Selector::bound(self.scope()).columns(columns)
    }

    /// `SELECT * FROM table`
    pub fn select_from(&self, table: &str) -> Selector {
        Selector::bound(self.scope()).from(table)
    }

    /// `INSERT INTO table`
    pub fn insert_into(&self, table: &str) -> Inserter {
        Inserter::bound(self.scope(), table)
    }

    /// `UPDATE table`
    pub fn update(&self, table: &str) -> Updater {
        Updater::bound(self.scope(), table)
    }

    /// `DELETE FROM table`
    pub fn delete_from(&self, table: &str) -> Deleter {
        Deleter::bound(self.scope(), table)
    }

    /// Run a raw query with `?` placeholders
    pub async fn query(&self, sql: &str, args: Vec<DatabaseValue>) -> Result<Cursor> {
        self.query_statement(Statement::new(sql, args)).await
    }

    /// Run a prepared [`Statement`], e.g. one built with `Statement::named`
    pub async fn query_statement(&self, stmt: Statement) -> Result<Cursor> {
        stmt.validate()?;
        self.scope()
            .open_cursor(self.context(), stmt, "raw statement".to_string(), None)
            .await
    }

    /// Execute a raw statement with `?` placeholders
    pub async fn exec(&self, sql: &str, args: Vec<DatabaseValue>) -> Result<ExecResult> {
        self.exec_statement(Statement::new(sql, args)).await
    }

    /// Execute a prepared [`Statement`]
    pub async fn exec_statement(&self, stmt: Statement) -> Result<ExecResult> {
        stmt.validate()?;
        self.scope()
            .execute(&self.context(), &stmt, "exec", "raw statement")
            .await
    }

    /// Fetch the single record of `M`'s table matching `condition`
    pub async fn get<M: Model>(&self, condition: Condition) -> Result<M> {
        model::get(&self.scope(), &self.context(), condition).await
    }

    /// Insert the record when its primary key is empty, update it otherwise
    pub async fn save<M: Model>(&self, record: &mut M) -> Result<()> {
        model::save(&self.scope(), &self.context(), record).await
    }

    /// Delete the record by primary key
    pub async fn delete<M: Model>(&self, record: &M) -> Result<()> {
        model::delete(&self.scope(), &self.context(), record).await
    }
}

/// Leased backend connection
pub(crate) enum Lease {
    /// Borrowed from the pool for one operation
    Pooled(Box<dyn Connection>),
    /// The connection pinned by a transaction
    Pinned(PinnedConnection),
}

impl Lease {
    pub(crate) fn conn(&mut self) -> &mut dyn Connection {
        match self {
            Lease::Pooled(c) => &mut **c,
            Lease::Pinned(g) => &mut ***g,
        }
    }
}

/// Where statements run: the session pool or one transaction
#[derive(Clone)]
pub(crate) enum Scope {
    Session(Session),
    Tx(Tx),
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.key())
    }
}

impl Scope {
    pub(crate) fn key(&self) -> ScopeKey {
        match self {
            Scope::Session(s) => ScopeKey {
                session: s.inner.id,
                tx: None,
            },
            Scope::Tx(tx) => ScopeKey {
                session: tx.session().inner.id,
                tx: Some(tx.id()),
            },
        }
    }

    pub(crate) fn session(&self) -> &Session {
        match self {
            Scope::Session(s) => s,
            Scope::Tx(tx) => tx.session(),
        }
    }

    pub(crate) fn dialect(&self) -> Dialect {
        self.session().dialect()
    }

    pub(crate) fn default_context(&self) -> Context {
        match self {
            Scope::Session(s) => s.context(),
            Scope::Tx(tx) => tx.context(),
        }
    }

    pub(crate) fn in_transaction(&self) -> bool {
        matches!(self, Scope::Tx(_))
    }

    /// Lease the connection statements in this scope must use
    pub(crate) async fn lease(&self) -> Result<Lease> {
        if self.session().is_closed() {
            return Err(DatabaseError::SessionClosed);
        }
        match self {
            Scope::Session(s) => Ok(Lease::Pooled(s.inner.driver.acquire().await?)),
            Scope::Tx(tx) => tx.pin().map(Lease::Pinned),
        }
    }

    pub(crate) fn log(
        &self,
        stmt: &Statement,
        started: Instant,
        rows: Option<u64>,
        error: Option<&DatabaseError>,
    ) {
        self.session().inner.options.logger.log(&QueryEvent {
            sql: &stmt.sql,
            args: stmt.args.len(),
            elapsed: started.elapsed(),
            rows,
            error,
            in_transaction: self.in_transaction(),
        });
    }

    /// Execute a statement that produces no rows
    pub(crate) async fn execute(
        &self,
        ctx: &Context,
        stmt: &Statement,
        operation: &str,
        target: &str,
    ) -> Result<ExecResult> {
        let started = Instant::now();
        let res = ctx
            .run(async {
                let mut lease = self.lease().await?;
                lease.conn().execute(stmt).await
            })
            .await;
        self.log(
            stmt,
            started,
            res.as_ref().ok().map(|r| r.rows_affected),
            res.as_ref().err(),
        );
        res.map_err(|e| e.context(operation, target))
    }

    /// Start a query and wrap its rows in a cursor
    pub(crate) async fn open_cursor(
        &self,
        ctx: Context,
        stmt: Statement,
        target: String,
        source: Option<Selector>,
    ) -> Result<Cursor> {
        let started = Instant::now();
        let res = ctx
            .run(async {
                let mut lease = self.lease().await?;
                let stream = lease.conn().query(&stmt).await?;
                Ok((lease, stream))
            })
            .await;
        self.log(&stmt, started, None, res.as_ref().err());
        let (lease, stream) = res.map_err(|e| e.context("query", target.as_str()))?;
        Ok(Cursor::new(self.clone(), ctx, lease, stream, target, source))
    }

    /// Run a query and collect every row
    pub(crate) async fn fetch_rows(
        &self,
        ctx: &Context,
        stmt: &Statement,
        operation: &str,
        target: &str,
    ) -> Result<Vec<DatabaseRow>> {
        let started = Instant::now();
        let res = ctx
            .run(async {
                let mut lease = self.lease().await?;
                let mut stream = lease.conn().query(stmt).await?;
                fetch_all(stream.as_mut()).await
            })
            .await;
        self.log(
            stmt,
            started,
            res.as_ref().ok().map(|rows| rows.len() as u64),
            res.as_ref().err(),
        );
        res.map_err(|e| e.context(operation, target))
    }

    pub(crate) async fn collections(&self, ctx: &Context) -> Result<Vec<String>> {
        let stmt = Statement::raw(self.dialect().list_collections_sql());
        let rows = self.fetch_rows(ctx, &stmt, "list collections", "schema").await?;
        rows.iter().map(|r| first_text(r, "collection name")).collect()
    }

    pub(crate) async fn collection_exists(&self, ctx: &Context, name: &str) -> Result<bool> {
        let stmt = Statement::new(self.dialect().collection_exists_sql(), vec![name.into()]);
        let rows = self.fetch_rows(ctx, &stmt, "exists", name).await?;
        Ok(!rows.is_empty())
    }

    /// Primary key columns of a table, cached per session once known
    pub(crate) async fn primary_keys(&self, ctx: &Context, table: &str) -> Result<Arc<[String]>> {
        let inner = &self.session().inner;
        if let Some(keys) = inner.primary_keys.read().get(table) {
            return Ok(keys.clone());
        }
        let stmt = Statement::new(self.dialect().primary_keys_sql(), vec![table.into()]);
        let rows = self.fetch_rows(ctx, &stmt, "primary keys", table).await?;
        let keys: Arc<[String]> = rows
            .iter()
            .map(|r| first_text(r, "primary key column"))
            .collect::<Result<Vec<_>>>()?
            .into();
        // A missing table reports no keys; do not cache that.
        if !keys.is_empty() {
            inner
                .primary_keys
                .write()
                .insert(table.to_string(), keys.clone());
        }
        Ok(keys)
    }
}

fn first_text(row: &DatabaseRow, what: &str) -> Result<String> {
    row.get_index(0)
        .and_then(DatabaseValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| DatabaseError::mapping("metadata", what, "expected a text column"))
}

/// Key generated by an insert
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InsertResult {
    id: Option<DatabaseValue>,
    rows_affected: u64,
}

impl InsertResult {
    /// Generated primary key, when the backend reported one
    pub fn id(&self) -> Option<&DatabaseValue> {
        self.id.as_ref()
    }

    /// Generated primary key decoded into a typed value
    pub fn id_as<T: ColumnValue>(&self) -> Result<T> {
        T::from_value(self.id.clone().unwrap_or(DatabaseValue::Null))
    }

    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }
}

/// Named table or view within a session or transaction
#[derive(Clone)]
pub struct Collection {
    scope: Scope,
    name: String,
    ctx: Option<Context>,
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .finish()
    }
}

impl PartialEq for Collection {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.scope.key() == other.scope.key()
    }
}

impl Collection {
    pub(crate) fn new(scope: Scope, name: &str) -> Self {
        Self {
            scope,
            name: name.to_string(),
            ctx: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Copy of this handle whose operations run under `ctx`
    pub fn with_context(&self, ctx: Context) -> Collection {
        Collection {
            ctx: Some(ctx),
            ..self.clone()
        }
    }

    fn context(&self) -> Context {
        self.ctx
            .clone()
            .unwrap_or_else(|| self.scope.default_context())
    }

    /// Whether the table or view exists in the backend
    pub async fn exists(&self) -> Result<bool> {
        self.scope.collection_exists(&self.context(), &self.name).await
    }

    /// Query over every row
    pub fn find(&self) -> Selector {
        let sel = Selector::bound(self.scope.clone()).from(&self.name);
        match &self.ctx {
            Some(ctx) => sel.with_context(ctx.clone()),
            None => sel,
        }
    }

    /// Query over the rows matching `condition`
    pub fn find_where(&self, condition: Condition) -> Selector {
        self.find().where_(condition)
    }

    /// Query over the row whose primary key equals `id`
    ///
    /// # Errors
    ///
    /// Returns `InvalidQuery` when the table does not have exactly one
    /// primary key column.
    pub async fn find_by_id(&self, id: impl Into<DatabaseValue>) -> Result<Selector> {
        let keys = self.primary_keys().await?;
        match keys.as_ref() {
            [pk] => Ok(self.find_where(cond(pk, id))),
            [] => Err(DatabaseError::invalid_query(format!(
                "{} has no primary key",
                self.name
            ))),
            _ => Err(DatabaseError::invalid_query(format!(
                "{} has a composite primary key; use find_where",
                self.name
            ))),
        }
    }

    /// Number of rows
    pub async fn count(&self) -> Result<u64> {
        self.find().count().await
    }

    /// Insert a record, returning the generated key
    pub async fn insert<T: Record>(&self, record: &T) -> Result<InsertResult> {
        self.insert_pairs(mapping::<T>()?.encode(record)).await
    }

    pub(crate) async fn insert_pairs(
        &self,
        pairs: Vec<(String, DatabaseValue)>,
    ) -> Result<InsertResult> {
        let mut ins = Inserter::bound(self.scope.clone(), &self.name).with_context(self.context());
        if !pairs.is_empty() {
            let (cols, values): (Vec<String>, Vec<DatabaseValue>) = pairs.into_iter().unzip();
            let cols: Vec<&str> = cols.iter().map(String::as_str).collect();
            ins = ins.columns(&cols).values(values);
        }

        if self.scope.dialect().has_last_insert_id() {
            let res = ins.exec().await?;
            return Ok(InsertResult {
                id: res.last_insert_id.map(DatabaseValue::Long),
                rows_affected: res.rows_affected,
            });
        }

        let keys = self.primary_keys().await?;
        match keys.as_ref() {
            [pk] => {
                let mut cursor = ins.returning(&[pk.as_str()]).query().await?;
                let row = cursor.next_row().await;
                cursor.close().await?;
                let row = row?.ok_or_else(|| DatabaseError::not_found(self.name.clone()))?;
                Ok(InsertResult {
                    id: row.get_index(0).cloned(),
                    rows_affected: 1,
                })
            }
            _ => {
                let res = ins.exec().await?;
                Ok(InsertResult {
                    id: None,
                    rows_affected: res.rows_affected,
                })
            }
        }
    }

    /// Remove every row
    pub async fn truncate(&self) -> Result<()> {
        let stmt = Statement::raw(self.scope.dialect().truncate_sql(&self.name));
        self.scope
            .execute(&self.context(), &stmt, "truncate", &self.name)
            .await
            .map(|_| ())
    }

    /// Primary key columns, read from backend metadata
    pub async fn primary_keys(&self) -> Result<Arc<[String]>> {
        self.scope.primary_keys(&self.context(), &self.name).await
    }
}
