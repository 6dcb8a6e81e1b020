//! Transactions pinned to one pooled connection
//!
//! A [`Tx`] holds a single connection from the session pool for its whole
//! life. Every collection, selector and raw statement reached through it runs
//! on that connection. The function-scoped form commits when the closure
//! succeeds and rolls back when it fails:
//!
//! ```no_run
//! use rust_data_access::prelude::*;
//!
//! # async fn run(sess: &Session) -> Result<()> {
//! sess.with_transaction(|tx| async move {
//!     tx.exec("UPDATE accounts SET balance = balance - 100 WHERE id = ?", vec![1.into()]).await?;
//!     tx.exec("UPDATE accounts SET balance = balance + 100 WHERE id = ?", vec![2.into()]).await?;
//!     Ok(())
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```
//!
//! A `Tx` that is dropped while still active is rolled back in the
//! background.

use crate::core::condition::Condition;
use crate::core::context::Context;
use crate::core::cursor::Cursor;
use crate::core::database::{Connection, ExecResult};
use crate::core::error::{DatabaseError, Result};
use crate::core::logger::QueryEvent;
use crate::core::model::{self, Model};
use crate::core::query_builder::{Deleter, Inserter, Selector, Updater};
use crate::core::session::{Collection, Scope, Session};
use crate::core::statement::Statement;
use crate::core::value::DatabaseValue;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard, OwnedMappedMutexGuard, OwnedMutexGuard};

/// Exclusive use of a transaction's connection
pub(crate) type PinnedConnection =
    OwnedMappedMutexGuard<Option<Box<dyn Connection>>, Box<dyn Connection>>;

const ACTIVE: u8 = 0;
const COMMITTED: u8 = 1;
const ROLLED_BACK: u8 = 2;

static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

struct TxInner {
    id: u64,
    session: Session,
    // Emptied when the transaction ends, returning the connection to the pool.
    conn: Arc<Mutex<Option<Box<dyn Connection>>>>,
    state: AtomicU8,
    ctx: Context,
}

/// Handle to an open transaction; clones share the transaction
#[derive(Clone)]
pub struct Tx {
    inner: Arc<TxInner>,
}

impl fmt::Debug for Tx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tx")
            .field("id", &self.inner.id)
            .field("session", &self.inner.session.inner.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Tx {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Session the transaction was started from
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn context(&self) -> Context {
        self.inner.ctx.clone()
    }

    /// Whether the transaction has neither committed nor rolled back
    pub fn is_active(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == ACTIVE
    }

    fn ensure_active(&self) -> Result<()> {
        match self.inner.state.load(Ordering::Acquire) {
            ACTIVE => Ok(()),
            COMMITTED => Err(DatabaseError::TransactionClosed("committed")),
            _ => Err(DatabaseError::TransactionClosed("rolled back")),
        }
    }

    fn busy(&self) -> DatabaseError {
        DatabaseError::ConnectionBusy(format!(
            "transaction {} connection is held by an open cursor",
            self.inner.id
        ))
    }

    fn scope(&self) -> Scope {
        Scope::Tx(self.clone())
    }

    /// Take the transaction's connection for one statement or cursor
    pub(crate) fn pin(&self) -> Result<PinnedConnection> {
        self.ensure_active()?;
        let guard = self
            .inner
            .conn
            .clone()
            .try_lock_owned()
            .map_err(|_| self.busy())?;
        OwnedMutexGuard::try_map(guard, |slot| slot.as_mut())
            .map_err(|_| DatabaseError::TransactionClosed("ended"))
    }

    fn lock_for_end(&self) -> Result<MutexGuard<'_, Option<Box<dyn Connection>>>> {
        self.ensure_active()?;
        self.inner.conn.try_lock().map_err(|_| self.busy())
    }

    fn log_control(&self, sql: &str, started: Instant, error: Option<&DatabaseError>) {
        self.scope().log(&Statement::raw(sql), started, None, error);
    }

    /// Make the transaction's changes permanent.
    ///
    /// A failed commit rolls the transaction back; a failure of that rollback
    /// is attached to the commit error.
    pub async fn commit(&self) -> Result<()> {
        let mut slot = self.lock_for_end()?;
        let Some(conn) = slot.as_mut() else {
            return Err(DatabaseError::TransactionClosed("ended"));
        };
        let started = Instant::now();
        match conn.commit().await {
            Ok(()) => {
                self.inner.state.store(COMMITTED, Ordering::Release);
                slot.take();
                self.log_control("COMMIT", started, None);
                tracing::debug!(tx = self.inner.id, "Transaction committed");
                Ok(())
            }
            Err(e) => {
                self.log_control("COMMIT", started, Some(&e));
                let rolled_back = conn.rollback().await;
                self.inner.state.store(ROLLED_BACK, Ordering::Release);
                slot.take();
                let e = e.context("commit", "transaction");
                match rolled_back {
                    Ok(()) => Err(e),
                    Err(rb) => Err(DatabaseError::Rollback {
                        original: Box::new(e),
                        rollback: Box::new(rb),
                    }),
                }
            }
        }
    }

    /// Discard the transaction's changes
    pub async fn rollback(&self) -> Result<()> {
        let mut slot = self.lock_for_end()?;
        let Some(conn) = slot.as_mut() else {
            return Err(DatabaseError::TransactionClosed("ended"));
        };
        let started = Instant::now();
        let res = conn.rollback().await;
        self.inner.state.store(ROLLED_BACK, Ordering::Release);
        slot.take();
        self.log_control("ROLLBACK", started, res.as_ref().err());
        tracing::debug!(tx = self.inner.id, ok = res.is_ok(), "Transaction rolled back");
        res.map_err(|e| e.context("rollback", "transaction"))
    }

    /// Handle to a table or view inside the transaction
    pub fn collection(&self, name: &str) -> Collection {
        Collection::new(self.scope(), name)
    }

    /// Names of all tables and views, as seen by the transaction
    pub async fn collections(&self) -> Result<Vec<String>> {
        self.scope().collections(&self.context()).await
    }

    pub fn select(&self, columns: &[&str]) -> Selector {
        Selector::bound(self.scope()).columns(columns)
    }

    pub fn select_from(&self, table: &str) -> Selector {
        Selector::bound(self.scope()).from(table)
    }

    pub fn insert_into(&self, table: &str) -> Inserter {
        Inserter::bound(self.scope(), table)
    }

    pub fn update(&self, table: &str) -> Updater {
        Updater::bound(self.scope(), table)
    }

    pub fn delete_from(&self, table: &str) -> Deleter {
        Deleter::bound(self.scope(), table)
    }

    /// Run a raw query with `?` placeholders
    pub async fn query(&self, sql: &str, args: Vec<DatabaseValue>) -> Result<Cursor> {
        self.query_statement(Statement::new(sql, args)).await
    }

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

    pub async fn exec_statement(&self, stmt: Statement) -> Result<ExecResult> {
        stmt.validate()?;
        self.scope()
            .execute(&self.context(), &stmt, "exec", "raw statement")
            .await
    }

    pub async fn get<M: Model>(&self, condition: Condition) -> Result<M> {
        model::get(&self.scope(), &self.context(), condition).await
    }

    pub async fn save<M: Model>(&self, record: &mut M) -> Result<()> {
        model::save(&self.scope(), &self.context(), record).await
    }

    pub async fn delete<M: Model>(&self, record: &M) -> Result<()> {
        model::delete(&self.scope(), &self.context(), record).await
    }

    /// Always fails: transactions do not nest
    pub async fn with_transaction<T, F, Fut>(&self, _f: F) -> Result<T>
    where
        F: FnOnce(Tx) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        Err(DatabaseError::NestedTransaction)
    }
}

impl Drop for TxInner {
    fn drop(&mut self) {
        if self.state.load(Ordering::Acquire) != ACTIVE {
            return;
        }
        let Some(mut conn) = self.conn.try_lock().ok().and_then(|mut slot| slot.take()) else {
            return;
        };
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(tx = id, "Transaction dropped while active; rolling back");
                handle.spawn(async move {
                    if let Err(e) = conn.rollback().await {
                        tracing::error!(tx = id, error = %e, "Automatic rollback failed");
                    }
                });
            }
            Err(_) => {
                tracing::error!(
                    tx = id,
                    "Transaction dropped outside a Tokio runtime; connection released without rollback"
                );
            }
        }
    }
}

/// Roll `tx` back after `original`, attaching any rollback failure
async fn abort(tx: &Tx, original: DatabaseError) -> DatabaseError {
    match tx.rollback().await {
        Ok(()) => original,
        Err(rb) => DatabaseError::Rollback {
            original: Box::new(original),
            rollback: Box::new(rb),
        },
    }
}

impl Session {
    /// Start a transaction on a dedicated pooled connection
    pub async fn begin(&self) -> Result<Tx> {
        if self.is_closed() {
            return Err(DatabaseError::SessionClosed);
        }
        let ctx = self.context();
        let started = Instant::now();
        let res = ctx
            .run(async {
                let mut conn = self.inner.driver.acquire().await?;
                conn.begin().await?;
                Ok(conn)
            })
            .await;
        let log = |error: Option<&DatabaseError>| {
            self.inner.options.logger.log(&QueryEvent {
                sql: "BEGIN",
                args: 0,
                elapsed: started.elapsed(),
                rows: None,
                error,
                in_transaction: true,
            })
        };
        let conn = match res {
            Ok(conn) => conn,
            Err(e) => {
                log(Some(&e));
                return Err(e.context("begin", "transaction"));
            }
        };
        log(None);
        let tx = Tx {
            inner: Arc::new(TxInner {
                id: NEXT_TX_ID.fetch_add(1, Ordering::Relaxed),
                session: self.clone(),
                conn: Arc::new(Mutex::new(Some(conn))),
                state: AtomicU8::new(ACTIVE),
                ctx,
            }),
        };
        tracing::debug!(tx = tx.id(), session = self.inner.id, "Transaction started");
        Ok(tx)
    }

    /// Run `f` inside a transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back when it
    /// returns `Err`. If `f` ends the transaction itself its result is
    /// returned as is.
    pub async fn with_transaction<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Tx) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let tx = self.begin().await?;
        let res = tx.context().run(f(tx.clone())).await;
        if !tx.is_active() {
            return res;
        }
        match res {
            Ok(value) => match tx.commit().await {
                Ok(()) => Ok(value),
                Err(e @ DatabaseError::ConnectionBusy(_)) => {
                    // A cursor returned by `f` still pins the connection.
                    drop(value);
                    Err(abort(&tx, e).await)
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(abort(&tx, e).await),
        }
    }

    /// [`Session::with_transaction`] under an explicit context
    pub async fn with_transaction_ctx<T, F, Fut>(&self, ctx: &Context, f: F) -> Result<T>
    where
        F: FnOnce(Tx) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.with_context(ctx.clone()).with_transaction(f).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn open_temp() -> (tempfile::TempDir, Session) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("tx.db").display());
        let sess = Session::open_url(&url).await.unwrap();
        sess.exec(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
            vec![],
        )
        .await
        .unwrap();
        (dir, sess)
    }

    async fn count(sess: &Session) -> u64 {
        sess.collection("items").count().await.unwrap()
    }

    #[tokio::test]
    async fn test_commit_on_success() {
        let (_dir, sess) = open_temp().await;
        sess.with_transaction(|tx| async move {
            tx.exec("INSERT INTO items (name) VALUES (?)", vec!["a".into()])
                .await?;
            tx.insert_into("items")
                .columns(&["name"])
                .values(vec!["b".into()])
                .exec()
                .await?;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(count(&sess).await, 2);
    }

    #[tokio::test]
    async fn test_rollback_on_error() {
        let (_dir, sess) = open_temp().await;
        let res: Result<()> = sess
            .with_transaction(|tx| async move {
                tx.exec("INSERT INTO items (name) VALUES (?)", vec!["a".into()])
                    .await?;
                Err(DatabaseError::other("abort"))
            })
            .await;
        assert!(matches!(res, Err(DatabaseError::Other(_))));
        assert_eq!(count(&sess).await, 0);
    }

    #[tokio::test]
    async fn test_closed_after_commit() {
        let (_dir, sess) = open_temp().await;
        let tx = sess.begin().await.unwrap();
        let items = tx.collection("items");
        tx.commit().await.unwrap();
        assert!(!tx.is_active());
        assert!(matches!(
            items.count().await,
            Err(DatabaseError::TransactionClosed("committed"))
        ));
        assert!(matches!(
            tx.rollback().await,
            Err(DatabaseError::TransactionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_nested_rejected() {
        let (_dir, sess) = open_temp().await;
        let res: Result<()> = sess
            .with_transaction(|tx| async move { tx.with_transaction(|_| async { Ok(()) }).await })
            .await;
        assert!(matches!(res, Err(DatabaseError::NestedTransaction)));
    }

    #[tokio::test]
    async fn test_busy_while_cursor_open() {
        let (_dir, sess) = open_temp().await;
        sess.exec("INSERT INTO items (name) VALUES ('a'), ('b')", vec![])
            .await
            .unwrap();
        let tx = sess.begin().await.unwrap();
        let mut cursor = tx.select_from("items").cursor().await.unwrap();
        assert!(matches!(
            tx.collection("items").count().await,
            Err(DatabaseError::ConnectionBusy(_))
        ));
        cursor.close().await.unwrap();
        assert_eq!(tx.collection("items").count().await.unwrap(), 2);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_returned_cursor_rolls_back() {
        let (_dir, sess) = open_temp().await;
        let mut held = None;
        let res = sess
            .with_transaction(|tx| {
                held = Some(tx.clone());
                async move {
                    tx.exec("INSERT INTO items (name) VALUES ('a')", vec![])
                        .await?;
                    tx.select_from("items").cursor().await
                }
            })
            .await;
        assert!(matches!(res, Err(DatabaseError::ConnectionBusy(_))));
        let tx = held.unwrap();
        assert!(!tx.is_active());
        assert!(matches!(
            tx.commit().await,
            Err(DatabaseError::TransactionClosed("rolled back"))
        ));
        assert_eq!(count(&sess).await, 0);
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let (_dir, sess) = open_temp().await;
        {
            let tx = sess.begin().await.unwrap();
            tx.exec("INSERT INTO items (name) VALUES ('a')", vec![])
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count(&sess).await, 0);
    }
}
