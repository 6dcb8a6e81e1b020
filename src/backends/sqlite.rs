//! SQLite backend
//!
//! Connections come from a `deadpool-sqlite` pool. rusqlite is synchronous,
//! so every call runs on the blocking thread pool through
//! `Object::interact`. Query results are produced lazily: the blocking task
//! steps the statement and feeds rows into a bounded channel that the
//! [`RowStream`] drains. Dropping or closing the stream stops the producer.

use crate::core::database::{Connection, Driver, ExecResult, PoolStats, RowStream};
use crate::core::database_types::DatabaseType;
use crate::core::dialect::Dialect;
use crate::core::error::{DatabaseError, Result};
use crate::core::settings::{ConnectionSettings, SessionOptions};
use crate::core::statement::Statement;
use crate::core::value::{DatabaseRow, DatabaseValue};
use async_trait::async_trait;
use deadpool_sqlite::{Config, InteractError, Object, Pool, PoolConfig, PoolError, Runtime};
use rusqlite::types::{Value, ValueRef};
use rusqlite::params_from_iter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Rows buffered between the blocking producer and the consumer
const ROW_BUFFER: usize = 64;

/// Option overriding the busy timeout, in milliseconds
pub const OPTION_BUSY_TIMEOUT_MS: &str = "busy_timeout";

const MEMORY_DATABASE: &str = ":memory:";

fn interact_error(e: InteractError) -> DatabaseError {
    DatabaseError::other(format!("Interact error: {}", e))
}

/// Pooled SQLite driver
pub struct SqliteDriver {
    pool: Pool,
    operation_timeout: Duration,
    busy_timeout: Duration,
    acquire_timeout: Duration,
}

impl SqliteDriver {
    /// Create the pool and prepare the database file
    ///
    /// # Errors
    ///
    /// Returns a connection error if the pool cannot be created or the first
    /// connection cannot be initialized.
    pub async fn open(settings: &ConnectionSettings, options: &SessionOptions) -> Result<Self> {
        let path = settings.database();
        // Every connection to :memory: opens a distinct database.
        let max_size = if path == MEMORY_DATABASE {
            1
        } else {
            options.max_size.max(1)
        };
        let busy_timeout = match settings.option(OPTION_BUSY_TIMEOUT_MS) {
            Some(v) => Duration::from_millis(v.parse().map_err(|_| {
                DatabaseError::InvalidConnectionString(format!(
                    "option {}={} is not a number",
                    OPTION_BUSY_TIMEOUT_MS, v
                ))
            })?),
            None => options.timeout,
        };

        let mut pool_config = PoolConfig::new(max_size);
        pool_config.timeouts.wait = Some(options.timeout);
        let mut config = Config::new(path);
        config.pool = Some(pool_config);

        let pool = config
            .create_pool(Runtime::Tokio1)
            .map_err(|e| DatabaseError::connection(format!("Failed to create pool: {}", e)))?;

        let driver = Self {
            pool,
            operation_timeout: options.operation_timeout,
            busy_timeout,
            acquire_timeout: options.timeout,
        };

        let conn = driver.get().await?;
        conn.interact(|conn| {
            // journal_mode returns the resulting mode as a row.
            conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
            Ok::<_, rusqlite::Error>(())
        })
        .await
        .map_err(interact_error)?
        .map_err(|e| DatabaseError::connection(format!("Failed to initialize database: {}", e)))?;

        tracing::debug!(path, max_size, "SQLite pool created");
        Ok(driver)
    }

    async fn get(&self) -> Result<Object> {
        self.pool.get().await.map_err(|e| match e {
            PoolError::Timeout(_) => {
                let status = self.pool.status();
                if status.size >= status.max_size {
                    DatabaseError::pool_exhausted(status.size, status.max_size)
                } else {
                    DatabaseError::connection_timeout(self.acquire_timeout.as_millis() as u64)
                }
            }
            PoolError::Closed => DatabaseError::SessionClosed,
            other => DatabaseError::connection(format!("Failed to acquire connection: {}", other)),
        })
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Sqlite
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn acquire(&self) -> Result<Box<dyn Connection>> {
        let obj = self.get().await?;
        let busy_timeout = self.busy_timeout;
        let conn = SqliteConnection {
            obj: Arc::new(obj),
            operation_timeout: self.operation_timeout,
        };
        conn.interact(move |c| {
            c.busy_timeout(busy_timeout)?;
            c.execute_batch("PRAGMA foreign_keys = ON")
        })
        .await?;
        Ok(Box::new(conn))
    }

    async fn close(&self) -> Result<()> {
        self.pool.close();
        Ok(())
    }

    fn stats(&self) -> PoolStats {
        let status = self.pool.status();
        PoolStats {
            size: status.size,
            available: status.available,
            waiting: status.waiting,
        }
    }
}

/// One pooled SQLite connection
pub struct SqliteConnection {
    // Shared with the row producer of a running query.
    obj: Arc<Object>,
    operation_timeout: Duration,
}

impl SqliteConnection {
    async fn interact<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        tokio::time::timeout(self.operation_timeout, self.obj.interact(f))
            .await
            .map_err(|_| DatabaseError::query_timeout(self.operation_timeout.as_millis() as u64))?
            .map_err(interact_error)?
            .map_err(DatabaseError::from)
    }
}

fn to_sql_value(value: &DatabaseValue) -> Value {
    match value {
        DatabaseValue::Null => Value::Null,
        DatabaseValue::Bool(v) => Value::Integer(i64::from(*v)),
        DatabaseValue::Int(v) => Value::Integer(i64::from(*v)),
        DatabaseValue::Long(v) => Value::Integer(*v),
        DatabaseValue::Float(v) => Value::Real(f64::from(*v)),
        DatabaseValue::Double(v) => Value::Real(*v),
        DatabaseValue::String(v) => Value::Text(v.clone()),
        DatabaseValue::Bytes(v) => Value::Blob(v.clone()),
        DatabaseValue::Timestamp(v) => Value::Text(v.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
    }
}

fn from_sql_value(value: ValueRef<'_>) -> DatabaseValue {
    match value {
        ValueRef::Null => DatabaseValue::Null,
        ValueRef::Integer(v) => DatabaseValue::Long(v),
        ValueRef::Real(v) => DatabaseValue::Double(v),
        ValueRef::Text(v) => DatabaseValue::String(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => DatabaseValue::Bytes(v.to_vec()),
    }
}

fn is_insert(sql: &str) -> bool {
    sql.trim_start()
        .get(..6)
        .is_some_and(|k| k.eq_ignore_ascii_case("insert"))
}

#[async_trait]
impl Connection for SqliteConnection {
    async fn execute(&mut self, stmt: &Statement) -> Result<ExecResult> {
        let sql = stmt.sql.clone();
        let args: Vec<Value> = stmt.args.iter().map(to_sql_value).collect();
        let insert = is_insert(&sql);

        let (rows_affected, last_id) = self
            .interact(move |conn| {
                let mut prepared = conn.prepare_cached(&sql)?;
                let readonly = prepared.readonly();
                let affected = if prepared.column_count() > 0 {
                    // Statements with a result (RETURNING, PRAGMA) are stepped to completion.
                    let mut rows = prepared.query(params_from_iter(args))?;
                    while rows.next()?.is_some() {}
                    drop(rows);
                    // changes() still holds the count of the last write.
                    if readonly {
                        0
                    } else {
                        conn.changes() as usize
                    }
                } else {
                    prepared.execute(params_from_iter(args))?
                };
                Ok((affected as u64, conn.last_insert_rowid()))
            })
            .await?;

        Ok(ExecResult {
            rows_affected,
            last_insert_id: (insert && rows_affected > 0).then_some(last_id),
        })
    }

    async fn query(&mut self, stmt: &Statement) -> Result<Box<dyn RowStream>> {
        let sql = stmt.sql.clone();
        let args: Vec<Value> = stmt.args.iter().map(to_sql_value).collect();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (rows_tx, rows_rx) = mpsc::channel(ROW_BUFFER);

        let obj = self.obj.clone();
        let producer = tokio::spawn(async move {
            obj.interact(move |conn| produce_rows(conn, &sql, args, ready_tx, rows_tx))
                .await
        });

        let ready = tokio::time::timeout(self.operation_timeout, ready_rx)
            .await
            .map_err(|_| DatabaseError::query_timeout(self.operation_timeout.as_millis() as u64))?;
        match ready {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = producer.await;
                return Err(e);
            }
            Err(_) => {
                // The producer never ran; report why.
                return Err(match producer.await {
                    Ok(Err(e)) => interact_error(e),
                    Ok(Ok(())) => DatabaseError::other("row producer stopped before starting"),
                    Err(e) => DatabaseError::other(format!("row producer failed: {}", e)),
                });
            }
        }

        Ok(Box::new(SqliteRowStream {
            rows: Some(rows_rx),
            producer: Some(producer),
            operation_timeout: self.operation_timeout,
        }))
    }

    async fn begin(&mut self) -> Result<()> {
        self.interact(|conn| conn.execute_batch("BEGIN TRANSACTION"))
            .await
    }

    async fn commit(&mut self) -> Result<()> {
        self.interact(|conn| conn.execute_batch("COMMIT")).await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.interact(|conn| conn.execute_batch("ROLLBACK")).await
    }
}

/// Step a query on the blocking pool, sending each row to `rows_tx`
fn produce_rows(
    conn: &mut rusqlite::Connection,
    sql: &str,
    args: Vec<Value>,
    ready: oneshot::Sender<Result<()>>,
    rows_tx: mpsc::Sender<Result<DatabaseRow>>,
) {
    let mut prepared = match conn.prepare_cached(sql) {
        Ok(p) => p,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };
    let columns: Arc<[String]> = prepared
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    let width = columns.len();
    let mut rows = match prepared.query(params_from_iter(args)) {
        Ok(r) => r,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }

    loop {
        let item = match rows.next() {
            Ok(Some(row)) => (0..width)
                .map(|i| row.get_ref(i).map(from_sql_value))
                .collect::<rusqlite::Result<Vec<_>>>()
                .map(|values| DatabaseRow::new(columns.clone(), values))
                .map_err(DatabaseError::from),
            Ok(None) => break,
            Err(e) => Err(e.into()),
        };
        let failed = item.is_err();
        // A closed receiver means the consumer is gone.
        if rows_tx.blocking_send(item).is_err() || failed {
            break;
        }
    }
}

struct SqliteRowStream {
    rows: Option<mpsc::Receiver<Result<DatabaseRow>>>,
    producer: Option<JoinHandle<std::result::Result<(), InteractError>>>,
    operation_timeout: Duration,
}

impl SqliteRowStream {
    async fn finish(&mut self) -> Result<()> {
        self.rows = None;
        match self.producer.take() {
            Some(handle) => match handle.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(interact_error(e)),
                Err(e) => Err(DatabaseError::other(format!("row producer failed: {}", e))),
            },
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RowStream for SqliteRowStream {
    async fn next_row(&mut self) -> Result<Option<DatabaseRow>> {
        let Some(rows) = self.rows.as_mut() else {
            return Ok(None);
        };
        let next = tokio::time::timeout(self.operation_timeout, rows.recv())
            .await
            .map_err(|_| DatabaseError::query_timeout(self.operation_timeout.as_millis() as u64))?;
        match next {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => {
                let _ = self.finish().await;
                Err(e)
            }
            None => {
                self.finish().await?;
                Ok(None)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.finish().await
    }
}
