//! Statement logging
//!
//! Sessions hand a [`QueryEvent`] to their injected [`QueryLogger`] after every
//! statement. There is no global log level: each session carries its own
//! logger, chosen through `SessionOptions`.

use crate::core::error::DatabaseError;
use std::fmt;
use std::time::Duration;

/// Default threshold above which a statement is reported as slow
pub const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_millis(200);

/// One executed statement
#[derive(Debug)]
pub struct QueryEvent<'a> {
    /// Statement text as sent to the backend
    pub sql: &'a str,
    /// Number of bound arguments
    pub args: usize,
    /// Wall time spent executing
    pub elapsed: Duration,
    /// Rows affected (writes) or produced (reads), when known
    pub rows: Option<u64>,
    /// Failure, if the statement failed
    pub error: Option<&'a DatabaseError>,
    /// Whether the statement ran inside a transaction
    pub in_transaction: bool,
}

/// Sink for statement events
pub trait QueryLogger: Send + Sync + fmt::Debug {
    fn log(&self, event: &QueryEvent<'_>);
}

/// Logger that emits `tracing` events
#[derive(Debug, Clone)]
pub struct TracingLogger {
    slow_threshold: Duration,
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self {
            slow_threshold: DEFAULT_SLOW_THRESHOLD,
        }
    }
}

impl TracingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report statements slower than `threshold` at warn level
    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }
}

impl QueryLogger for TracingLogger {
    fn log(&self, event: &QueryEvent<'_>) {
        let elapsed_ms = event.elapsed.as_secs_f64() * 1000.0;
        match event.error {
            Some(err) => tracing::warn!(
                sql = event.sql,
                args = event.args,
                elapsed_ms,
                in_tx = event.in_transaction,
                error = %err,
                "Statement failed"
            ),
            None if event.elapsed >= self.slow_threshold => tracing::warn!(
                sql = event.sql,
                args = event.args,
                elapsed_ms,
                rows = event.rows,
                in_tx = event.in_transaction,
                "Slow statement"
            ),
            None => tracing::debug!(
                sql = event.sql,
                args = event.args,
                elapsed_ms,
                rows = event.rows,
                in_tx = event.in_transaction,
                "Statement executed"
            ),
        }
    }
}

/// Logger that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl QueryLogger for NoopLogger {
    fn log(&self, _event: &QueryEvent<'_>) {}
}
