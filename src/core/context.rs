//! Cancellation and deadlines for terminal operations
//!
//! A [`Context`] travels with sessions, collections and selectors. Every
//! terminal operation runs under it: when the cancel signal fires the
//! operation returns [`DatabaseError::Cancelled`], when the deadline passes it
//! returns [`DatabaseError::QueryTimeout`]. Either way the in-flight future is
//! dropped, which releases its pooled connection.

use crate::core::error::{DatabaseError, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Cancellation signal and optional deadline
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: Option<watch::Receiver<bool>>,
    deadline: Option<Instant>,
    budget: Option<Duration>,
}

/// Fires the cancel signal of the contexts created with it
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Cancel every operation running under the paired context
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Context {
    /// Context that never cancels and has no deadline
    pub fn background() -> Self {
        Self::default()
    }

    /// Cancellable context plus the handle that cancels it
    pub fn with_cancel() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            cancel: Some(rx),
            ..Self::default()
        };
        (ctx, CancelHandle { tx: Arc::new(tx) })
    }

    /// Copy of this context whose deadline is at most `timeout` from now
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut ctx = self.with_deadline(Instant::now() + timeout);
        ctx.budget = Some(timeout);
        ctx
    }

    /// Copy of this context with a deadline no later than `deadline`
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            cancel: self.cancel.clone(),
            deadline: Some(deadline),
            budget: self.budget,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the cancel signal has fired
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Fail fast if the context is already cancelled or expired
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(DatabaseError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(self.timeout_error());
            }
        }
        Ok(())
    }

    /// Run `fut` until it completes or the context ends, whichever is first
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        if self.cancel.is_none() && self.deadline.is_none() {
            return fut.await;
        }

        let cancelled = async {
            match self.cancel.clone() {
                Some(mut rx) => {
                    if rx.wait_for(|c| *c).await.is_ok() {
                        return;
                    }
                    // Sender gone: the signal can never fire.
                    std::future::pending::<()>().await
                }
                None => std::future::pending::<()>().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => Err(DatabaseError::Cancelled),
            _ = expired => Err(self.timeout_error()),
            res = fut => res,
        }
    }

    fn timeout_error(&self) -> DatabaseError {
        DatabaseError::query_timeout(self.budget.map_or(0, |d| d.as_millis() as u64))
    }
}
