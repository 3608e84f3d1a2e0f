//! # Transactional DB Client
//!
//! Every higher component in this crate runs its database work through
//! [`TxnClient::run`]: a single operation that executes a caller-supplied
//! unit of work on a fresh transactional connection, bounded by an absolute
//! deadline. On normal return the transaction commits; on any error
//! (including the unit of work's own) it rolls back.
//!
//! Cancellation is cooperative — the deadline is the sole mechanism, same
//! as the `tokio::time::timeout` wrapping this codebase's other background
//! loops (see `src/dashboard/mod.rs` in the prior revision of this crate).
//! A non-interruptible variant, [`TxnClient::run_uncancellable`], exists
//! for the release path in `semaphore.rs` so that dropping the caller's
//! future mid-release can't leak permits.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use sqlx::{PgPool, Postgres, Transaction};

use crate::error::{Result, SemaphoreError};

/// A unit of work run inside a single transaction. Receives the open
/// transaction and the wall-clock budget remaining before the deadline
/// (already clamped to be non-negative).
pub type UnitOfWork<'c, T> =
    Box<dyn for<'t> FnOnce(&'t mut Transaction<'_, Postgres>, Duration) -> BoxFuture<'t, Result<T>> + Send + 'c>;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Thin wrapper around a `PgPool` that owns the deadline-bounded
/// transaction protocol shared by every component in this crate.
#[derive(Clone)]
pub struct TxnClient {
    pool: PgPool,
}

impl TxnClient {
    pub fn new(pool: PgPool) -> Self {
        TxnClient { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Per-statement timeout derived from the remaining budget: rounded
    /// down to whole seconds, clamped to at least 1.
    pub fn statement_timeout(remaining: Duration) -> Duration {
        let secs = remaining.as_secs().max(1);
        Duration::from_secs(secs)
    }

    /// Run `work` inside a transaction, bounded by `deadline`. Commits on
    /// `Ok`, rolls back on `Err`. Honors cancellation: if the caller's
    /// future is dropped (e.g. the enclosing `tokio::time::timeout`
    /// fires), the in-flight transaction is dropped and rolled back by
    /// `sqlx` on drop.
    pub async fn run<'c, T>(&'c self, deadline: tokio::time::Instant, work: UnitOfWork<'c, T>) -> Result<T>
    where
        T: Send + 'static,
    {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(SemaphoreError::Timeout);
        }

        let fut = async move {
            let mut tx = self.pool.begin().await?;
            Self::set_statement_timeout(&mut tx, remaining).await?;
            let result = work(&mut tx, remaining).await;
            match result {
                Ok(value) => {
                    tx.commit().await?;
                    Ok(value)
                }
                Err(e) => {
                    let _ = tx.rollback().await;
                    Err(e)
                }
            }
        };

        match tokio::time::timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(SemaphoreError::Timeout),
        }
    }

    /// Issue `SET LOCAL statement_timeout` for the transaction's lifetime,
    /// using [`statement_timeout`](Self::statement_timeout) derived from
    /// the budget remaining. `SET LOCAL` doesn't accept a bound parameter
    /// over the extended protocol, so the (internally computed, never
    /// user-supplied) millisecond value is formatted directly into the
    /// statement text.
    async fn set_statement_timeout(tx: &mut Transaction<'_, Postgres>, remaining: Duration) -> Result<()> {
        let ms = Self::statement_timeout(remaining).as_millis();
        let sql = format!("SET LOCAL statement_timeout = {ms}");
        sqlx::query(&sql).execute(&mut **tx).await?;
        Ok(())
    }

    /// Like [`run`](Self::run), but not subject to the caller's
    /// cancellation: the transaction is spawned onto a detached task and
    /// awaited, so dropping the calling future does not abort it. Still
    /// bounded — by `ceiling`, a fixed upper bound rather than a
    /// caller-supplied deadline (see the open question in `DESIGN.md`
    /// about unbounded release retries).
    pub async fn run_uncancellable<T>(&self, ceiling: Duration, work: UnitOfWork<'static, T>) -> Result<T>
    where
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        let handle = tokio::spawn(async move {
            let mut tx = pool.begin().await?;
            Self::set_statement_timeout(&mut tx, ceiling).await?;
            let result = work(&mut tx, ceiling).await;
            match result {
                Ok(value) => {
                    tx.commit().await?;
                    Ok(value)
                }
                Err(e) => {
                    let _ = tx.rollback().await;
                    Err(e)
                }
            }
        });

        match tokio::time::timeout(ceiling, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(_join_err)) => Err(SemaphoreError::Transport(sqlx::Error::WorkerCrashed)),
            Err(_elapsed) => Err(SemaphoreError::Transport(sqlx::Error::PoolTimedOut)),
        }
    }
}
