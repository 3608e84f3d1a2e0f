//! # Heartbeat Service
//!
//! One instance per process, shared by every `Semaphore` in that process.
//! Owns a background ticker that upserts the process's liveness row and
//! reaps expired liveness rows, and publishes lifecycle events (`failed`,
//! `closed`) to subscribed semaphores.
//!
//! Modeled on `src/pg_worker.rs::PgWorkerClient`'s heartbeat upsert and
//! stop-signal polling, with the background thread replaced by a
//! `tokio::spawn` + `tokio::time::interval` task (the idiom this
//! codebase's `src/dashboard/mod.rs` uses for its own periodic
//! maintenance loops) so the beater lives on the ambient runtime instead
//! of an OS thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, warn};

use crate::config::TableDescriptor;
use crate::error::Result;

type Callback = Box<dyn Fn() + Send + Sync>;

struct Subscriber {
    on_error: Callback,
    on_close: Callback,
}

/// Process-wide pulse. Acquired by name via [`HeartbeatService::acquire`];
/// all acquisitions for the same (pool, table descriptor, owner) within a
/// process share one instance, per §4.2's lifecycle rules.
pub struct HeartbeatService {
    pool: PgPool,
    descriptor: TableDescriptor,
    owner: String,
    interval: Duration,
    failed: AtomicBool,
    last_run_millis: AtomicU64,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_subscriber_id: AtomicU64,
    beater: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

fn registry() -> &'static Mutex<HashMap<String, std::sync::Arc<HeartbeatService>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, std::sync::Arc<HeartbeatService>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

impl HeartbeatService {
    /// Acquire the shared heartbeat service for `owner` against `pool` and
    /// `descriptor`. First acquisition performs schema-tolerant row
    /// creation and spawns the background beater; subsequent acquisitions
    /// from the same process attach to the existing instance.
    pub async fn acquire(
        pool: PgPool,
        descriptor: TableDescriptor,
        owner: String,
        interval: Duration,
    ) -> Result<std::sync::Arc<HeartbeatService>> {
        let key = format!("{}::{}::{}", pool_identity(&pool), descriptor.heartbeats_table, owner);
        {
            let reg = registry().lock().unwrap();
            if let Some(existing) = reg.get(&key) {
                return Ok(std::sync::Arc::clone(existing));
            }
        }

        let service = std::sync::Arc::new(HeartbeatService {
            pool: pool.clone(),
            descriptor: descriptor.clone(),
            owner: owner.clone(),
            interval,
            failed: AtomicBool::new(false),
            last_run_millis: AtomicU64::new(0),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(0),
            beater: AsyncMutex::new(None),
        });

        let insert_sql = format!(
            "INSERT INTO {table} (owner, interval_ms, last_heartbeat) VALUES ($1, $2, {now})
             ON CONFLICT (owner) DO UPDATE SET interval_ms = EXCLUDED.interval_ms, last_heartbeat = {now}",
            table = descriptor.heartbeats_table,
            now = descriptor.current_time_expr,
        );
        sqlx::query(&insert_sql)
            .bind(&owner)
            .bind(interval.as_millis() as i64)
            .execute(&pool)
            .await?;
        service.last_run_millis.store(now_millis(), Ordering::SeqCst);

        let handle = service.clone().spawn_beater();
        *service.beater.lock().await = Some(handle);

        registry().lock().unwrap().insert(key, std::sync::Arc::clone(&service));
        Ok(service)
    }

    fn spawn_beater(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // No catch-up burst: reschedule relative to completion, not the
            // missed schedule, per §4.2.
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately; the insert above already beat once
            loop {
                ticker.tick().await;
                if self.failed.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = self.beat_once().await {
                    error!(owner = %self.owner, error = %e, "heartbeat beat failed");
                    self.mark_failed();
                    break;
                }
            }
        })
    }

    async fn beat_once(&self) -> Result<()> {
        let sql = format!(
            "UPDATE {table} SET last_heartbeat = {now} WHERE owner = $1",
            table = self.descriptor.heartbeats_table,
            now = self.descriptor.current_time_expr,
        );
        let result = sqlx::query(&sql).bind(&self.owner).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            // This process has been declared dead by a peer. Fatal and
            // unrecoverable for every semaphore hosted here.
            warn!(owner = %self.owner, "heartbeat update affected 0 rows; process declared dead by a peer");
            self.mark_failed();
            return Ok(());
        }
        self.last_run_millis.store(now_millis(), Ordering::SeqCst);
        debug!(owner = %self.owner, "heartbeat ok");
        Ok(())
    }

    fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
        let subs = self.subscribers.lock().unwrap();
        for sub in subs.values() {
            (sub.on_error)();
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Register `{on_error, on_close}` hooks. Returns a subscription id to
    /// pass to [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(
        &self,
        on_error: impl Fn() + Send + Sync + 'static,
        on_close: impl Fn() + Send + Sync + 'static,
    ) -> u64 {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().unwrap().insert(
            id,
            Subscriber {
                on_error: Box::new(on_error),
                on_close: Box::new(on_close),
            },
        );
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().unwrap().remove(&id);
    }

    /// Whether an acquire transaction with `remaining` budget left should
    /// piggyback a heartbeat UPDATE: the remaining budget must exceed one
    /// beat duration, and at least half an interval must have passed since
    /// the last successful beat.
    pub fn should_piggyback(&self, remaining: Duration) -> bool {
        if remaining <= self.interval {
            return false;
        }
        let last_run = self.last_run_millis.load(Ordering::SeqCst);
        let elapsed = now_millis().saturating_sub(last_run);
        elapsed as u128 >= (self.interval.as_millis() / 2)
    }

    /// The UPDATE statement text for a piggybacked beat, parameterized on
    /// `$1 = owner`. Callers bind `owner()` and run it inside their own
    /// transaction.
    pub fn piggyback_sql(&self) -> String {
        format!(
            "UPDATE {table} SET last_heartbeat = {now} WHERE owner = $1",
            table = self.descriptor.heartbeats_table,
            now = self.descriptor.current_time_expr,
        )
    }

    /// Record that a piggybacked beat committed. Only call after the
    /// enclosing transaction has actually committed (§9: "only record
    /// `last_run` after commit").
    pub fn record_piggyback(&self) {
        self.last_run_millis.store(now_millis(), Ordering::SeqCst);
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Delete HEARTBEATS rows whose `last_heartbeat` is older than
    /// `threshold`. Run inside the caller's transaction (the Dead-Owner
    /// Reclaimer calls this transactionally; see `reclaim.rs`).
    pub async fn remove_dead_heartbeat_rows(
        tx: &mut Transaction<'_, Postgres>,
        descriptor: &TableDescriptor,
        threshold: Duration,
    ) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {table} WHERE last_heartbeat < {now} - ($1 || ' milliseconds')::interval",
            table = descriptor.heartbeats_table,
            now = descriptor.current_time_expr,
        );
        let result = sqlx::query(&sql)
            .bind(threshold.as_millis().to_string())
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected())
    }

    /// Best-effort clean shutdown: invoke `on_close` on every subscriber,
    /// delete this process's heartbeat row, stop the beater. Never raises.
    pub async fn close(&self) {
        let subs = std::mem::take(&mut *self.subscribers.lock().unwrap());
        for sub in subs.values() {
            (sub.on_close)();
        }

        let sql = format!("DELETE FROM {table} WHERE owner = $1", table = self.descriptor.heartbeats_table);
        if let Err(e) = sqlx::query(&sql).bind(&self.owner).execute(&self.pool).await {
            warn!(owner = %self.owner, error = %e, "failed to delete heartbeat row on shutdown");
        }

        if let Some(handle) = self.beater.lock().await.take() {
            handle.abort();
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A stable-enough identity for a pool to key the process-wide registry by.
/// `PgPool` doesn't expose its DSN, so this keys on the pool's connect
/// options debug representation, which is stable for the lifetime of the
/// pool and distinct across pools pointed at different databases.
fn pool_identity(pool: &PgPool) -> String {
    format!("{:?}", pool.connect_options())
}
