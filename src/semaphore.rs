//! # Semaphore Instance
//!
//! One per (process, semaphore-name). Coordinates permit rows, per-owner
//! rows, and the Heartbeat Service; runs dead-owner reclamation when
//! contention arises (§4.3).
//!
//! Construction bootstraps the `semaphores` and `permits_by_owner` rows
//! the way `src/db.rs::create_search_job` bootstraps a job plus its
//! `work_blocks` in one transaction. The acquire loop generalizes
//! `src/pg_worker.rs`'s shared-atomics-and-background-heartbeat pattern:
//! where that client shares `Arc<AtomicU64>` counters between a search
//! thread and a heartbeat thread, this one shares an in-memory owned-permit
//! counter between callers of `acquire`/`release`, serialized by the
//! per-name lock from `intern.rs` instead of raw atomics, because the
//! counter's consistency depends on the database round trip that produced
//! it, not just the increment itself.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sqlx::{PgPool, Row};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{SemaphoreOptions, TableDescriptor};
use crate::dbclient::TxnClient;
use crate::diagnostics::SemaphoreState;
use crate::error::{Result, SemaphoreError};
use crate::heartbeat::HeartbeatService;
use crate::intern::{self, NameLock};
use crate::reclaim;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptOutcome {
    Acquired,
    Blocked,
}

/// A counting semaphore backed by database rows, shared across processes.
pub struct Semaphore {
    client: TxnClient,
    descriptor: TableDescriptor,
    name: String,
    owner: String,
    options: SemaphoreOptions,
    heartbeat: Arc<HeartbeatService>,
    subscription_id: u64,
    lock: Arc<NameLock>,
    owned: AtomicI64,
    healthy: Arc<AtomicBool>,
}

impl Semaphore {
    /// Construct (or attach to) the semaphore named `name`. Bootstraps the
    /// `semaphores` row (inserting it with `total = available = N` if
    /// absent; validating `total_permits == N` if present and `strict`)
    /// and this process's `permits_by_owner` row, then subscribes to the
    /// shared Heartbeat Service.
    pub async fn new(
        pool: PgPool,
        descriptor: TableDescriptor,
        name: impl Into<String>,
        owner: impl Into<String>,
        options: SemaphoreOptions,
    ) -> Result<Arc<Semaphore>> {
        let name = name.into();
        let owner = owner.into();
        let client = TxnClient::new(pool.clone());

        let heartbeat = HeartbeatService::acquire(
            pool,
            descriptor.clone(),
            owner.clone(),
            options.heartbeat_interval,
        )
        .await?;

        // Step 1+2: bootstrap the semaphores row; one retry on a unique
        // violation (a race with a concurrent constructor for the same
        // name).
        let mut attempted_retry = false;
        loop {
            let deadline = Instant::now() + options.query_timeout;
            match bootstrap_semaphore_row(&client, &descriptor, &name, &owner, options.total_permits, options.strict, deadline).await {
                Ok(()) => break,
                Err(e) if e.is_unique_violation() && !attempted_retry => {
                    attempted_retry = true;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        // Step 3: bootstrap this process's permits_by_owner row.
        let deadline = Instant::now() + options.query_timeout;
        bootstrap_owner_row(&client, &descriptor, &name, &owner, deadline).await?;

        let lock = intern::intern(&name);
        let healthy = Arc::new(AtomicBool::new(true));

        let healthy_on_error = Arc::clone(&healthy);
        let name_for_log = name.clone();
        let owner_for_log = owner.clone();
        let healthy_on_close = Arc::clone(&healthy);
        let subscription_id = heartbeat.subscribe(
            move || {
                warn!(semaphore = %name_for_log, owner = %owner_for_log, "heartbeat failed; marking semaphore unhealthy");
                healthy_on_error.store(false, Ordering::SeqCst);
            },
            move || {
                healthy_on_close.store(false, Ordering::SeqCst);
            },
        );

        info!(semaphore = %name, owner = %owner, total_permits = options.total_permits, "semaphore instance ready");

        Ok(Arc::new(Semaphore {
            client,
            descriptor,
            name,
            owner,
            options,
            heartbeat,
            subscription_id,
            lock,
            owned: AtomicI64::new(0),
            healthy,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst) && !self.heartbeat.is_failed()
    }

    /// Reserve `k` permits for this process before `deadline`. Never
    /// reserves partially: returns `true` iff all `k` were granted in a
    /// single transaction, `false` if the deadline passed first.
    pub async fn acquire(&self, k: i64, deadline: Instant) -> Result<bool> {
        if k < 1 {
            return Err(SemaphoreError::ConstraintViolation {
                detail: format!("acquire requires k >= 1, got {k}"),
            });
        }

        loop {
            if !self.is_healthy() {
                return Err(SemaphoreError::HeartbeatFailed);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }

            let guard = self.lock.mutex.lock().await;
            let txn_deadline = deadline.min(Instant::now() + self.options.query_timeout);
            let outcome = self.try_acquire_txn(k, txn_deadline).await;
            drop(guard);

            // A per-attempt transaction times out against `txn_deadline`
            // (the per-statement query timeout), which is shorter than
            // the overall acquire `deadline` whenever a row is lock-
            // contended for longer than `query_timeout`. That's still
            // within the caller's budget, so retry rather than
            // propagating: only report failure once the overall
            // deadline itself has actually passed (§4.3, §7).
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(SemaphoreError::Timeout) => {
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            match outcome {
                AttemptOutcome::Acquired => {
                    self.owned.fetch_add(k, Ordering::SeqCst);
                    debug!(semaphore = %self.name, k, "acquired");
                    return Ok(true);
                }
                AttemptOutcome::Blocked => {
                    if !self.run_reclamation_round(k, deadline).await? {
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Step 4 of the acquire loop: dispatch the async cleanup, then the
    /// synchronous targeted reclamation, then back off. Returns `false`
    /// when the caller should give up immediately (the cleanup task
    /// itself timed out), `true` when the caller should loop again
    /// (whether or not permits were actually freed).
    async fn run_reclamation_round(&self, k: i64, deadline: Instant) -> Result<bool> {
        let join_wait = deadline
            .saturating_duration_since(Instant::now())
            .min(Duration::from_secs(60));

        let cleanup_client = self.client.clone();
        let cleanup_descriptor = self.descriptor.clone();
        let cleanup_threshold = self.options.heartbeat_deadness_threshold();
        let cleanup_deadline = Instant::now() + Duration::from_secs(60);
        let cleanup_handle = tokio::spawn(async move {
            reclaim::remove_dead_heartbeat_and_not_owner_rows(
                &cleanup_client,
                &cleanup_descriptor,
                cleanup_threshold,
                cleanup_deadline,
            )
            .await
        });

        if tokio::time::timeout(join_wait, cleanup_handle).await.is_err() {
            // The cleanup task itself timed out (didn't even finish within
            // its own bound). It keeps running in the background — we
            // don't abort it — but this acquire attempt gives up.
            warn!(semaphore = %self.name, "dead-owner cleanup task timed out; giving up this acquire");
            return Ok(false);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        let reclaim_deadline = deadline.min(Instant::now() + self.options.query_timeout);
        let reclaimed =
            reclaim::release_dead_owner_permits(&self.client, &self.descriptor, &self.name, k, reclaim_deadline).await?;
        if reclaimed > 0 {
            debug!(semaphore = %self.name, reclaimed, "reclaimed dead-owner permits, retrying acquire");
            self.lock.notify.notify_waiters();
            return Ok(true);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        let jitter_ms = rand::thread_rng().gen_range(0..=self.options.acquire_poll_interval.as_millis().max(1) as u64);
        let wait = remaining.min(Duration::from_millis(jitter_ms));
        let _ = tokio::time::timeout(wait, self.lock.notify.notified()).await;
        Ok(true)
    }

    /// One attempt at the transactional gate: the conditional
    /// `available_permits -= k` UPDATE, the owner-row UPDATE, and an
    /// optional piggybacked heartbeat, all in one transaction (§4.3).
    async fn try_acquire_txn(&self, k: i64, deadline: Instant) -> Result<AttemptOutcome> {
        let name = self.name.clone();
        let owner = self.owner.clone();
        let descriptor = self.descriptor.clone();
        let heartbeat = Arc::clone(&self.heartbeat);

        let remaining = deadline.saturating_duration_since(Instant::now());
        let should_piggyback = heartbeat.should_piggyback(remaining);
        let piggyback_sql = should_piggyback.then(|| heartbeat.piggyback_sql());

        let outcome = self
            .client
            .run(
                deadline,
                Box::new(move |tx, _remaining| {
                    Box::pin(async move {
                        let gate_sql = format!(
                            "UPDATE {semaphores} SET available_permits = available_permits - $1, \
                             last_modified_by = $2, last_modified_at = {now} \
                             WHERE name = $3 AND available_permits >= $1",
                            semaphores = descriptor.semaphores_table,
                            now = descriptor.current_time_expr,
                        );
                        let gate_result = sqlx::query(&gate_sql)
                            .bind(k)
                            .bind(&owner)
                            .bind(&name)
                            .execute(&mut **tx)
                            .await?;
                        match gate_result.rows_affected() {
                            0 => return Ok(AttemptOutcome::Blocked),
                            1 => {}
                            n => {
                                return Err(SemaphoreError::IntegrityViolation {
                                    detail: format!("available_permits gate affected {n} rows for '{name}'"),
                                })
                            }
                        }

                        let owner_sql = format!(
                            "UPDATE {permits} SET owned_permits = owned_permits + $1, last_modified_at = {now} \
                             WHERE owner = $2 AND name = $3",
                            permits = descriptor.permits_by_owner_table,
                            now = descriptor.current_time_expr,
                        );
                        let owner_result = sqlx::query(&owner_sql)
                            .bind(k)
                            .bind(&owner)
                            .bind(&name)
                            .execute(&mut **tx)
                            .await?;
                        if owner_result.rows_affected() != 1 {
                            return Err(SemaphoreError::IntegrityViolation {
                                detail: format!(
                                    "owner row update affected {} rows for owner '{owner}' name '{name}'",
                                    owner_result.rows_affected()
                                ),
                            });
                        }

                        if let Some(sql) = piggyback_sql.as_ref() {
                            sqlx::query(sql).bind(&owner).execute(&mut **tx).await?;
                        }

                        Ok(AttemptOutcome::Acquired)
                    })
                }),
            )
            .await?;

        if should_piggyback && matches!(outcome, AttemptOutcome::Acquired) {
            self.heartbeat.record_piggyback();
        }
        Ok(outcome)
    }

    /// Release up to `k` of this process's held permits. Non-cancellable:
    /// runs on a detached task bounded by a fixed ceiling rather than the
    /// caller's own deadline (see `DESIGN.md`'s open-question note).
    pub async fn release(&self, k: i64) -> Result<()> {
        if k < 1 {
            return Err(SemaphoreError::ConstraintViolation {
                detail: format!("release requires k >= 1, got {k}"),
            });
        }
        let owned_now = self.owned.load(Ordering::SeqCst);
        if k > owned_now {
            return Err(SemaphoreError::IntegrityViolation {
                detail: format!("release({k}) exceeds held permits ({owned_now}) for '{}'", self.name),
            });
        }

        let name = self.name.clone();
        let owner = self.owner.clone();
        let descriptor = self.descriptor.clone();

        self.client
            .run_uncancellable(
                Duration::from_secs(30),
                Box::new(move |tx, _remaining| {
                    Box::pin(async move {
                        let sem_sql = format!(
                            "UPDATE {semaphores} SET available_permits = LEAST(available_permits + $1, total_permits) \
                             WHERE name = $2",
                            semaphores = descriptor.semaphores_table,
                        );
                        sqlx::query(&sem_sql).bind(k).bind(&name).execute(&mut **tx).await?;

                        let owner_sql = format!(
                            "UPDATE {permits} SET owned_permits = owned_permits - $1 \
                             WHERE owner = $2 AND name = $3 AND owned_permits >= $1",
                            permits = descriptor.permits_by_owner_table,
                        );
                        let result = sqlx::query(&owner_sql)
                            .bind(k)
                            .bind(&owner)
                            .bind(&name)
                            .execute(&mut **tx)
                            .await?;
                        if result.rows_affected() != 1 {
                            return Err(SemaphoreError::IntegrityViolation {
                                detail: format!("release({k}) affected {} owner rows for '{name}'", result.rows_affected()),
                            });
                        }
                        Ok(())
                    })
                }),
            )
            .await?;

        self.owned.fetch_sub(k, Ordering::SeqCst);
        self.lock.notify.notify_waiters();
        debug!(semaphore = %self.name, k, "released");
        Ok(())
    }

    /// Release all permits currently held by this process for this
    /// semaphore.
    pub async fn release_all(&self) -> Result<()> {
        let owned = self.owned.load(Ordering::SeqCst);
        if owned == 0 {
            return Ok(());
        }
        self.release(owned).await
    }

    /// Set `total_permits := n`, adjusting `available_permits` by the same
    /// delta.
    pub async fn update_permits(&self, n: i64) -> Result<()> {
        if n < 0 {
            return Err(SemaphoreError::ConstraintViolation {
                detail: format!("update_permits requires n >= 0, got {n}"),
            });
        }
        let name = self.name.clone();
        let descriptor = self.descriptor.clone();
        let deadline = Instant::now() + self.options.query_timeout;
        self.client
            .run(
                deadline,
                Box::new(move |tx, _remaining| {
                    Box::pin(async move {
                        let sql = format!(
                            "UPDATE {semaphores} SET available_permits = available_permits + ($1 - total_permits), \
                             total_permits = $1 WHERE name = $2",
                            semaphores = descriptor.semaphores_table,
                        );
                        let result = sqlx::query(&sql).bind(n).bind(&name).execute(&mut **tx).await?;
                        if result.rows_affected() != 1 {
                            return Err(SemaphoreError::IntegrityViolation {
                                detail: format!("update_permits target row missing for '{name}'"),
                            });
                        }
                        Ok(())
                    })
                }),
            )
            .await?;
        self.lock.notify.notify_waiters();
        Ok(())
    }

    /// Decrease both `total_permits` and `available_permits` by `k`,
    /// failing if `total_permits < k`.
    pub async fn reduce_permits(&self, k: i64) -> Result<()> {
        if k < 1 {
            return Err(SemaphoreError::ConstraintViolation {
                detail: format!("reduce_permits requires k >= 1, got {k}"),
            });
        }
        let name = self.name.clone();
        let descriptor = self.descriptor.clone();
        let deadline = Instant::now() + self.options.query_timeout;
        self.client
            .run(
                deadline,
                Box::new(move |tx, _remaining| {
                    Box::pin(async move {
                        let sql = format!(
                            "UPDATE {semaphores} SET available_permits = available_permits - $1, \
                             total_permits = total_permits - $1 WHERE name = $2 AND total_permits >= $1",
                            semaphores = descriptor.semaphores_table,
                        );
                        let result = sqlx::query(&sql).bind(k).bind(&name).execute(&mut **tx).await?;
                        if result.rows_affected() != 1 {
                            return Err(SemaphoreError::IntegrityViolation {
                                detail: format!("reduce_permits({k}) would underflow total_permits for '{name}'"),
                            });
                        }
                        Ok(())
                    })
                }),
            )
            .await
    }

    /// Increase both `total_permits` and `available_permits` by `k`.
    pub async fn increase_permits(&self, k: i64) -> Result<()> {
        if k < 1 {
            return Err(SemaphoreError::ConstraintViolation {
                detail: format!("increase_permits requires k >= 1, got {k}"),
            });
        }
        let name = self.name.clone();
        let descriptor = self.descriptor.clone();
        let deadline = Instant::now() + self.options.query_timeout;
        self.client
            .run(
                deadline,
                Box::new(move |tx, _remaining| {
                    Box::pin(async move {
                        let sql = format!(
                            "UPDATE {semaphores} SET available_permits = available_permits + $1, \
                             total_permits = total_permits + $1 WHERE name = $2",
                            semaphores = descriptor.semaphores_table,
                        );
                        let result = sqlx::query(&sql).bind(k).bind(&name).execute(&mut **tx).await?;
                        if result.rows_affected() != 1 {
                            return Err(SemaphoreError::IntegrityViolation {
                                detail: format!("increase_permits target row missing for '{name}'"),
                            });
                        }
                        Ok(())
                    })
                }),
            )
            .await?;
        self.lock.notify.notify_waiters();
        Ok(())
    }

    pub async fn available_permits(&self) -> Result<i64> {
        let sql = format!(
            "SELECT available_permits FROM {} WHERE name = $1",
            self.descriptor.semaphores_table
        );
        let row = sqlx::query(&sql).bind(&self.name).fetch_one(self.client.pool()).await?;
        Ok(row.try_get("available_permits")?)
    }

    pub async fn total_permits(&self) -> Result<i64> {
        let sql = format!("SELECT total_permits FROM {} WHERE name = $1", self.descriptor.semaphores_table);
        let row = sqlx::query(&sql).bind(&self.name).fetch_one(self.client.pool()).await?;
        Ok(row.try_get("total_permits")?)
    }

    /// Permits this process currently holds, from the in-memory counter
    /// maintained by `acquire`/`release` (protected by the per-name lock).
    pub fn permits_owned(&self) -> i64 {
        self.owned.load(Ordering::SeqCst)
    }

    /// Reclaim up to `wish` permits held by dead owners of this semaphore,
    /// returning them to `available_permits` (§4.4). Exposed directly on
    /// the instance per the §4.3 operations table, alongside the internal
    /// use of the same reclaimer from the acquire loop's contention path.
    pub async fn release_dead_owner_permits(&self, wish: i64, deadline: Instant) -> Result<i64> {
        reclaim::release_dead_owner_permits(&self.client, &self.descriptor, &self.name, wish, deadline).await
    }

    pub async fn diagnostics(&self) -> Result<SemaphoreState> {
        Ok(SemaphoreState {
            name: self.name.clone(),
            total: self.total_permits().await?,
            available: self.available_permits().await?,
            owned_by_me: self.permits_owned(),
            is_healthy: self.is_healthy(),
            query_timeout_ms: self.options.query_timeout.as_millis() as u64,
        })
    }

    /// Release all held permits, unsubscribe from the Heartbeat Service,
    /// mark the instance unhealthy. Idempotent; best-effort — never
    /// raises.
    pub async fn close(&self) {
        if !self.healthy.swap(false, Ordering::SeqCst) {
            return; // already closed
        }
        let owned = self.owned.load(Ordering::SeqCst);
        if owned > 0 {
            if let Err(e) = self.release(owned).await {
                warn!(semaphore = %self.name, error = %e, "best-effort release during close failed");
            }
        }
        self.heartbeat.unsubscribe(self.subscription_id);
    }
}

async fn bootstrap_semaphore_row(
    client: &TxnClient,
    descriptor: &TableDescriptor,
    name: &str,
    owner: &str,
    total_permits: i64,
    strict: bool,
    deadline: Instant,
) -> Result<()> {
    let descriptor = descriptor.clone();
    let name = name.to_string();
    let owner = owner.to_string();
    client
        .run(
            deadline,
            Box::new(move |tx, _remaining| {
                Box::pin(async move {
                    let select_sql = format!(
                        "SELECT total_permits FROM {} WHERE name = $1",
                        descriptor.semaphores_table
                    );
                    let rows = sqlx::query(&select_sql).bind(&name).fetch_all(&mut **tx).await?;
                    if rows.len() > 1 {
                        return Err(SemaphoreError::IntegrityViolation {
                            detail: format!("multiple semaphores rows for name '{name}'"),
                        });
                    }
                    if let Some(row) = rows.into_iter().next() {
                        let existing_total: i64 = row.try_get("total_permits")?;
                        if strict && existing_total != total_permits {
                            return Err(SemaphoreError::ConstraintViolation {
                                detail: format!(
                                    "max reservations different: existing total_permits={existing_total}, requested={total_permits}"
                                ),
                            });
                        }
                    } else {
                        let insert_sql = format!(
                            "INSERT INTO {table} (name, available_permits, total_permits, last_modified_by, last_modified_at) \
                             VALUES ($1, $2, $2, $3, {now})",
                            table = descriptor.semaphores_table,
                            now = descriptor.current_time_expr,
                        );
                        sqlx::query(&insert_sql)
                            .bind(&name)
                            .bind(total_permits)
                            .bind(&owner)
                            .execute(&mut **tx)
                            .await?;
                    }
                    Ok(())
                })
            }),
        )
        .await
}

async fn bootstrap_owner_row(
    client: &TxnClient,
    descriptor: &TableDescriptor,
    name: &str,
    owner: &str,
    deadline: Instant,
) -> Result<()> {
    let descriptor = descriptor.clone();
    let name = name.to_string();
    let owner = owner.to_string();
    client
        .run(
            deadline,
            Box::new(move |tx, _remaining| {
                Box::pin(async move {
                    let sql = format!(
                        "INSERT INTO {table} (name, owner, owned_permits, last_modified_at) VALUES ($1, $2, 0, {now}) \
                         ON CONFLICT (name, owner) DO NOTHING",
                        table = descriptor.permits_by_owner_table,
                        now = descriptor.current_time_expr,
                    );
                    sqlx::query(&sql).bind(&name).bind(&owner).execute(&mut **tx).await?;
                    Ok(())
                })
            }),
        )
        .await
}
