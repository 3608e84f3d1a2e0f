//! # Dead-Owner Reclaimer
//!
//! Invoked by a `Semaphore`'s acquire loop when acquisition would
//! otherwise block (§4.4). Scans for permit-holding owners absent from
//! the heartbeat table and returns their permits to the pool.
//!
//! The single-transaction scoping with an exact-match DELETE guard is the
//! safety mechanism for P3 (at-most-one reclaim): two live peers may race
//! to reclaim the same dead owner, but at most one `DELETE ... WHERE
//! owned_permits = $3` can affect a row, so permits are returned at most
//! once. Grounded on `src/db/workers.rs::prune_stale_workers`'s interval
//! cutoff DELETE and `src/db.rs::create_search_job`'s multi-statement
//! transaction shape.

use std::time::Duration;

use sqlx::Row;
use tokio::time::Instant;
use tracing::debug;

use crate::config::TableDescriptor;
use crate::dbclient::TxnClient;
use crate::error::Result;
use crate::heartbeat::HeartbeatService;

/// Reap expired heartbeat rows; only if at least one was reaped, delete
/// `permits_by_owner` rows with zero owned permits whose owner no longer
/// has a heartbeat row. Returns the number of `permits_by_owner` rows
/// deleted.
pub async fn remove_dead_heartbeat_and_not_owner_rows(
    client: &TxnClient,
    descriptor: &TableDescriptor,
    heartbeat_threshold: Duration,
    deadline: Instant,
) -> Result<u64> {
    let descriptor = descriptor.clone();
    client
        .run(
            deadline,
            Box::new(move |tx, _remaining| {
                Box::pin(async move {
                    let reaped = HeartbeatService::remove_dead_heartbeat_rows(tx, &descriptor, heartbeat_threshold).await?;
                    if reaped == 0 {
                        return Ok(0);
                    }
                    let sql = format!(
                        "DELETE FROM {permits} p
                         WHERE p.owned_permits = 0
                           AND NOT EXISTS (SELECT 1 FROM {heartbeats} h WHERE h.owner = p.owner)",
                        permits = descriptor.permits_by_owner_table,
                        heartbeats = descriptor.heartbeats_table,
                    );
                    let result = sqlx::query(&sql).execute(&mut **tx).await?;
                    debug!(reaped_heartbeats = reaped, deleted_owner_rows = result.rows_affected(), "reaped dead owners");
                    Ok(result.rows_affected())
                })
            }),
        )
        .await
}

/// Reclaim up to `wish` permits held by dead owners of `name`, returning
/// them to `available_permits`. Returns the total number of permits
/// actually returned to the pool (may be less than `wish` if not enough
/// dead-owned permits exist, or 0 if a racing peer reclaimed them first).
pub async fn release_dead_owner_permits(
    client: &TxnClient,
    descriptor: &TableDescriptor,
    name: &str,
    wish: i64,
    deadline: Instant,
) -> Result<i64> {
    let descriptor = descriptor.clone();
    let name = name.to_string();
    client
        .run(
            deadline,
            Box::new(move |tx, _remaining| {
                Box::pin(async move {
                    let select_sql = format!(
                        "SELECT p.owner, p.owned_permits
                         FROM {permits} p
                         WHERE p.name = $1
                           AND p.owned_permits > 0
                           AND NOT EXISTS (SELECT 1 FROM {heartbeats} h WHERE h.owner = p.owner)
                         ORDER BY p.owner, p.owned_permits",
                        permits = descriptor.permits_by_owner_table,
                        heartbeats = descriptor.heartbeats_table,
                    );
                    let rows = sqlx::query(&select_sql).bind(&name).fetch_all(&mut **tx).await?;

                    let mut candidates = Vec::new();
                    let mut accumulated = 0i64;
                    for row in rows {
                        if accumulated >= wish {
                            break;
                        }
                        let owner: String = row.try_get("owner")?;
                        let owned: i64 = row.try_get("owned_permits")?;
                        accumulated += owned;
                        candidates.push((owner, owned));
                    }

                    let mut returned = 0i64;
                    for (owner, owned) in candidates {
                        let delete_sql = format!(
                            "DELETE FROM {permits} WHERE name = $1 AND owner = $2 AND owned_permits = $3",
                            permits = descriptor.permits_by_owner_table,
                        );
                        let result = sqlx::query(&delete_sql)
                            .bind(&name)
                            .bind(&owner)
                            .bind(owned)
                            .execute(&mut **tx)
                            .await?;
                        if result.rows_affected() != 1 {
                            // A racing peer already reclaimed this owner.
                            continue;
                        }

                        let release_sql = format!(
                            "UPDATE {semaphores} SET available_permits = LEAST(available_permits + $1, total_permits) WHERE name = $2",
                            semaphores = descriptor.semaphores_table,
                        );
                        sqlx::query(&release_sql).bind(owned).bind(&name).execute(&mut **tx).await?;
                        returned += owned;
                    }

                    debug!(name = %name, wish, returned, "reclaimed dead-owner permits");
                    Ok(returned)
                })
            }),
        )
        .await
}
