//! # dbsemaphore
//!
//! A counting semaphore whose state lives in three Postgres tables instead
//! of process memory, so that unrelated processes can coordinate access to
//! a shared resource pool and automatically reclaim permits held by peers
//! that have stopped heartbeating.
//!
//! ## Module Organization
//!
//! - [`error`] — the `SemaphoreError` taxonomy every fallible operation returns.
//! - [`config`] — `SemaphoreOptions` and `TableDescriptor`, the construction-time knobs.
//! - [`dbclient`] — `TxnClient`, the deadline-bounded transaction runner every component uses.
//! - [`heartbeat`] — `HeartbeatService`, the process-wide liveness beater.
//! - [`intern`] — the per-semaphore-name lock table serializing `acquire`/`release`.
//! - [`reclaim`] — dead-owner detection and permit reclamation.
//! - [`semaphore`] — `Semaphore`, the type applications construct and call.
//! - [`diagnostics`] — `SemaphoreState`, a point-in-time read model.
//!
//! ## Usage
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use dbsemaphore::{config::{SemaphoreOptions, TableDescriptor}, semaphore::Semaphore, ProcessId};
//! use sqlx::postgres::PgPoolOptions;
//!
//! let pool = PgPoolOptions::new().connect("postgres://localhost/mydb").await?;
//! let owner = ProcessId::generate().to_string();
//! let sem = Semaphore::new(pool, TableDescriptor::default(), "gpu-workers", owner, SemaphoreOptions::new(4)).await?;
//!
//! let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(30);
//! if sem.acquire(1, deadline).await? {
//!     // do work holding one permit
//!     sem.release(1).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dbclient;
pub mod diagnostics;
pub mod error;
pub mod heartbeat;
pub mod intern;
pub mod reclaim;
pub mod semaphore;

use rand::Rng;
use std::fmt;

/// Identifies one process as an owner in the `permits_by_owner` and
/// `heartbeats` tables: `{hostname}-{pid}-{random suffix}`. Two processes
/// on the same host never collide because a restarted process draws a
/// fresh suffix even if the OS reassigns its old pid.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessId(String);

impl ProcessId {
    /// Build a fresh identity: current hostname, this process's pid, and
    /// a random suffix.
    pub fn generate() -> Self {
        let host = hostname();
        let pid = std::process::id();
        let suffix: u32 = rand::thread_rng().gen();
        ProcessId(format!("{host}-{pid}-{suffix:08x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ProcessId> for String {
    fn from(id: ProcessId) -> String {
        id.0
    }
}

fn hostname() -> String {
    std::process::Command::new("hostname")
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_ids_are_unique() {
        let a = ProcessId::generate();
        let b = ProcessId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn process_id_contains_pid() {
        let id = ProcessId::generate();
        assert!(id.as_str().contains(&std::process::id().to_string()));
    }
}
