//! Point-in-time diagnostic snapshot of a semaphore, for callers that want
//! to expose liveness/capacity state without reaching into internals.
//!
//! Shaped after `src/dashboard/mod.rs::WorkerSummary`'s snapshot struct:
//! a flat, `Serialize`-able read model assembled on demand, not cached.

use serde::Serialize;

/// A snapshot of one semaphore's state as observed by one process.
#[derive(Debug, Clone, Serialize)]
pub struct SemaphoreState {
    pub name: String,
    pub total: i64,
    pub available: i64,
    /// Permits this process currently holds, per its in-memory counter.
    pub owned_by_me: i64,
    /// False once this process's heartbeat has failed or the instance was
    /// closed.
    pub is_healthy: bool,
    pub query_timeout_ms: u64,
}
