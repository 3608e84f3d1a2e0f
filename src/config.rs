//! Configuration surface: the options a `Semaphore` is constructed with,
//! and the table/column descriptor that parameterizes the SQL this crate
//! generates.
//!
//! Defaults follow §6 of `SPEC_FULL.md`. Each can be overridden via an
//! environment variable, following the `env`-first convention this
//! codebase's CLI layer already uses for `DATABASE_URL`.

use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Construction-time and per-call knobs for a `Semaphore`.
#[derive(Debug, Clone)]
pub struct SemaphoreOptions {
    /// Initial / expected capacity (`N` in §4.3).
    pub total_permits: i64,
    /// When true, construction fails if an existing row's `total_permits`
    /// disagrees with `total_permits` above.
    pub strict: bool,
    /// Per-statement ceiling passed down to the transactional DB client.
    pub query_timeout: Duration,
    /// Maximum wait between in-process acquire retries under contention.
    pub acquire_poll_interval: Duration,
    /// Heartbeat beat interval for the process-wide Heartbeat Service.
    pub heartbeat_interval: Duration,
    /// Multiple of `heartbeat_interval` after which an owner with no
    /// heartbeat row is considered dead.
    pub heartbeat_timeout_multiplier: u32,
}

impl SemaphoreOptions {
    /// `total_permits` with every other field at its documented default,
    /// each overridable via environment variable.
    pub fn new(total_permits: i64) -> Self {
        SemaphoreOptions {
            total_permits,
            strict: env_or("SEMAPHORE_STRICT", false),
            query_timeout: Duration::from_secs(env_or("SEMAPHORE_QUERY_TIMEOUT_SECONDS", 10)),
            acquire_poll_interval: Duration::from_millis(env_or(
                "SEMAPHORE_ACQUIRE_POLL_MILLIS",
                1000,
            )),
            heartbeat_interval: Duration::from_millis(env_or(
                "SEMAPHORE_HEARTBEAT_INTERVAL_MS",
                10_000,
            )),
            heartbeat_timeout_multiplier: env_or("SEMAPHORE_HEARTBEAT_TIMEOUT_MULTIPLIER", 4),
        }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn query_timeout(mut self, d: Duration) -> Self {
        self.query_timeout = d;
        self
    }

    pub fn acquire_poll_interval(mut self, d: Duration) -> Self {
        self.acquire_poll_interval = d;
        self
    }

    pub fn heartbeat_interval(mut self, d: Duration) -> Self {
        self.heartbeat_interval = d;
        self
    }

    pub fn heartbeat_timeout_multiplier(mut self, m: u32) -> Self {
        self.heartbeat_timeout_multiplier = m;
        self
    }

    /// Duration after which a heartbeat row is considered stale.
    pub fn heartbeat_deadness_threshold(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_timeout_multiplier
    }
}

/// Table and column name overrides, plus the dialect's current-time
/// expression. Defaults match the schema shipped in
/// `migrations/001_create_semaphore_tables.sql`.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    pub semaphores_table: String,
    pub permits_by_owner_table: String,
    pub heartbeats_table: String,
    /// SQL expression yielding the database's current time, e.g. `NOW()`.
    pub current_time_expr: String,
}

impl Default for TableDescriptor {
    fn default() -> Self {
        TableDescriptor {
            semaphores_table: "semaphores".to_string(),
            permits_by_owner_table: "permits_by_owner".to_string(),
            heartbeats_table: "heartbeats".to_string(),
            current_time_expr: "NOW()".to_string(),
        }
    }
}
