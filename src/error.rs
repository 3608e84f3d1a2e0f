//! Error taxonomy for the semaphore protocol.
//!
//! Mirrors the distinctions the acquire/release algorithms actually need to
//! make (see `SPEC_FULL.md` §7): contention is not an error and never
//! surfaces here, but timeouts, constraint violations on construction,
//! runtime integrity violations, and heartbeat poisoning each need their own
//! variant so callers can match on what happened instead of grepping a
//! message string.

use std::fmt;

/// Errors surfaced by semaphore operations.
#[derive(Debug)]
pub enum SemaphoreError {
    /// `acquire` reached its deadline without reserving any permits.
    Timeout,
    /// Construction found an existing row whose `total_permits` disagreed
    /// with the requested capacity under `strict` mode, or a unique-key
    /// race that survived one retry.
    ConstraintViolation { detail: String },
    /// A per-owner or per-semaphore UPDATE affected the wrong number of
    /// rows mid-transaction (0 or >1 where exactly 1 was required). Always
    /// fatal for the operation in progress; the transaction was rolled
    /// back before this was raised.
    IntegrityViolation { detail: String },
    /// This process has been declared dead by a peer (its heartbeat UPDATE
    /// affected 0 rows). Every semaphore subscribed to the heartbeat
    /// service that produced this is now unhealthy.
    HeartbeatFailed,
    /// Connection loss, statement timeout, or any other transport-level
    /// failure not otherwise classified.
    Transport(sqlx::Error),
}

impl fmt::Display for SemaphoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SemaphoreError::Timeout => write!(f, "acquire deadline expired before permits became available"),
            SemaphoreError::ConstraintViolation { detail } => {
                write!(f, "constraint violation: {detail}")
            }
            SemaphoreError::IntegrityViolation { detail } => {
                write!(f, "integrity violation: {detail}")
            }
            SemaphoreError::HeartbeatFailed => {
                write!(f, "process heartbeat failed: declared dead by a peer")
            }
            SemaphoreError::Transport(e) => write!(f, "transport failure: {e}"),
        }
    }
}

impl std::error::Error for SemaphoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SemaphoreError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for SemaphoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = e {
            match db_err.code().as_deref() {
                // Unique-key race during construction: surfaced through
                // sqlx as a Postgres `23505`. Classify as a constraint
                // violation rather than an opaque transport failure so the
                // construction retry in `semaphore.rs` can match on it.
                Some("23505") => {
                    return SemaphoreError::ConstraintViolation {
                        detail: db_err.message().to_string(),
                    }
                }
                // Check-constraint violation (e.g. `available_permits >=
                // 0` or `<= total_permits`): an in-flight operation tried
                // to push a row out of the I1/I3 invariants.
                Some("23514") => {
                    return SemaphoreError::IntegrityViolation {
                        detail: db_err.message().to_string(),
                    }
                }
                _ => {}
            }
        }
        SemaphoreError::Transport(e)
    }
}

impl SemaphoreError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, SemaphoreError::ConstraintViolation { .. })
    }
}

pub type Result<T> = std::result::Result<T, SemaphoreError>;
