//! Per-semaphore-name intern table.
//!
//! The acquire/release protocol needs exactly one `(Mutex, Notify)` pair
//! per semaphore name shared by every `Semaphore` instance for that name
//! within a process (§5, §9). This reproduces the source's "intern the
//! name string, use it as a monitor object" trick as an explicit map, the
//! way `src/dashboard/mod.rs`'s `AppState` holds its shared `Mutex<...>`
//! fields for the lifetime of the process — created lazily, never torn
//! down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::Notify;

/// The shared monitor for one semaphore name: an async mutex serializing
/// acquire/release for that name within this process, and a `Notify` that
/// `release` signals so waiters in `acquire`'s backoff loop wake promptly
/// instead of sleeping out their full poll interval.
pub struct NameLock {
    pub mutex: tokio::sync::Mutex<()>,
    pub notify: Notify,
}

impl NameLock {
    fn new() -> Self {
        NameLock {
            mutex: tokio::sync::Mutex::new(()),
            notify: Notify::new(),
        }
    }
}

fn table() -> &'static Mutex<HashMap<String, Arc<NameLock>>> {
    static TABLE: OnceLock<Mutex<HashMap<String, Arc<NameLock>>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Intern `name`, returning the process-wide shared lock for it. Entries
/// are never removed: a semaphore name interned once keeps its lock for
/// the life of the process, matching the source's behavior.
pub fn intern(name: &str) -> Arc<NameLock> {
    let mut guard = table().lock().unwrap();
    Arc::clone(guard.entry(name.to_string()).or_insert_with(|| Arc::new(NameLock::new())))
}
