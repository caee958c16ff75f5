use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

use rusqlite::Connection;
use tickvault_core::error::Result;
use tracing::debug;

/// Serializes every trigger/job mutator across the cluster.
pub const TRIGGER_ACCESS: &str = "trigger_access";
/// Serializes cluster check-in and failed-peer detection.
pub const STATE_ACCESS: &str = "state_access";
/// Serializes calendar removal.
pub const CALENDAR_ACCESS: &str = "calendar_access";

/// Statement used by [`DbRowLockHandler`] unless the config overrides it.
/// A self-assignment write: it takes the row's write lock and holds it for
/// the remainder of the caller's transaction.
pub const DEFAULT_LOCK_SQL: &str =
    "UPDATE locks SET lock_name = lock_name WHERE lock_name = ?1";

/// Named mutual-exclusion locks guarding the store's tables.
///
/// `obtain` blocks until the lock is held. For row locks the connection's
/// open transaction is the lock handle, so `release` is a commit-time
/// no-op; the in-process handler releases explicitly.
pub trait LockHandler: Send + Sync {
    /// Block until `lock_name` is held on behalf of `conn`'s transaction.
    /// Returns `true` once owned.
    fn obtain(&self, conn: &Connection, lock_name: &str) -> Result<bool>;

    /// Give the lock back. Must be a no-op when `was_owner` is false.
    fn release(&self, conn: &Connection, lock_name: &str, was_owner: bool) -> Result<()>;
}

/// Cluster-safe lock: a write against the lock's row in the `locks` table.
/// The database blocks competing writers until the holder's transaction
/// commits or rolls back, which is exactly the lock lifetime we want.
pub struct DbRowLockHandler {
    lock_sql: String,
}

impl DbRowLockHandler {
    pub fn new(lock_sql: Option<String>) -> Self {
        Self {
            lock_sql: lock_sql.unwrap_or_else(|| DEFAULT_LOCK_SQL.to_string()),
        }
    }
}

impl LockHandler for DbRowLockHandler {
    fn obtain(&self, conn: &Connection, lock_name: &str) -> Result<bool> {
        let rows = conn.execute(&self.lock_sql, [lock_name])?;
        if rows == 0 {
            // Lock row missing (fresh or hand-edited database): create it,
            // then take it. The insert itself conflicts with concurrent
            // creators, which resolves the race in the database.
            conn.execute(
                "INSERT OR IGNORE INTO locks (lock_name) VALUES (?1)",
                [lock_name],
            )?;
            conn.execute(&self.lock_sql, [lock_name])?;
        }
        debug!(lock = lock_name, "row lock obtained");
        Ok(true)
    }

    fn release(&self, _conn: &Connection, lock_name: &str, was_owner: bool) -> Result<()> {
        // Row locks die with the transaction.
        if was_owner {
            debug!(lock = lock_name, "row lock released with transaction");
        }
        Ok(())
    }
}

/// Process-wide lock for single-instance deployments where the database
/// cannot provide row locks. Not safe across processes.
pub struct InProcessLockHandler {
    held: Mutex<HashSet<String>>,
    available: Condvar,
}

impl InProcessLockHandler {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            available: Condvar::new(),
        }
    }
}

impl Default for InProcessLockHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl LockHandler for InProcessLockHandler {
    fn obtain(&self, _conn: &Connection, lock_name: &str) -> Result<bool> {
        let mut held = self.held.lock().unwrap();
        while held.contains(lock_name) {
            held = self.available.wait(held).unwrap();
        }
        held.insert(lock_name.to_string());
        debug!(lock = lock_name, "in-process lock obtained");
        Ok(true)
    }

    fn release(&self, _conn: &Connection, lock_name: &str, was_owner: bool) -> Result<()> {
        if !was_owner {
            return Ok(());
        }
        let mut held = self.held.lock().unwrap();
        held.remove(lock_name);
        self.available.notify_all();
        debug!(lock = lock_name, "in-process lock released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn mem_conn() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn in_process_lock_excludes_second_taker() {
        let handler = Arc::new(InProcessLockHandler::new());
        let conn = mem_conn();
        assert!(handler.obtain(&conn, TRIGGER_ACCESS).unwrap());

        let h2 = Arc::clone(&handler);
        let contender = std::thread::spawn(move || {
            let conn = mem_conn();
            // Blocks until the main thread releases.
            h2.obtain(&conn, TRIGGER_ACCESS).unwrap();
            h2.release(&conn, TRIGGER_ACCESS, true).unwrap();
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!contender.is_finished());

        handler.release(&conn, TRIGGER_ACCESS, true).unwrap();
        contender.join().unwrap();
    }

    #[test]
    fn release_without_ownership_is_noop() {
        let handler = InProcessLockHandler::new();
        let conn = mem_conn();
        handler.release(&conn, TRIGGER_ACCESS, false).unwrap();
        // Still obtainable afterwards.
        assert!(handler.obtain(&conn, TRIGGER_ACCESS).unwrap());
    }

    #[test]
    fn distinct_locks_do_not_contend() {
        let handler = InProcessLockHandler::new();
        let conn = mem_conn();
        assert!(handler.obtain(&conn, STATE_ACCESS).unwrap());
        assert!(handler.obtain(&conn, TRIGGER_ACCESS).unwrap());
        handler.release(&conn, TRIGGER_ACCESS, true).unwrap();
        handler.release(&conn, STATE_ACCESS, true).unwrap();
    }

    #[test]
    fn row_lock_seeds_missing_row() {
        let conn = mem_conn();
        conn.execute_batch("CREATE TABLE locks (lock_name TEXT PRIMARY KEY)")
            .unwrap();
        let handler = DbRowLockHandler::new(None);
        assert!(handler.obtain(&conn, "brand_new_lock").unwrap());
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM locks WHERE lock_name = 'brand_new_lock'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n, 1);
    }
}
