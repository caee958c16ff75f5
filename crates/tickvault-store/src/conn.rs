use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tickvault_core::error::{Result, StoreError};

/// Writers queue behind SQLite's single-writer lock for up to this long
/// before an operation fails as transient.
const BUSY_TIMEOUT_MS: u32 = 30_000;
/// Upper bound on pooled connections per store instance.
const DEFAULT_POOL_SIZE: u32 = 10;

pub type DbPool = r2d2::Pool<SqliteConnectionManager>;
pub type DbConn = r2d2::PooledConnection<SqliteConnectionManager>;

/// Open the connection pool for the store's database file.
///
/// Every connection comes up in WAL mode with foreign keys enforced and a
/// busy timeout, so concurrent peers block on the row locks instead of
/// failing immediately.
pub fn open_pool(path: &str) -> Result<DbPool> {
    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {BUSY_TIMEOUT_MS};
             PRAGMA synchronous = NORMAL;"
        ))
    });
    r2d2::Pool::builder()
        .max_size(DEFAULT_POOL_SIZE)
        .build(manager)
        .map_err(|e| StoreError::Pool(e.to_string()))
}

/// Open a transaction on `conn`. Mutators begin IMMEDIATE so the write
/// lock is taken up front; reads stay deferred.
pub fn begin(conn: &Connection, immediate: bool) -> Result<()> {
    if immediate {
        conn.execute_batch("BEGIN IMMEDIATE")?;
    } else {
        conn.execute_batch("BEGIN")?;
    }
    Ok(())
}

pub fn commit(conn: &Connection) -> Result<()> {
    conn.execute_batch("COMMIT")?;
    Ok(())
}

pub fn rollback(conn: &Connection) -> Result<()> {
    conn.execute_batch("ROLLBACK")?;
    Ok(())
}
