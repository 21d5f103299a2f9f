//! SQLite state backend.
//!
//! One table holds both the state blob and the run lock:
//!
//! ```sql
//! state_kv(key TEXT PRIMARY KEY, value BLOB NOT NULL, expires_at_ms INTEGER)
//! ```
//!
//! Rows with a non-null `expires_at_ms` in the past are invisible to `get`
//! and are replaced by the next `set_with_lease`.

use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{BackendError, StateBackend};
use crate::types::now_ms;

pub struct SqliteBackend {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("path", &self.path)
            .finish()
    }
}

fn map_err(err: rusqlite::Error) -> BackendError {
    match err {
        rusqlite::Error::SqliteFailure(ref e, _)
            if matches!(
                e.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
            ) =>
        {
            BackendError::Unavailable(err.to_string())
        }
        other => BackendError::Failed(other.to_string()),
    }
}

/// Lease expiry in epoch milliseconds, kept inside SQLite's INTEGER range.
fn expiry_ms(now: u64, ttl: Duration) -> i64 {
    let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    let expires_at = now.saturating_add(ttl_ms).min(i64::MAX as u64);
    expires_at as i64
}

impl SqliteBackend {
    /// Open or create the database at `path`.
    ///
    /// `busy_timeout` bounds how long a call waits for another process's
    /// write lock before reporting the backend unavailable.
    pub fn open<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> Result<Self, BackendError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    BackendError::Unavailable(format!("Failed to create state directory: {}", e))
                })?;
            }
        }

        let conn = Connection::open(&path).map_err(map_err)?;
        conn.busy_timeout(busy_timeout).map_err(map_err)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS state_kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                expires_at_ms INTEGER
            )",
            [],
        )
        .map_err(map_err)?;

        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateBackend for SqliteBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM state_kv
             WHERE key = ?1 AND (expires_at_ms IS NULL OR expires_at_ms > ?2)",
            params![key, now_ms() as i64],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()
        .map_err(map_err)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), BackendError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO state_kv (key, value, expires_at_ms) VALUES (?1, ?2, NULL)",
            params![key, value],
        )
        .map_err(map_err)?;
        Ok(())
    }

    fn set_with_lease(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, BackendError> {
        let mut conn = self.conn.lock();
        let now = now_ms();
        let expires_at = expiry_ms(now, ttl);

        // IMMEDIATE takes the write lock up front so two processes cannot both
        // see the old lease as expired.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_err)?;
        tx.execute(
            "DELETE FROM state_kv
             WHERE key = ?1 AND expires_at_ms IS NOT NULL AND expires_at_ms <= ?2",
            params![key, now as i64],
        )
        .map_err(map_err)?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO state_kv (key, value, expires_at_ms) VALUES (?1, ?2, ?3)",
                params![key, value, expires_at],
            )
            .map_err(map_err)?;
        tx.commit().map_err(map_err)?;

        Ok(inserted == 1)
    }

    fn delete_if_equal(&self, key: &str, expected: &[u8]) -> Result<bool, BackendError> {
        let conn = self.conn.lock();
        let removed = conn
            .execute(
                "DELETE FROM state_kv
                 WHERE key = ?1 AND value = ?2
                   AND (expires_at_ms IS NULL OR expires_at_ms > ?3)",
                params![key, expected, now_ms() as i64],
            )
            .map_err(map_err)?;
        Ok(removed > 0)
    }

    fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let conn = self.conn.lock();
        let removed = conn
            .execute("DELETE FROM state_kv WHERE key = ?1", params![key])
            .map_err(map_err)?;
        Ok(removed > 0)
    }
}
