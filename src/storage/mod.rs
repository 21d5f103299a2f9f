//! Durable state between scheduled runs.
//!
//! A run's clustering tree and fetch cursor travel as one [`PersistedState`]
//! value, stored under a single key of a small key/value backend:
//! - **sqlite://**: rusqlite table with a lease-expiry column
//! - **file://**: one file per key, written via temp file + rename
//! - **memory://**: in-process map (tests and dry runs)
//!
//! The same backend holds the run lock, a time-bounded lease that keeps two
//! overlapping runs from loading the same state.

pub mod codec;
pub mod file;
pub mod memory;
pub mod sqlite;
pub mod state_store;

pub use codec::CodecError;
pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;
pub use state_store::{LoadedState, RunLease, StateOrigin, StateStore, LOCK_KEY};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::drain::ClusterTree;
use crate::retry::Retryable;
use crate::types::Cursor;

/// The unit of durability: everything a run needs from the previous one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub cursor: Cursor,
    pub tree: ClusterTree,
}

/// Backend failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Busy, locked, or not reachable right now. Worth retrying.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// The backend answered but the operation cannot succeed.
    #[error("backend operation failed: {0}")]
    Failed(String),
    #[error("unsupported state backend url '{0}'")]
    InvalidUrl(String),
}

impl Retryable for BackendError {
    fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

/// Key/value protocol the state store runs on.
pub trait StateBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    fn set(&self, key: &str, value: &[u8]) -> Result<(), BackendError>;

    /// Store `value` under `key` for `ttl`, only if the key is absent or its
    /// previous lease has expired. Returns whether the lease was taken.
    fn set_with_lease(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, BackendError>;

    /// Remove `key`. Returns whether something was removed.
    fn delete(&self, key: &str) -> Result<bool, BackendError>;

    /// Remove `key` only if it is live and still holds `expected`, in one
    /// step. Returns whether something was removed.
    fn delete_if_equal(&self, key: &str, expected: &[u8]) -> Result<bool, BackendError>;
}

impl<T: StateBackend + ?Sized> StateBackend for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), BackendError> {
        (**self).set(key, value)
    }

    fn set_with_lease(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, BackendError> {
        (**self).set_with_lease(key, value, ttl)
    }

    fn delete(&self, key: &str) -> Result<bool, BackendError> {
        (**self).delete(key)
    }

    fn delete_if_equal(&self, key: &str, expected: &[u8]) -> Result<bool, BackendError> {
        (**self).delete_if_equal(key, expected)
    }
}

impl<T: StateBackend + ?Sized> StateBackend for Box<T> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), BackendError> {
        (**self).set(key, value)
    }

    fn set_with_lease(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, BackendError> {
        (**self).set_with_lease(key, value, ttl)
    }

    fn delete(&self, key: &str) -> Result<bool, BackendError> {
        (**self).delete(key)
    }

    fn delete_if_equal(&self, key: &str, expected: &[u8]) -> Result<bool, BackendError> {
        (**self).delete_if_equal(key, expected)
    }
}

/// Open the backend named by `url`.
///
/// `timeout` bounds how long a single call may wait on a busy backend.
pub fn open_backend(url: &str, timeout: Duration) -> Result<Box<dyn StateBackend>, BackendError> {
    if url == "memory://" || url == "memory:" {
        return Ok(Box::new(MemoryBackend::new()));
    }
    if let Some(path) = url.strip_prefix("sqlite://") {
        if path.is_empty() {
            return Err(BackendError::InvalidUrl(url.to_string()));
        }
        return Ok(Box::new(SqliteBackend::open(path, timeout)?));
    }
    if let Some(dir) = url.strip_prefix("file://") {
        if dir.is_empty() {
            return Err(BackendError::InvalidUrl(url.to_string()));
        }
        return Ok(Box::new(FileBackend::open(dir)?));
    }
    Err(BackendError::InvalidUrl(url.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_backend_by_scheme() {
        let tmp_dir = tempfile::tempdir().unwrap();

        assert!(open_backend("memory://", Duration::from_secs(1)).is_ok());

        let db = tmp_dir.path().join("state.db");
        let url = format!("sqlite://{}", db.display());
        assert!(open_backend(&url, Duration::from_secs(1)).is_ok());
        assert!(db.exists());

        let dir = tmp_dir.path().join("kv");
        let url = format!("file://{}", dir.display());
        assert!(open_backend(&url, Duration::from_secs(1)).is_ok());
        assert!(dir.is_dir());
    }

    #[test]
    fn test_open_backend_rejects_unknown_scheme() {
        assert!(matches!(
            open_backend("redis://localhost", Duration::from_secs(1)),
            Err(BackendError::InvalidUrl(_))
        ));
        assert!(matches!(
            open_backend("sqlite://", Duration::from_secs(1)),
            Err(BackendError::InvalidUrl(_))
        ));
    }
}
