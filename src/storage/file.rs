//! Directory-backed state backend.
//!
//! Each key is one file named after the key. Every file starts with an
//! 8-byte big-endian expiry (milliseconds since the epoch, 0 = never)
//! followed by the value. Writes go through a temp file and an atomic
//! rename. Lease operations hold an exclusive advisory lock on
//! `<key>.guard` for the whole check-and-replace, so overlapping processes
//! see one another's leases.

use fd_lock::RwLock;
use log::warn;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use super::{BackendError, StateBackend};
use crate::types::now_ms;

const EXPIRY_LEN: usize = 8;

#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
}

fn map_io(context: &str, err: io::Error) -> BackendError {
    match err.kind() {
        ErrorKind::PermissionDenied | ErrorKind::InvalidInput | ErrorKind::InvalidData => {
            BackendError::Failed(format!("{}: {}", context, err))
        }
        _ => BackendError::Unavailable(format!("{}: {}", context, err)),
    }
}

/// Keep keys to a safe file-name alphabet.
fn file_name(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn frame(expires_at_ms: u64, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(EXPIRY_LEN + value.len());
    out.extend_from_slice(&expires_at_ms.to_be_bytes());
    out.extend_from_slice(value);
    out
}

/// One stored file.
enum Stored {
    Framed { expires_at_ms: u64, value: Vec<u8> },
    /// Shorter than the expiry header.
    Truncated(Vec<u8>),
}

impl Stored {
    fn parse(bytes: Vec<u8>) -> Self {
        if bytes.len() < EXPIRY_LEN {
            return Stored::Truncated(bytes);
        }
        let mut expiry = [0u8; EXPIRY_LEN];
        expiry.copy_from_slice(&bytes[..EXPIRY_LEN]);
        Stored::Framed {
            expires_at_ms: u64::from_be_bytes(expiry),
            value: bytes[EXPIRY_LEN..].to_vec(),
        }
    }

    /// The value, if it holds a lease or entry that has not expired.
    fn live_value(self, now: u64) -> Option<Vec<u8>> {
        match self {
            Stored::Framed {
                expires_at_ms,
                value,
            } if is_live(expires_at_ms, now) => Some(value),
            _ => None,
        }
    }
}

fn is_live(expires_at_ms: u64, now: u64) -> bool {
    expires_at_ms == 0 || expires_at_ms > now
}

fn lease_expiry_ms(now: u64, ttl: Duration) -> u64 {
    let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    // 0 is reserved for "never expires".
    now.saturating_add(ttl_ms).max(1)
}

impl FileBackend {
    /// Open or create the backend directory.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, BackendError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| map_io("Failed to create state directory", e))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(file_name(key))
    }

    fn read(&self, path: &Path) -> Result<Option<Stored>, BackendError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(Stored::parse(bytes))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(map_io("Read failed", e)),
        }
    }

    /// Replace `key`'s file with `contents` via temp file and rename.
    fn write_atomic(&self, key: &str, contents: &[u8]) -> Result<(), BackendError> {
        let path = self.path_for(key);
        let tmp_path = self
            .dir
            .join(format!("{}.{}.tmp", file_name(key), Uuid::new_v4().simple()));

        let result = (|| {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp_path)
                .map_err(|e| map_io("Create temp failed", e))?;
            file.write_all(contents)
                .map_err(|e| map_io("Write failed", e))?;
            file.sync_all().map_err(|e| map_io("Sync failed", e))?;
            drop(file);
            fs::rename(&tmp_path, &path).map_err(|e| map_io("Rename failed", e))
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }

    /// Run `f` while holding the exclusive guard of `key`.
    fn with_guard<T>(
        &self,
        key: &str,
        f: impl FnOnce() -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let guard_path = self.dir.join(format!("{}.guard", file_name(key)));
        let file: File = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&guard_path)
            .map_err(|e| map_io("Open lease guard failed", e))?;

        let mut lock = RwLock::new(file);
        let _held = lock
            .write()
            .map_err(|e| map_io("Lease guard failed", e))?;
        f()
    }
}

impl StateBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let path = self.path_for(key);
        match self.read(&path)? {
            None => Ok(None),
            Some(Stored::Truncated(bytes)) => {
                // Hand the bytes up; the caller decides what a bad value means.
                warn!("Entry file {} is shorter than its header", path.display());
                Ok(Some(bytes))
            }
            Some(stored) => Ok(stored.live_value(now_ms())),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), BackendError> {
        self.write_atomic(key, &frame(0, value))
    }

    fn set_with_lease(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, BackendError> {
        self.with_guard(key, || {
            let now = now_ms();
            let current = self.read(&self.path_for(key))?;
            if current.and_then(|stored| stored.live_value(now)).is_some() {
                return Ok(false);
            }
            self.write_atomic(key, &frame(lease_expiry_ms(now, ttl), value))?;
            Ok(true)
        })
    }

    fn delete(&self, key: &str) -> Result<bool, BackendError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(map_io("Delete failed", e)),
        }
    }

    fn delete_if_equal(&self, key: &str, expected: &[u8]) -> Result<bool, BackendError> {
        self.with_guard(key, || {
            let path = self.path_for(key);
            let current = self.read(&path)?;
            if current.and_then(|stored| stored.live_value(now_ms())).as_deref() != Some(expected)
            {
                return Ok(false);
            }
            self.delete(key)
        })
    }
}
