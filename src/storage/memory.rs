//! In-process state backend. Nothing survives the process.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::{BackendError, StateBackend};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let entries = self.entries.lock();
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(Instant::now()))
            .map(|e| e.value.clone()))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), BackendError> {
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: None,
            },
        );
        Ok(())
    }

    fn set_with_lease(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, BackendError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.get(key).map_or(false, |e| e.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                // Past the clock's range the lease simply never expires.
                expires_at: now.checked_add(ttl),
            },
        );
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    fn delete_if_equal(&self, key: &str, expected: &[u8]) -> Result<bool, BackendError> {
        let mut entries = self.entries.lock();
        let matches = entries
            .get(key)
            .map_or(false, |e| e.is_live(Instant::now()) && e.value == expected);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_blocks_second_holder() {
        let backend = MemoryBackend::new();
        assert!(backend
            .set_with_lease("lock", b"a", Duration::from_secs(30))
            .unwrap());
        assert!(!backend
            .set_with_lease("lock", b"b", Duration::from_secs(30))
            .unwrap());
        assert!(backend.delete("lock").unwrap());
        assert!(backend
            .set_with_lease("lock", b"b", Duration::from_secs(30))
            .unwrap());
    }

    #[test]
    fn test_expired_entries_are_invisible() {
        let backend = MemoryBackend::new();
        backend.set_with_lease("lock", b"a", Duration::ZERO).unwrap();
        assert_eq!(backend.get("lock").unwrap(), None);
        assert!(backend.is_empty());

        backend.set("state", b"s").unwrap();
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn test_delete_if_equal_checks_owner() {
        let backend = MemoryBackend::new();
        backend
            .set_with_lease("lock", b"a", Duration::from_secs(30))
            .unwrap();

        assert!(!backend.delete_if_equal("lock", b"b").unwrap());
        assert_eq!(backend.get("lock").unwrap(), Some(b"a".to_vec()));
        assert!(backend.delete_if_equal("lock", b"a").unwrap());
        assert!(!backend.delete_if_equal("lock", b"a").unwrap());
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let backend = MemoryBackend::new();
        assert!(backend
            .set_with_lease("lock", b"a", Duration::from_secs(u64::MAX))
            .unwrap());
        assert_eq!(backend.get("lock").unwrap(), Some(b"a".to_vec()));
    }
}
