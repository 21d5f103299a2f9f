//! Core types shared across the fetch → filter → mine → forward pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Current time in nanoseconds since the UNIX epoch (Loki's timestamp unit).
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

// ================================================================================================
// FETCHED DATA
// ================================================================================================

/// One entry as returned by the log store, before filtering.
///
/// Mirrors a `logcli --output jsonl` row: the stream labels, the entry
/// timestamp and the raw line (usually a JSON document written by the
/// container runtime).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEntry {
    /// Entry timestamp in nanoseconds since the UNIX epoch.
    pub timestamp_ns: u64,
    /// Stream labels attached by the collector.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Raw line as stored.
    pub line: String,
}

/// A log line accepted by the filter. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Extracted message text (timestamp prefix removed, trimmed).
    pub text: String,
    /// Arrival timestamp in nanoseconds, copied from the envelope.
    pub timestamp_ns: u64,
}

/// Fetch progress marker: the newest log-store timestamp already consumed.
///
/// Zero means nothing has been fetched yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cursor {
    pub last_ts_ns: u64,
}

impl Cursor {
    pub fn new(last_ts_ns: u64) -> Self {
        Self { last_ts_ns }
    }

    pub fn is_initial(&self) -> bool {
        self.last_ts_ns == 0
    }

    /// Move the cursor forward to `ts_ns`. Never moves backwards.
    pub fn advance_to(&mut self, ts_ns: u64) {
        if ts_ns > self.last_ts_ns {
            self.last_ts_ns = ts_ns;
        }
    }

    /// Whether an entry at `ts_ns` is strictly after this cursor.
    #[inline]
    pub fn admits(&self, ts_ns: u64) -> bool {
        ts_ns > self.last_ts_ns
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.last_ts_ns)
    }
}

// ================================================================================================
// FORWARDED DATA
// ================================================================================================

/// One occurrence of a template, forwarded downstream after classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccurrenceRecord {
    pub cluster_id: u64,
    /// Template after this line was applied, wildcards rendered as `<*>`.
    pub template: String,
    /// The line that matched (or created) the template.
    pub sample: String,
    pub timestamp_ns: u64,
    /// Running match count of the cluster, this occurrence included.
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_never_moves_backwards() {
        let mut cursor = Cursor::new(100);
        cursor.advance_to(50);
        assert_eq!(cursor.last_ts_ns, 100);
        cursor.advance_to(150);
        assert_eq!(cursor.last_ts_ns, 150);
    }

    #[test]
    fn test_cursor_admits_strictly_after() {
        let cursor = Cursor::new(100);
        assert!(!cursor.admits(99));
        assert!(!cursor.admits(100));
        assert!(cursor.admits(101));
        assert!(Cursor::default().is_initial());
    }
}
