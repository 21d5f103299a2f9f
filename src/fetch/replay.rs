//! Replays a saved `logcli --output jsonl` capture as a log source.
//!
//! Each row looks like
//! `{"labels": {...}, "line": "...", "timestamp": "2024-05-01T10:00:00.123456789Z"}`.
//! The timestamp may also be an integer (or digit string) of nanoseconds.
//! Rows that do not parse are skipped with a warning.

use chrono::DateTime;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{LogSource, QueryRequest, SourceError};
use crate::types::RawEntry;

#[derive(Debug, Clone)]
pub struct JsonlSource {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ReplayRow {
    timestamp: Value,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    line: String,
}

fn parse_timestamp(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
            s.parse().ok()
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .and_then(|ts| ts.timestamp_nanos_opt())
            .and_then(|ns| u64::try_from(ns).ok()),
        _ => None,
    }
}

/// Parse a whole capture. Returns the entries and the number of skipped rows.
pub fn parse_jsonl(contents: &str) -> (Vec<RawEntry>, usize) {
    let mut entries = Vec::new();
    let mut skipped = 0;

    for (idx, raw) in contents.lines().enumerate() {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let row: ReplayRow = match serde_json::from_str(raw) {
            Ok(row) => row,
            Err(e) => {
                warn!("Skipping replay row {}: {}", idx + 1, e);
                skipped += 1;
                continue;
            }
        };
        let Some(timestamp_ns) = parse_timestamp(&row.timestamp) else {
            warn!("Skipping replay row {}: bad timestamp {}", idx + 1, row.timestamp);
            skipped += 1;
            continue;
        };
        entries.push(RawEntry {
            timestamp_ns,
            labels: row.labels,
            line: row.line,
        });
    }

    (entries, skipped)
}

impl JsonlSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSource for JsonlSource {
    /// The whole file is returned on each query; the fetcher applies the
    /// cursor and limit.
    fn query(&self, request: &QueryRequest) -> Result<Vec<RawEntry>, SourceError> {
        let contents = fs::read_to_string(&self.path).map_err(|e| match e.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied | ErrorKind::InvalidData => {
                SourceError::Rejected(format!("{}: {}", self.path.display(), e))
            }
            _ => SourceError::Unavailable(format!("{}: {}", self.path.display(), e)),
        })?;

        let (entries, skipped) = parse_jsonl(&contents);
        debug!(
            "Replayed {} rows from {} for selector {} ({} skipped)",
            entries.len(),
            self.path.display(),
            request.selector,
            skipped
        );
        Ok(entries)
    }
}
