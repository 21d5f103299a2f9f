//! Line filter: turns raw log-store entries into mineable text.
//!
//! Only entries whose line is a JSON object carrying one of the recognized
//! string fields survive. The field value has any leading RFC-3339 timestamp
//! removed and is trimmed; an empty result is dropped as well.

use log::debug;
use regex::Regex;
use serde_json::Value;

use crate::error::MinerError;
use crate::types::{LogLine, RawEntry};

/// Field read by default, the container runtime's message field.
pub const DEFAULT_FIELD: &str = "log";

const TIMESTAMP_PREFIX: &str = r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d+Z\s+";

/// Why an entry was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Line does not start with `{` or is not a JSON object.
    NotJson,
    /// None of the recognized fields is present as a string.
    MissingField,
    /// Nothing left after stripping the timestamp and whitespace.
    Empty,
}

/// Skip tally for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub accepted: usize,
    pub not_json: usize,
    pub missing_field: usize,
    pub empty: usize,
}

impl FilterStats {
    pub fn skipped(&self) -> usize {
        self.not_json + self.missing_field + self.empty
    }

    fn record(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::NotJson => self.not_json += 1,
            SkipReason::MissingField => self.missing_field += 1,
            SkipReason::Empty => self.empty += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LineFilter {
    fields: Vec<String>,
    timestamp_prefix: Regex,
}

impl LineFilter {
    /// Build a filter reading the first present field of `fields`, in order.
    pub fn new<I, S>(fields: I) -> Result<Self, MinerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields
            .into_iter()
            .map(|f| {
                let f: String = f.into();
                f.trim().to_string()
            })
            .filter(|f| !f.is_empty())
            .collect();
        if fields.is_empty() {
            return Err(MinerError::Config(
                "at least one log field name is required".to_string(),
            ));
        }

        let timestamp_prefix = Regex::new(TIMESTAMP_PREFIX)
            .map_err(|e| MinerError::Config(format!("timestamp pattern: {e}")))?;

        Ok(Self {
            fields,
            timestamp_prefix,
        })
    }

    /// Extract the message text of one entry.
    pub fn extract(&self, entry: &RawEntry) -> Result<LogLine, SkipReason> {
        if !entry.line.trim_start().starts_with('{') {
            return Err(SkipReason::NotJson);
        }
        let payload: Value = serde_json::from_str(&entry.line).map_err(|_| SkipReason::NotJson)?;
        let Value::Object(payload) = payload else {
            return Err(SkipReason::NotJson);
        };

        let text = self
            .fields
            .iter()
            .find_map(|field| payload.get(field).and_then(Value::as_str))
            .ok_or(SkipReason::MissingField)?;

        let text = self.timestamp_prefix.replace(text, "");
        let text = text.trim();
        if text.is_empty() {
            return Err(SkipReason::Empty);
        }

        Ok(LogLine {
            text: text.to_string(),
            timestamp_ns: entry.timestamp_ns,
        })
    }

    /// Filter a batch, preserving order.
    pub fn filter(&self, entries: &[RawEntry]) -> (Vec<LogLine>, FilterStats) {
        let mut stats = FilterStats::default();
        let mut lines = Vec::with_capacity(entries.len());

        for entry in entries {
            match self.extract(entry) {
                Ok(line) => {
                    stats.accepted += 1;
                    lines.push(line);
                }
                Err(reason) => {
                    debug!("Dropping entry at {}ns: {:?}", entry.timestamp_ns, reason);
                    stats.record(reason);
                }
            }
        }

        (lines, stats)
    }
}
