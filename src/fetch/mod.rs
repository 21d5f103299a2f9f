//! Log fetching - a bounded window of entries newer than the cursor.
//!
//! [`LogFetcher`] owns the cursor discipline (strictly-after, ordered,
//! capped) and the retry budget; a [`LogSource`] only knows how to run one
//! query against a concrete store.

pub mod loki;
pub mod replay;

pub use loki::LokiSource;
pub use replay::JsonlSource;

use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::error::MinerError;
use crate::retry::{RetryPolicy, Retryable};
use crate::types::{now_ns, Cursor, RawEntry};

/// One query against the log store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    /// Label selector, e.g. `{namespace="npps"}`.
    pub selector: String,
    /// Inclusive lower bound, nanoseconds.
    pub start_ns: u64,
    /// Upper bound, nanoseconds.
    pub end_ns: u64,
    /// Maximum entries to return.
    pub limit: usize,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// Timeout, connection failure, 5xx or 429.
    #[error("log store unavailable: {0}")]
    Unavailable(String),
    /// The store refused the query (4xx).
    #[error("log store rejected query: {0}")]
    Rejected(String),
    /// The response could not be decoded.
    #[error("log store response undecodable: {0}")]
    Decode(String),
}

impl Retryable for SourceError {
    fn is_transient(&self) -> bool {
        matches!(self, SourceError::Unavailable(_))
    }
}

/// A queryable log store.
pub trait LogSource {
    fn query(&self, request: &QueryRequest) -> Result<Vec<RawEntry>, SourceError>;
}

impl<T: LogSource + ?Sized> LogSource for Box<T> {
    fn query(&self, request: &QueryRequest) -> Result<Vec<RawEntry>, SourceError> {
        (**self).query(request)
    }
}

impl<T: LogSource + ?Sized> LogSource for Arc<T> {
    fn query(&self, request: &QueryRequest) -> Result<Vec<RawEntry>, SourceError> {
        (**self).query(request)
    }
}

pub struct LogFetcher {
    source: Box<dyn LogSource>,
    selector: String,
    /// Window used when the cursor has never moved; `None` reads from the epoch.
    initial_lookback: Option<Duration>,
    retry: RetryPolicy,
}

impl LogFetcher {
    pub fn new(
        source: Box<dyn LogSource>,
        selector: impl Into<String>,
        initial_lookback: Option<Duration>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            selector: selector.into(),
            initial_lookback,
            retry,
        }
    }

    fn request_for(&self, cursor: Cursor, limit: usize) -> QueryRequest {
        let end_ns = now_ns();
        let start_ns = if cursor.is_initial() {
            self.initial_lookback
                .map(|lookback| end_ns.saturating_sub(lookback.as_nanos() as u64))
                .unwrap_or(0)
        } else {
            cursor.last_ts_ns.saturating_add(1)
        };

        QueryRequest {
            selector: self.selector.clone(),
            start_ns,
            end_ns: end_ns.max(start_ns),
            limit,
        }
    }

    /// Entries strictly after `cursor`, oldest first, at most `limit` of them.
    ///
    /// Nothing here moves the cursor; a failed fetch leaves the caller free to
    /// retry the same window on the next run.
    pub fn fetch(&self, cursor: Cursor, limit: usize) -> Result<Vec<RawEntry>, MinerError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let request = self.request_for(cursor, limit);
        debug!(
            "Querying log store: selector={} start={} end={} limit={}",
            request.selector, request.start_ns, request.end_ns, request.limit
        );

        let mut entries = self
            .retry
            .run("log fetch", || self.source.query(&request))
            .map_err(|err| MinerError::FetchUnavailable {
                attempts: err.attempts(),
                reason: err.into_inner().to_string(),
            })?;

        let returned = entries.len();
        entries.retain(|entry| cursor.admits(entry.timestamp_ns));
        entries.sort_by_key(|entry| entry.timestamp_ns);
        entries.truncate(limit);

        info!(
            "Fetched {} entries after cursor {} ({} returned by the store)",
            entries.len(),
            cursor,
            returned
        );
        Ok(entries)
    }
}
