//! Redis list sink.
//!
//! `redis://[user:pass@]host:port/<list>` pushes every occurrence onto the
//! tail of `<list>` (default `log_sequences`) as a one-element JSON array
//! holding the cluster id, e.g. `[7]`. Sequence consumers pop from the head.

use log::debug;
use parking_lot::Mutex;
use redis::{Client, Commands, Connection, RedisError};
use std::time::Duration;

use super::{Sink, SinkError};
use crate::types::OccurrenceRecord;

pub const DEFAULT_LIST: &str = "log_sequences";

pub struct RedisListSink {
    client: Client,
    list: String,
    timeout: Duration,
    conn: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for RedisListSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisListSink")
            .field("list", &self.list)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Wire payload for one record.
fn payload(record: &OccurrenceRecord) -> String {
    serde_json::json!([record.cluster_id]).to_string()
}

fn classify_error(err: &RedisError) -> SinkError {
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
        || matches!(
            err.kind(),
            redis::ErrorKind::BusyLoadingError | redis::ErrorKind::TryAgain
        )
    {
        SinkError::Unreachable(err.to_string())
    } else {
        SinkError::Rejected(err.to_string())
    }
}

impl RedisListSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, SinkError> {
        let rest = url
            .strip_prefix("redis://")
            .ok_or_else(|| SinkError::InvalidUrl(url.to_string()))?;
        let (addr, list) = match rest.split_once('/') {
            Some((addr, list)) if !list.is_empty() => (addr, list),
            Some((addr, _)) => (addr, DEFAULT_LIST),
            None => (rest, DEFAULT_LIST),
        };
        if addr.is_empty() || list.contains('/') {
            return Err(SinkError::InvalidUrl(url.to_string()));
        }

        let client = Client::open(format!("redis://{}", addr))
            .map_err(|e| SinkError::InvalidUrl(format!("{}: {}", url, e)))?;

        Ok(Self {
            client,
            list: list.to_string(),
            timeout,
            conn: Mutex::new(None),
        })
    }

    fn connect(&self) -> Result<Connection, SinkError> {
        let conn = self
            .client
            .get_connection_with_timeout(self.timeout)
            .map_err(|e| classify_error(&e))?;
        conn.set_read_timeout(Some(self.timeout))
            .map_err(|e| classify_error(&e))?;
        conn.set_write_timeout(Some(self.timeout))
            .map_err(|e| classify_error(&e))?;
        debug!("Connected to redis list '{}'", self.list);
        Ok(conn)
    }
}

impl Sink for RedisListSink {
    fn send(&self, record: &OccurrenceRecord) -> Result<(), SinkError> {
        let mut slot = self.conn.lock();
        if slot.is_none() {
            *slot = Some(self.connect()?);
        }
        let Some(conn) = slot.as_mut() else {
            return Err(SinkError::Unreachable("no redis connection".into()));
        };

        let pushed: Result<i64, RedisError> = conn.rpush(&self.list, payload(record));
        match pushed {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = classify_error(&e);
                if matches!(err, SinkError::Unreachable(_)) {
                    // Reconnect on the next attempt.
                    *slot = None;
                }
                Err(err)
            }
        }
    }
}
