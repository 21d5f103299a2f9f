//! Occurrence forwarding to the downstream consumer.
//!
//! A [`Sink`] delivers one [`OccurrenceRecord`] at a time. The [`Forwarder`]
//! walks a batch in classification order: a record the sink refuses is
//! logged, counted and skipped; a sink that stays unreachable past the retry
//! budget ends the batch with `ForwardUnavailable`. Forwarding always happens
//! after state has been saved, so neither outcome touches the state.

pub mod http;
pub mod list;
pub mod writer;

pub use http::HttpSink;
pub use list::RedisListSink;
pub use writer::WriterSink;

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::error::MinerError;
use crate::retry::{RetryError, RetryPolicy, Retryable};
use crate::types::OccurrenceRecord;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    /// The sink refused this record. Retrying it will not help.
    #[error("record rejected by sink: {0}")]
    Rejected(String),
    /// The sink could not be reached.
    #[error("sink unreachable: {0}")]
    Unreachable(String),
    #[error("unsupported sink url '{0}'")]
    InvalidUrl(String),
}

impl Retryable for SinkError {
    fn is_transient(&self) -> bool {
        matches!(self, SinkError::Unreachable(_))
    }
}

/// Downstream consumer of occurrence records.
pub trait Sink {
    fn send(&self, record: &OccurrenceRecord) -> Result<(), SinkError>;
}

impl<T: Sink + ?Sized> Sink for Box<T> {
    fn send(&self, record: &OccurrenceRecord) -> Result<(), SinkError> {
        (**self).send(record)
    }
}

impl<T: Sink + ?Sized> Sink for Arc<T> {
    fn send(&self, record: &OccurrenceRecord) -> Result<(), SinkError> {
        (**self).send(record)
    }
}

/// Open the sink named by `url`: `stdout://`, `file://<path>` (JSON lines,
/// appended), an `http(s)://` endpoint or a `redis://host:port/<list>`
/// sequence list.
pub fn open_sink(url: &str, timeout: Duration) -> Result<Box<dyn Sink>, SinkError> {
    if url == "stdout://" || url == "stdout:" {
        return Ok(Box::new(WriterSink::stdout()));
    }
    if let Some(path) = url.strip_prefix("file://") {
        if path.is_empty() {
            return Err(SinkError::InvalidUrl(url.to_string()));
        }
        return Ok(Box::new(WriterSink::append_to(path)?));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(Box::new(HttpSink::new(url, timeout)?));
    }
    if url.starts_with("redis://") {
        return Ok(Box::new(RedisListSink::new(url, timeout)?));
    }
    Err(SinkError::InvalidUrl(url.to_string()))
}

/// Delivery tally of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub delivered: usize,
    pub rejected: usize,
}

pub struct Forwarder {
    sink: Box<dyn Sink>,
    retry: RetryPolicy,
}

impl Forwarder {
    pub fn new(sink: Box<dyn Sink>, retry: RetryPolicy) -> Self {
        Self { sink, retry }
    }

    /// Deliver `records` in order.
    ///
    /// Rejected records are counted in [`ForwardStats::rejected`]. An
    /// unreachable sink stops the batch; the error reports how many records
    /// made it out before that.
    pub fn emit(&self, records: &[OccurrenceRecord]) -> Result<ForwardStats, MinerError> {
        let mut stats = ForwardStats::default();

        for (idx, record) in records.iter().enumerate() {
            match self.retry.run("forward", || self.sink.send(record)) {
                Ok(()) => {
                    stats.delivered += 1;
                    debug!(
                        "Forwarded occurrence of cluster {} (count {})",
                        record.cluster_id, record.count
                    );
                }
                Err(RetryError::Permanent { error, .. }) => {
                    stats.rejected += 1;
                    warn!(
                        "Sink rejected occurrence of cluster {} at {}ns: {}",
                        record.cluster_id, record.timestamp_ns, error
                    );
                }
                Err(err @ RetryError::Exhausted { .. }) => {
                    warn!(
                        "Sink unreachable after {} attempt(s); {} record(s) left undelivered",
                        err.attempts(),
                        records.len() - idx
                    );
                    return Err(MinerError::ForwardUnavailable {
                        delivered: stats.delivered,
                        undelivered: records.len() - idx,
                        reason: err.into_inner().to_string(),
                    });
                }
            }
        }

        info!(
            "Forwarded {} occurrence(s), {} rejected",
            stats.delivered, stats.rejected
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Replies from a script, then accepts everything.
    struct ScriptedSink {
        replies: Mutex<Vec<Result<(), SinkError>>>,
        received: Mutex<Vec<u64>>,
    }

    impl ScriptedSink {
        fn new(replies: Vec<Result<(), SinkError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                received: Mutex::new(Vec::new()),
            })
        }
    }

    impl Sink for ScriptedSink {
        fn send(&self, record: &OccurrenceRecord) -> Result<(), SinkError> {
            let mut replies = self.replies.lock();
            let reply = if replies.is_empty() {
                Ok(())
            } else {
                replies.remove(0)
            };
            if reply.is_ok() {
                self.received.lock().push(record.cluster_id);
            }
            reply
        }
    }

    fn records(n: u64) -> Vec<OccurrenceRecord> {
        (1..=n)
            .map(|id| OccurrenceRecord {
                cluster_id: id,
                template: format!("event {id}"),
                sample: format!("event {id}"),
                timestamp_ns: id,
                count: 1,
            })
            .collect()
    }

    #[test]
    fn test_emit_in_order() {
        let sink = ScriptedSink::new(vec![]);
        let forwarder = Forwarder::new(Box::new(sink.clone()), RetryPolicy::immediate(3));

        let stats = forwarder.emit(&records(3)).unwrap();
        assert_eq!(stats.delivered, 3);
        assert_eq!(*sink.received.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_rejected_record_is_skipped() {
        let sink = ScriptedSink::new(vec![Ok(()), Err(SinkError::Rejected("schema".into()))]);
        let forwarder = Forwarder::new(Box::new(sink.clone()), RetryPolicy::immediate(3));

        let stats = forwarder.emit(&records(3)).unwrap();
        assert_eq!(
            stats,
            ForwardStats {
                delivered: 2,
                rejected: 1
            }
        );
        assert_eq!(*sink.received.lock(), vec![1, 3]);
    }

    #[test]
    fn test_transient_outage_is_retried() {
        let sink = ScriptedSink::new(vec![Err(SinkError::Unreachable("reset".into()))]);
        let forwarder = Forwarder::new(Box::new(sink.clone()), RetryPolicy::immediate(2));

        assert_eq!(forwarder.emit(&records(2)).unwrap().delivered, 2);
    }

    #[test]
    fn test_unreachable_sink_stops_the_batch() {
        let down = || Err(SinkError::Unreachable("connection refused".into()));
        let sink = ScriptedSink::new(vec![Ok(()), down(), down()]);
        let forwarder = Forwarder::new(Box::new(sink.clone()), RetryPolicy::immediate(2));

        match forwarder.emit(&records(4)).unwrap_err() {
            MinerError::ForwardUnavailable {
                delivered,
                undelivered,
                ..
            } => {
                assert_eq!(delivered, 1);
                assert_eq!(undelivered, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_open_sink_by_scheme() {
        assert!(open_sink("stdout://", Duration::from_secs(1)).is_ok());
        assert!(open_sink("http://collector:8080/occurrences", Duration::from_secs(1)).is_ok());
        assert!(open_sink("redis://redis:6379/log_sequences", Duration::from_secs(1)).is_ok());
        assert!(matches!(
            open_sink("amqp://broker:5672", Duration::from_secs(1)),
            Err(SinkError::InvalidUrl(_))
        ));
    }
}
