//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use miner::drain::DrainConfig;
use miner::fetch::{LogFetcher, LogSource, QueryRequest, SourceError};
use miner::filter::LineFilter;
use miner::forward::{Forwarder, Sink, SinkError};
use miner::job::{Job, JobSettings};
use miner::retry::RetryPolicy;
use miner::storage::{BackendError, MemoryBackend, StateBackend, StateStore};
use miner::types::{OccurrenceRecord, RawEntry};

pub const STATE_KEY: &str = "drain3_state";

/// A container-runtime envelope carrying `text` in its `log` field.
pub fn envelope(ts: u64, text: &str) -> RawEntry {
    RawEntry {
        timestamp_ns: ts,
        labels: BTreeMap::from([("namespace".to_string(), "npps".to_string())]),
        line: serde_json::json!({ "log": text, "stream": "stdout" }).to_string(),
    }
}

pub fn raw(ts: u64, line: &str) -> RawEntry {
    RawEntry {
        timestamp_ns: ts,
        labels: BTreeMap::new(),
        line: line.to_string(),
    }
}

// ================================================================================================
// LOG SOURCE
// ================================================================================================

/// Serves every entry pushed so far, whatever the window; can be switched off.
#[derive(Default)]
pub struct FakeLoki {
    entries: Mutex<Vec<RawEntry>>,
    down: AtomicBool,
    calls: AtomicUsize,
}

impl FakeLoki {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, entries: impl IntoIterator<Item = RawEntry>) {
        self.entries.lock().extend(entries);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LogSource for FakeLoki {
    fn query(&self, _request: &QueryRequest) -> Result<Vec<RawEntry>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("connection refused".into()));
        }
        Ok(self.entries.lock().clone())
    }
}

// ================================================================================================
// STATE BACKEND
// ================================================================================================

/// In-memory backend whose state key can be made unreachable.
/// The lock key always works.
#[derive(Default)]
pub struct SwitchableBackend {
    inner: MemoryBackend,
    state_down: AtomicBool,
    writes: AtomicUsize,
}

impl SwitchableBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_state_down(&self, down: bool) {
        self.state_down.store(down, Ordering::SeqCst);
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self, key: &str) -> Result<(), BackendError> {
        if key == STATE_KEY && self.state_down.load(Ordering::SeqCst) {
            Err(BackendError::Unavailable("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

impl StateBackend for SwitchableBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        self.check(key)?;
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), BackendError> {
        self.check(key)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value)
    }

    fn set_with_lease(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, BackendError> {
        self.inner.set_with_lease(key, value, ttl)
    }

    fn delete(&self, key: &str) -> Result<bool, BackendError> {
        self.check(key)?;
        self.inner.delete(key)
    }

    fn delete_if_equal(&self, key: &str, expected: &[u8]) -> Result<bool, BackendError> {
        self.check(key)?;
        self.inner.delete_if_equal(key, expected)
    }
}

// ================================================================================================
// SINK
// ================================================================================================

#[derive(Default)]
pub struct RecordingSink {
    received: Mutex<Vec<OccurrenceRecord>>,
    down: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<OccurrenceRecord> {
        self.received.lock().clone()
    }
}

impl Sink for RecordingSink {
    fn send(&self, record: &OccurrenceRecord) -> Result<(), SinkError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(SinkError::Unreachable("connection refused".into()));
        }
        self.received.lock().push(record.clone());
        Ok(())
    }
}

// ================================================================================================
// WIRING
// ================================================================================================

pub fn store(backend: Box<dyn StateBackend>) -> StateStore {
    StateStore::new(backend, STATE_KEY, false, RetryPolicy::immediate(2))
}

pub fn settings(drain: DrainConfig) -> JobSettings {
    JobSettings {
        drain,
        fetch_limit: 100,
        lock_ttl: Duration::from_secs(60),
        run_timeout: Duration::from_secs(30),
    }
}

pub fn job(
    source: Arc<FakeLoki>,
    backend: Box<dyn StateBackend>,
    sink: Arc<RecordingSink>,
    drain: DrainConfig,
) -> Job {
    let fetcher = LogFetcher::new(
        Box::new(source),
        "{namespace=\"npps\"}",
        Some(Duration::from_secs(3600)),
        RetryPolicy::immediate(2),
    );
    let forwarder = Forwarder::new(Box::new(sink), RetryPolicy::immediate(2));
    let filter = LineFilter::new(["log"]).expect("log field filter");
    Job::new(store(backend), fetcher, filter, forwarder, settings(drain))
}

pub fn login_drain() -> DrainConfig {
    DrainConfig {
        sim_threshold: 0.5,
        max_depth: 4,
        ..DrainConfig::default()
    }
}
