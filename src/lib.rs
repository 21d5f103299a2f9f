//! # Log Template Miner
//!
//! Scheduled batch job that pulls recent container logs from Loki, mines
//! their templates with a Drain tree, persists the tree and fetch cursor
//! between runs, and forwards one occurrence record per classified line.
//!
//! ## Modules
//! - `drain`: clustering tree and template miner
//! - `fetch`: cursor-bounded log fetching (Loki, jsonl replay)
//! - `filter`: JSON payload extraction and timestamp stripping
//! - `storage`: persisted state, backends and the run lock
//! - `forward`: occurrence sinks
//! - `job`: one run wired end to end
//! - `config`, `retry`, `error`, `types`: shared plumbing

pub mod config;
pub mod drain;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod forward;
pub mod job;
pub mod retry;
pub mod storage;
pub mod types;

pub use config::MinerConfig;
pub use drain::{DrainConfig, TemplateMiner};
pub use error::{InputError, MinerError};
pub use job::{mine, Job, MiningOutcome, RunReport};
pub use retry::RetryPolicy;
pub use storage::{PersistedState, StateStore};
pub use types::{Cursor, LogLine, OccurrenceRecord, RawEntry};
