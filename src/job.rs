//! One scheduled mining run: lock, load, fetch, filter, classify, save,
//! forward, release.
//!
//! The clustering step is the pure function [`mine`]; [`Job`] does the I/O
//! around it and turns the outcome into a [`RunReport`].

use log::{debug, info, warn};
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::MinerConfig;
use crate::drain::{ClusterChange, ClusterTree, DrainConfig, TemplateMiner, TokenSequence};
use crate::error::MinerError;
use crate::fetch::{JsonlSource, LogFetcher, LokiSource};
use crate::filter::LineFilter;
use crate::forward::{open_sink, ForwardStats, Forwarder};
use crate::storage::{open_backend, PersistedState, StateOrigin, StateStore};
use crate::types::{Cursor, LogLine, OccurrenceRecord};

// ================================================================================================
// PURE MINING STEP
// ================================================================================================

/// What classifying one batch produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MiningOutcome {
    /// One record per classified line, in classification order.
    pub records: Vec<OccurrenceRecord>,
    pub lines_processed: usize,
    /// Lines refused by the tokenizer (control characters).
    pub lines_rejected: usize,
    pub new_clusters: usize,
    pub templates_changed: usize,
    pub clusters_evicted: usize,
}

/// Classify `lines` in order against `state`.
///
/// Line N sees the tree as left by line N-1. The cursor moves to the newest
/// line timestamp; it never moves backwards. Returns `RunTimedOut` without a
/// state once `deadline` has passed.
pub fn mine(
    state: PersistedState,
    lines: &[LogLine],
    config: &DrainConfig,
    deadline: Option<Instant>,
) -> Result<(PersistedState, MiningOutcome), MinerError> {
    let PersistedState { mut cursor, tree } = state;
    let mut miner = TemplateMiner::with_tree(config.clone(), tree);
    let mut outcome = MiningOutcome::default();

    for line in lines {
        if deadline.map_or(false, |at| Instant::now() >= at) {
            return Err(MinerError::RunTimedOut { stage: "classify" });
        }
        cursor.advance_to(line.timestamp_ns);

        let seq = match TokenSequence::parse(&line.text) {
            Ok(seq) => seq,
            Err(e) => {
                warn!("Skipping line at {}ns: {}", line.timestamp_ns, e);
                outcome.lines_rejected += 1;
                continue;
            }
        };

        let result = miner.classify(&seq);
        match result.change {
            ClusterChange::Created => outcome.new_clusters += 1,
            ClusterChange::TemplateChanged => outcome.templates_changed += 1,
            ClusterChange::Unchanged => {}
        }
        if result.evicted.is_some() {
            outcome.clusters_evicted += 1;
        }
        outcome.lines_processed += 1;

        debug!(
            "Cluster ID: {} ({:?}) template={:?} parameters={:?}",
            result.cluster_id,
            result.change,
            result.template,
            miner.extract_parameters(result.cluster_id, &seq)
        );

        outcome.records.push(OccurrenceRecord {
            cluster_id: result.cluster_id,
            template: result.template,
            sample: line.text.clone(),
            timestamp_ns: line.timestamp_ns,
            count: result.size,
        });
    }

    Ok((
        PersistedState {
            cursor,
            tree: miner.into_tree(),
        },
        outcome,
    ))
}

/// Log every cluster, oldest id first.
pub fn log_clusters(tree: &ClusterTree) {
    info!("Mined clusters:");
    for cluster in tree.clusters() {
        info!(
            "ID={} : size={} : {}",
            cluster.id(),
            cluster.size(),
            cluster.template_string()
        );
    }
}

// ================================================================================================
// RUN REPORT
// ================================================================================================

/// Whether occurrences reached the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Forwarding {
    Healthy,
    /// The sink became unreachable; state was saved anyway.
    Degraded { reason: String },
}

/// Statistics of one completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub lines_fetched: usize,
    pub lines_processed: usize,
    /// Dropped by the filter or refused by the tokenizer.
    pub lines_skipped: usize,
    pub new_clusters: usize,
    pub templates_changed: usize,
    pub clusters_evicted: usize,
    pub total_clusters: usize,
    pub forwarded: usize,
    /// Rejected plus undelivered records.
    pub forward_failures: usize,
    pub forwarding: Forwarding,
    pub state_origin: StateOrigin,
    pub state_bytes: usize,
    pub cursor_before: Cursor,
    pub cursor_after: Cursor,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn is_degraded(&self) -> bool {
        self.forwarding != Forwarding::Healthy
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run {}: fetched={} processed={} skipped={} new_clusters={} changed={} evicted={} \
             clusters={} forwarded={} forward_failures={} state={} cursor={}->{} in {}ms",
            self.run_id,
            self.lines_fetched,
            self.lines_processed,
            self.lines_skipped,
            self.new_clusters,
            self.templates_changed,
            self.clusters_evicted,
            self.total_clusters,
            self.forwarded,
            self.forward_failures,
            self.state_origin,
            self.cursor_before,
            self.cursor_after,
            self.duration_ms
        )?;
        if let Forwarding::Degraded { reason } = &self.forwarding {
            write!(f, " (forwarding degraded: {})", reason)?;
        }
        Ok(())
    }
}

// ================================================================================================
// JOB
// ================================================================================================

/// Run-level knobs that are not owned by a collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSettings {
    pub drain: DrainConfig,
    pub fetch_limit: usize,
    pub lock_ttl: Duration,
    pub run_timeout: Duration,
}

impl From<&MinerConfig> for JobSettings {
    fn from(config: &MinerConfig) -> Self {
        Self {
            drain: config.drain.clone(),
            fetch_limit: config.loki_limit,
            lock_ttl: config.run_lock_ttl,
            run_timeout: config.run_timeout,
        }
    }
}

pub struct Job {
    store: StateStore,
    fetcher: LogFetcher,
    filter: LineFilter,
    forwarder: Forwarder,
    settings: JobSettings,
}

impl Job {
    pub fn new(
        store: StateStore,
        fetcher: LogFetcher,
        filter: LineFilter,
        forwarder: Forwarder,
        settings: JobSettings,
    ) -> Self {
        Self {
            store,
            fetcher,
            filter,
            forwarder,
            settings,
        }
    }

    /// Wire a job from configuration. With `replay`, entries come from a
    /// jsonl capture instead of Loki.
    pub fn from_config(config: &MinerConfig, replay: Option<&Path>) -> Result<Self, MinerError> {
        config.validate()?;

        let store = open_store(config)?;

        let fetcher = match replay {
            Some(path) => LogFetcher::new(
                Box::new(JsonlSource::new(path)),
                config.loki_query.clone(),
                None,
                config.fetch_retry.clone(),
            ),
            None => {
                let loki = LokiSource::new(config.loki_url.clone(), config.http_timeout)
                    .map_err(|e| MinerError::Config(e.to_string()))?;
                LogFetcher::new(
                    Box::new(loki),
                    config.loki_query.clone(),
                    Some(config.loki_lookback),
                    config.fetch_retry.clone(),
                )
            }
        };

        let filter = LineFilter::new(config.log_fields.iter().cloned())?;

        let sink = open_sink(&config.sink_url, config.http_timeout)
            .map_err(|e| MinerError::Config(e.to_string()))?;
        let forwarder = Forwarder::new(sink, config.forward_retry.clone());

        Ok(Self::new(
            store,
            fetcher,
            filter,
            forwarder,
            JobSettings::from(config),
        ))
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Execute one run.
    ///
    /// **Order**:
    /// 1. Take the run lock (contention ends the run with `LockContention`)
    /// 2. Load state; an unreachable backend aborts before anything is fetched
    /// 3. Fetch entries after the cursor; failure aborts without saving
    /// 4. Filter and classify in fetch order
    /// 5. Save state, even when nothing was fetched
    /// 6. Forward occurrences; an unreachable sink only degrades the run
    /// 7. Release the lock, whatever happened above
    ///
    /// Past the run timeout the run stops before saving.
    pub fn run_once(&self) -> Result<RunReport, MinerError> {
        let started = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        info!("Starting mining run {}", run_id);

        let lease = self.store.acquire_lock(self.settings.lock_ttl)?;
        let result = self.run_locked(run_id, started);

        match self.store.release_lock(lease) {
            Ok(true) => debug!("Released run lock"),
            Ok(false) => {}
            Err(e) => warn!("Failed to release run lock: {}", e),
        }

        match &result {
            Ok(report) if report.is_degraded() => warn!("Run completed degraded: {}", report),
            Ok(report) => info!("Run completed: {}", report),
            Err(e) => warn!("Run aborted: {}", e),
        }
        result
    }

    fn run_locked(&self, run_id: String, started: Instant) -> Result<RunReport, MinerError> {
        let deadline = started + self.settings.run_timeout;
        let check = |stage: &'static str| {
            if Instant::now() >= deadline {
                Err(MinerError::RunTimedOut { stage })
            } else {
                Ok(())
            }
        };

        let loaded = self.store.load()?;
        check("load")?;
        let cursor_before = loaded.state.cursor;
        info!(
            "State {} with {} cluster(s), cursor {}",
            loaded.origin,
            loaded.state.tree.len(),
            cursor_before
        );

        let entries = self.fetcher.fetch(cursor_before, self.settings.fetch_limit)?;
        check("fetch")?;
        if entries.is_empty() {
            info!("No logs retrieved from the log store");
        }

        let (lines, filter_stats) = self.filter.filter(&entries);
        if filter_stats.skipped() > 0 {
            warn!(
                "Filtered out {} of {} entries (not json: {}, missing field: {}, empty: {})",
                filter_stats.skipped(),
                entries.len(),
                filter_stats.not_json,
                filter_stats.missing_field,
                filter_stats.empty
            );
        }

        let (mut state, outcome) = mine(loaded.state, &lines, &self.settings.drain, Some(deadline))?;
        if let Some(newest) = entries.iter().map(|e| e.timestamp_ns).max() {
            state.cursor.advance_to(newest);
        }

        check("save")?;
        let state_bytes = self.store.save(&state)?;
        info!(
            "Saved state: {} cluster(s), cursor {}, {} bytes",
            state.tree.len(),
            state.cursor,
            state_bytes
        );
        log_clusters(&state.tree);

        let (stats, forwarding, undelivered) = match self.forwarder.emit(&outcome.records) {
            Ok(stats) => (stats, Forwarding::Healthy, 0),
            Err(MinerError::ForwardUnavailable {
                delivered,
                undelivered,
                reason,
            }) => (
                ForwardStats {
                    delivered,
                    rejected: 0,
                },
                Forwarding::Degraded { reason },
                undelivered,
            ),
            Err(other) => return Err(other),
        };

        Ok(RunReport {
            run_id,
            lines_fetched: entries.len(),
            lines_processed: outcome.lines_processed,
            lines_skipped: filter_stats.skipped() + outcome.lines_rejected,
            new_clusters: outcome.new_clusters,
            templates_changed: outcome.templates_changed,
            clusters_evicted: outcome.clusters_evicted,
            total_clusters: state.tree.len(),
            forwarded: stats.delivered,
            forward_failures: stats.rejected + undelivered,
            forwarding,
            state_origin: loaded.origin,
            state_bytes,
            cursor_before,
            cursor_after: state.cursor,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Open the configured state store without wiring the rest of a job.
pub fn open_store(config: &MinerConfig) -> Result<StateStore, MinerError> {
    let backend = open_backend(&config.state_backend_url, config.http_timeout).map_err(|e| {
        MinerError::StateUnavailable {
            attempts: 1,
            reason: e.to_string(),
        }
    })?;
    Ok(StateStore::new(
        backend,
        config.state_key.clone(),
        config.state_compress,
        config.state_retry.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(ts: u64, text: &str) -> LogLine {
        LogLine {
            text: text.to_string(),
            timestamp_ns: ts,
        }
    }

    fn login_config() -> DrainConfig {
        DrainConfig {
            sim_threshold: 0.5,
            max_depth: 4,
            ..DrainConfig::default()
        }
    }

    #[test]
    fn test_mine_login_scenario() {
        let lines = vec![
            line(1, "user 123 login ok"),
            line(2, "user 456 login ok"),
            line(3, "disk full on /dev/sda1"),
        ];
        let (state, outcome) =
            mine(PersistedState::default(), &lines, &login_config(), None).unwrap();

        let ids: Vec<u64> = outcome.records.iter().map(|r| r.cluster_id).collect();
        assert_eq!(ids, vec![1, 1, 2]);
        assert_eq!(outcome.records[1].template, "user <*> login ok");
        assert_eq!(outcome.records[1].count, 2);
        assert_eq!(outcome.new_clusters, 2);
        assert_eq!(outcome.templates_changed, 1);
        assert_eq!(state.tree.len(), 2);
        assert_eq!(state.cursor, Cursor::new(3));
    }

    #[test]
    fn test_mine_skips_rejected_lines() {
        let lines = vec![line(5, "bad\u{0007}bell"), line(6, "ok line")];
        let (state, outcome) =
            mine(PersistedState::default(), &lines, &DrainConfig::default(), None).unwrap();
        assert_eq!(outcome.lines_rejected, 1);
        assert_eq!(outcome.lines_processed, 1);
        assert_eq!(state.cursor, Cursor::new(6));
    }

    #[test]
    fn test_mine_empty_batch_keeps_state() {
        let (state, _) = mine(
            PersistedState::default(),
            &[line(1, "a b c")],
            &DrainConfig::default(),
            None,
        )
        .unwrap();

        let (again, outcome) = mine(state.clone(), &[], &DrainConfig::default(), None).unwrap();
        assert_eq!(again, state);
        assert_eq!(outcome, MiningOutcome::default());
    }

    #[test]
    fn test_mine_never_moves_cursor_backwards() {
        let state = PersistedState {
            cursor: Cursor::new(100),
            ..PersistedState::default()
        };
        let (state, _) = mine(state, &[line(50, "late line")], &DrainConfig::default(), None).unwrap();
        assert_eq!(state.cursor, Cursor::new(100));
    }

    #[test]
    fn test_mine_past_deadline_times_out() {
        let deadline = Instant::now();
        let result = mine(
            PersistedState::default(),
            &[line(1, "a")],
            &DrainConfig::default(),
            Some(deadline),
        );
        assert!(matches!(
            result,
            Err(MinerError::RunTimedOut { stage: "classify" })
        ));
    }

    #[test]
    fn test_report_display() {
        let report = RunReport {
            run_id: "r1".into(),
            lines_fetched: 3,
            lines_processed: 2,
            lines_skipped: 1,
            new_clusters: 1,
            templates_changed: 1,
            clusters_evicted: 0,
            total_clusters: 1,
            forwarded: 0,
            forward_failures: 2,
            forwarding: Forwarding::Degraded {
                reason: "sink down".into(),
            },
            state_origin: StateOrigin::Fresh,
            state_bytes: 64,
            cursor_before: Cursor::default(),
            cursor_after: Cursor::new(3),
            duration_ms: 5,
        };
        let text = report.to_string();
        assert!(report.is_degraded());
        assert!(text.contains("processed=2"));
        assert!(text.contains("cursor=0ns->3ns"));
        assert!(text.ends_with("(forwarding degraded: sink down)"));
    }
}
