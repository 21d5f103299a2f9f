use std::fs;
use std::io::Write;
use std::path::Path;

use miner::config::MinerConfig;
use miner::drain::DrainConfig;
use miner::job::{open_store, Job};
use miner::storage::StateOrigin;
use miner::types::{Cursor, OccurrenceRecord};

fn write_capture(path: &Path, rows: &[(&str, &str)]) {
    let mut file = fs::File::create(path).unwrap();
    for (ts, text) in rows {
        let line = serde_json::json!({ "log": text }).to_string();
        let row = serde_json::json!({
            "labels": { "namespace": "npps" },
            "line": line,
            "timestamp": ts,
        });
        writeln!(file, "{}", row).unwrap();
    }
}

fn config(state_url: String, sink_path: &Path) -> MinerConfig {
    MinerConfig {
        state_backend_url: state_url,
        sink_url: format!("file://{}", sink_path.display()),
        drain: DrainConfig {
            sim_threshold: 0.5,
            max_depth: 4,
            ..DrainConfig::default()
        },
        ..MinerConfig::default()
    }
}

fn occurrences(path: &Path) -> Vec<OccurrenceRecord> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn replay_twice(state_url: String, dir: &Path) {
    let capture = dir.join("capture.jsonl");
    let sink = dir.join("occurrences.jsonl");
    write_capture(
        &capture,
        &[
            ("2024-05-01T10:00:00.000000001Z", "user 123 login ok"),
            ("2024-05-01T10:00:00.000000002Z", "user 456 login ok"),
            ("2024-05-01T10:00:00.000000003Z", "disk full on /dev/sda1"),
        ],
    );
    let config = config(state_url, &sink);

    let report = Job::from_config(&config, Some(&capture))
        .unwrap()
        .run_once()
        .unwrap();
    assert_eq!(report.state_origin, StateOrigin::Fresh);
    assert_eq!(report.lines_processed, 3);
    assert_eq!(report.new_clusters, 2);

    let written = occurrences(&sink);
    assert_eq!(written.len(), 3);
    assert_eq!(written[1].template, "user <*> login ok");

    // Same capture again: everything is at or before the cursor.
    let report = Job::from_config(&config, Some(&capture))
        .unwrap()
        .run_once()
        .unwrap();
    assert_eq!(report.state_origin, StateOrigin::Restored);
    assert_eq!(report.lines_fetched, 0);
    assert_eq!(report.cursor_after, report.cursor_before);
    assert_eq!(occurrences(&sink).len(), 3);

    let loaded = open_store(&config).unwrap().load().unwrap();
    assert_eq!(loaded.state.tree.len(), 2);
    assert!(loaded.state.cursor > Cursor::default());
}

#[test]
fn test_replay_with_sqlite_state() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", tmp_dir.path().join("state.db").display());
    replay_twice(url, tmp_dir.path());
}

#[test]
fn test_replay_with_file_state() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let url = format!("file://{}", tmp_dir.path().join("state").display());
    replay_twice(url, tmp_dir.path());
}

#[test]
fn test_compressed_state_round_trips() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let capture = tmp_dir.path().join("capture.jsonl");
    let sink = tmp_dir.path().join("occurrences.jsonl");
    write_capture(&capture, &[("10", "job 17 finished in 3s"), ("11", "job 18 finished in 4s")]);

    let mut config = config(
        format!("sqlite://{}", tmp_dir.path().join("state.db").display()),
        &sink,
    );
    config.state_compress = true;

    Job::from_config(&config, Some(&capture))
        .unwrap()
        .run_once()
        .unwrap();

    let loaded = open_store(&config).unwrap().load().unwrap();
    assert_eq!(loaded.origin, StateOrigin::Restored);
    assert_eq!(loaded.state.cursor, Cursor::new(11));
    let cluster = loaded.state.tree.clusters().next().unwrap();
    assert_eq!(cluster.template_string(), "job <*> finished in <*>");
    assert_eq!(cluster.size(), 2);
}

#[test]
fn test_reset_clears_state() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let capture = tmp_dir.path().join("capture.jsonl");
    let sink = tmp_dir.path().join("occurrences.jsonl");
    write_capture(&capture, &[("10", "service started")]);
    let config = config(
        format!("file://{}", tmp_dir.path().join("state").display()),
        &sink,
    );

    Job::from_config(&config, Some(&capture))
        .unwrap()
        .run_once()
        .unwrap();

    let store = open_store(&config).unwrap();
    assert!(store.reset().unwrap());
    assert_eq!(store.load().unwrap().origin, StateOrigin::Fresh);
}

#[test]
fn test_truncated_file_state_is_rebuilt() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let capture = tmp_dir.path().join("capture.jsonl");
    let sink = tmp_dir.path().join("occurrences.jsonl");
    let state_dir = tmp_dir.path().join("state");
    write_capture(&capture, &[("10", "service started")]);
    let config = config(format!("file://{}", state_dir.display()), &sink);

    fs::create_dir_all(&state_dir).unwrap();
    fs::write(state_dir.join(&config.state_key), b"abc").unwrap();

    let report = Job::from_config(&config, Some(&capture))
        .unwrap()
        .run_once()
        .unwrap();
    assert_eq!(report.state_origin, StateOrigin::Rebuilt);
    assert_eq!(report.new_clusters, 1);

    let loaded = open_store(&config).unwrap().load().unwrap();
    assert_eq!(loaded.origin, StateOrigin::Restored);
    assert_eq!(loaded.state.cursor, Cursor::new(10));
}
