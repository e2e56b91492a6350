#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

const STREAM: &str = r#"{"kind":"insert","key":"K","value":"V1","msn":10}
{"kind":"insert","key":"K","value":"V2","msn":10}

{"kind":"insert","key":"K","value":"V3","msn":11}
{"kind":"insert","key":"K","value":"V4","msn":1}
{"kind":"insert","key":"T","value":"t","msn":12,"xids":[5]}
{"kind":"update","key":"K","value":"+","msn":13}
{"kind":"commit_broadcast_txn","msn":14,"xids":[5]}
"#;

fn write_stream(contents: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("messages.jsonl");
    fs::write(&path, contents).expect("write stream");
    (dir, path)
}

fn replay(path: &Path, extra: &[&str]) -> Value {
    let output = cargo_bin_cmd!("msn-replay")
        .args(extra)
        .arg(path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("summary is json")
}

#[test]
fn summary_reports_filtered_messages() {
    let (_dir, path) = write_stream(STREAM);
    let summary = replay(&path, &[]);
    assert_eq!(summary["messages"], 7);
    assert_eq!(summary["accepted"], 5);
    assert_eq!(summary["rejected"], 2);
    assert_eq!(summary["watermark"], 14);
    let entries = summary["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["key"], "K");
    assert_eq!(entries[0]["value"], "V3+");
    assert_eq!(entries[1]["key"], "T");
    assert_eq!(entries[1]["value"], "t");
}

#[test]
fn shuffled_delivery_converges_for_single_key() {
    let stream: String = (1..=40)
        .map(|msn| format!("{{\"kind\":\"insert\",\"key\":\"K\",\"value\":\"v{msn}\",\"msn\":{msn}}}\n"))
        .collect();
    let (_dir, path) = write_stream(&stream);
    for seed in ["1", "7", "42"] {
        let summary = replay(&path, &["--shuffle", seed]);
        assert_eq!(summary["watermark"], 40);
        assert_eq!(summary["entries"][0]["value"], "v40");
    }
}

#[test]
fn persisted_store_and_config_are_honoured() {
    let (dir, path) = write_stream(STREAM);
    let config = dir.path().join("tree.toml");
    fs::write(&config, "[leaf]\nprune_on_apply = true\n").expect("write config");
    let store = dir.path().join("store");

    let config_arg = config.to_str().expect("utf8 path");
    let store_arg = store.to_str().expect("utf8 path");
    replay(&path, &["--config", config_arg, "--store", store_arg]);
    assert!(store.join("tree.meta").exists());

    // Replaying the same stream into the persisted leaf rejects everything.
    let summary = replay(&path, &["--config", config_arg, "--store", store_arg]);
    assert_eq!(summary["accepted"], 0);
    assert_eq!(summary["rejected"], 7);
    assert_eq!(summary["entries"][0]["value"], "V3+");
}

#[test]
fn malformed_lines_fail_with_location() {
    let (_dir, path) = write_stream(
        "{\"kind\":\"insert\",\"key\":\"a\",\"value\":\"b\",\"msn\":1}\n{\"kind\":\"bogus\",\"msn\":2}\n",
    );
    let stderr = cargo_bin_cmd!("msn-replay")
        .arg(&path)
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8_lossy(&stderr);
    assert!(stderr.contains("line 2"), "unexpected stderr: {stderr}");
    assert!(stderr.contains("bogus"));
}
