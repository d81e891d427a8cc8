#![allow(missing_docs)]

#[path = "../common/mod.rs"]
mod common;

use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use common::{open_small, write_records};
use serde_json::Value;
use tempfile::TempDir;

fn setup_log() -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    seed_log(dir.path());
    dir
}

fn seed_log(path: &Path) {
    let (log, _pool) = open_small(path);
    write_records(&log, 0, 40, 300);
    log.request_checkpoint(true).expect("checkpoint");
    log.shutdown().expect("shutdown");
}

fn json_output(args: &[&str], dir: &Path) -> Value {
    let output = cargo_bin_cmd!("redolog")
        .args(["--format", "json"])
        .args(args)
        .arg(dir)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn inspect_reports_headers_as_json() {
    let dir = setup_log();
    let json = json_output(&["inspect"], dir.path());
    let files = json["files"].as_array().expect("files");
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["id"], 0);
    assert_eq!(files[0]["header"]["start_lsn"], 8192);
    assert_eq!(files[0]["slots"].as_array().unwrap().len(), 2);
    assert!(files[0]["encryption"].is_null());
}

#[test]
fn recover_matches_last_checkpoint() {
    let dir = setup_log();
    let inspect = json_output(&["inspect"], dir.path());
    let newest = inspect["files"][0]["slots"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|slot| slot["checkpoint_lsn"].as_u64())
        .max()
        .unwrap();
    let recover = json_output(&["recover"], dir.path());
    assert_eq!(recover["checkpoint_lsn"].as_u64(), Some(newest));
    assert!(newest > 8204);
    assert_eq!(recover["file_id"], 0);
}

#[test]
fn text_output_and_missing_log() {
    let dir = setup_log();
    let output = cargo_bin_cmd!("redolog")
        .arg("inspect")
        .arg(dir.path())
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("File 0"));
    assert!(text.contains("checkpoint_lsn="));

    let empty = TempDir::new().unwrap();
    cargo_bin_cmd!("redolog")
        .arg("recover")
        .arg(empty.path())
        .assert()
        .failure();
}

#[test]
fn workload_reports_status() {
    let dir = TempDir::new().unwrap();
    let output = cargo_bin_cmd!("redolog")
        .args(["--format", "json", "workload"])
        .arg(dir.path())
        .args(["--threads", "2", "--records", "200", "--record-size", "100"])
        .args(["--file-size", "65536"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    let current = json["current_lsn"].as_u64().unwrap();
    assert!(current > 8204 + 2 * 200 * 100);
    assert_eq!(json["flushed_to_disk_lsn"].as_u64(), Some(current));
    assert!(json["last_checkpoint_lsn"].as_u64().unwrap() <= current);

    cargo_bin_cmd!("redolog")
        .args(["archive-files"])
        .arg(dir.path())
        .assert()
        .success();
}
