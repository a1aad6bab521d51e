#![allow(missing_docs)]

use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use lineage::session::{Identity, SessionConfig};
use lineage::SessionManager;
use serde_json::Value;
use tempfile::TempDir;

fn run_json(args: &[&str]) -> Value {
    let output = cargo_bin_cmd!("lineage")
        .args(args)
        .arg("--format")
        .arg("json")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

fn init_db(dir: &TempDir) -> String {
    let db = dir.path().join("db");
    let db = db.to_str().expect("utf-8 path").to_string();
    let report = run_json(&["init", &db, "--name", "demo", "--block-size", "512"]);
    assert_eq!(report["session"], 1);
    assert_eq!(report["name"], "demo");
    assert_eq!(report["block_size"], 512);
    db
}

#[test]
fn init_commit_and_inspect() {
    let dir = TempDir::new().unwrap();
    let db = init_db(&dir);

    let report = run_json(&["commit", &db, "--title", "first"]);
    assert_eq!(report["session"], 2);
    assert_eq!(report["parent"], 1);
    assert_eq!(report["retired"], Value::Array(Vec::new()));

    let status = run_json(&["status", &db]);
    assert_eq!(status["name"], "demo");
    assert_eq!(status["session"], 2);
    assert_eq!(status["schema_version"], 1);
    assert_eq!(status["live_sessions"], 2);
    assert!(status["lock_holder"].is_null());
    assert_eq!(status["readers"], 0);

    let chain = run_json(&["chain", &db]);
    let entries = chain.as_array().expect("array");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["permanent"], true);
    assert_eq!(entries[1]["title"], "first");
    assert_eq!(entries[1]["generation"], 2);

    let lock = run_json(&["lock", &db]);
    assert_eq!(lock["locked"], false);
}

#[test]
fn repeated_commits_retire_through_the_cli() {
    let dir = TempDir::new().unwrap();
    let db = init_db(&dir);
    let mut last = Value::Null;
    for _ in 0..4 {
        last = run_json(&["commit", &db, "--json"]);
    }
    assert_eq!(last["session"], 5);
    let chain = run_json(&["chain", &db]);
    let live: Vec<u64> = chain
        .as_array()
        .unwrap()
        .iter()
        .filter(|e| e["live"] == true)
        .map(|e| e["number"].as_u64().unwrap())
        .collect();
    assert_eq!(live, vec![1, 4, 5]);
}

#[test]
fn text_output_names_readers_and_lock_holder() {
    let dir = TempDir::new().unwrap();
    let db = init_db(&dir);

    let output = cargo_bin_cmd!("lineage")
        .args(["readers", &db])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert!(String::from_utf8_lossy(&output).contains("no active readers"));

    let mut holder = SessionManager::builder(Path::new(&db))
        .config(SessionConfig::load_from_dir(&db).unwrap())
        .identity(Identity::new("ops", "console", 4242))
        .open()
        .unwrap();
    holder.begin_write().unwrap();

    let output = cargo_bin_cmd!("lineage")
        .args(["lock", &db])
        .assert()
        .success()
        .get_output()
        .stderr
        .clone();
    assert!(String::from_utf8_lossy(&output).contains("ops@console:4242"));

    let readers = run_json(&["readers", &db]);
    assert_eq!(readers["active"][0]["pid"], 4242);

    cargo_bin_cmd!("lineage")
        .args(["commit", &db])
        .assert()
        .code(2);

    holder.end_write().unwrap();
    cargo_bin_cmd!("lineage")
        .args(["commit", &db])
        .assert()
        .success();
}

#[test]
fn init_refuses_an_existing_database() {
    let dir = TempDir::new().unwrap();
    let db = init_db(&dir);
    cargo_bin_cmd!("lineage")
        .args(["init", &db, "--name", "again"])
        .assert()
        .code(1);
    let status = run_json(&["status", &db]);
    assert_eq!(status["name"], "demo");
}
