//! CLI integration tests for the `statetree` binary.
//!
//! Uses `assert_cmd` to spawn the binary and verify exit codes, stdout and
//! stderr. Tests run from the workspace root so the `fixtures/` paths
//! resolve.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Locate the workspace root by walking up from CARGO_MANIFEST_DIR.
fn workspace_root() -> PathBuf {
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    manifest_dir
        .parent()
        .and_then(|p| p.parent())
        .expect("workspace root")
        .to_path_buf()
}

fn statetree() -> Command {
    let mut cmd = cargo_bin_cmd!("statetree");
    cmd.current_dir(workspace_root());
    cmd
}

fn write_file(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, contents).expect("write fixture");
    path
}

// ──────────────────────────────────────────────
// 1. Help and version
// ──────────────────────────────────────────────

#[test]
fn help_exits_0_with_description() {
    statetree()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("StateTree library validator and runner"));
}

#[test]
fn version_exits_0() {
    statetree()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("statetree"));
}

// ──────────────────────────────────────────────
// 2. Validate
// ──────────────────────────────────────────────

#[test]
fn validate_reports_every_tree() {
    statetree()
        .args(["validate", "fixtures/door.json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("valid: 2 tree(s)"))
        .stdout(predicate::str::contains("Door: 4 states, 3 tasks"))
        .stdout(predicate::str::contains("Patrol:"));
}

#[test]
fn validate_json_output() {
    let out = statetree()
        .args(["--output", "json", "validate", "fixtures/door.json"])
        .output()
        .unwrap();
    assert!(out.status.success());
    let json: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(json["valid"], true);
    assert_eq!(json["trees"][0]["name"], "Door");
    assert_eq!(json["trees"][1]["frames"], 2);
}

#[test]
fn validate_missing_file_exits_1() {
    statetree()
        .args(["validate", "fixtures/does-not-exist.json"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("error reading file"));
}

#[test]
fn validate_unknown_transition_target_exits_1() {
    let dir = TempDir::new().unwrap();
    let path = write_file(
        &dir,
        "broken.json",
        r#"{"trees":[{"name":"T","root":{"name":"Root","transitions":[
            {"trigger":"OnTick","target":{"GotoState":"Nowhere"}}]}}]}"#,
    );
    statetree()
        .args(["validate", path.to_str().unwrap()])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("compile error"));
}

#[test]
fn validate_malformed_json_exits_1() {
    let dir = TempDir::new().unwrap();
    let path = write_file(&dir, "bad.json", "{ not json");
    statetree()
        .args(["validate", path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error parsing JSON"));
}

// ──────────────────────────────────────────────
// 3. Run
// ──────────────────────────────────────────────

#[test]
fn run_with_scripted_event_reaches_success() {
    statetree()
        .args([
            "run",
            "fixtures/door.json",
            "--tree",
            "Door",
            "--ticks",
            "10",
            "--event",
            "2:door.open",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Root > Opening"))
        .stdout(predicate::str::contains("Root > Open"))
        .stdout(predicate::str::contains("status: Succeeded"));
}

#[test]
fn run_without_events_stays_closed() {
    statetree()
        .args(["run", "fixtures/door.json", "--ticks", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Root > Closed"))
        .stdout(predicate::str::contains("Opening").not())
        .stdout(predicate::str::contains("status: Running"));
}

#[test]
fn run_file_supplies_tree_ticks_and_events() {
    let out = statetree()
        .args([
            "--output",
            "json",
            "run",
            "fixtures/door.json",
            "--config",
            "fixtures/door.run.toml",
        ])
        .output()
        .unwrap();
    assert!(out.status.success());
    let json: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(json["tree"], "Door");
    assert_eq!(json["status"], "Succeeded");
    let ticks = json["ticks"].as_array().unwrap();
    assert_eq!(ticks[0]["tick"], 0);
    assert_eq!(ticks[0]["active"], serde_json::json!(["Root", "Closed"]));
    // Start, then Opening and Open entered.
    assert_eq!(json["recorded_transitions"].as_array().unwrap().len(), 3);
}

#[test]
fn run_failed_subtree_recovers_in_parent() {
    statetree()
        .args(["run", "fixtures/door.json", "--tree", "Patrol", "--ticks", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Root > Walk > Leg"))
        .stdout(predicate::str::contains("Root > Rest"));
}

#[test]
fn run_quiet_prints_only_final_status() {
    statetree()
        .args(["--quiet", "run", "fixtures/door.json", "--ticks", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("status: Running"))
        .stdout(predicate::str::contains("tick").not());
}

#[test]
fn run_unknown_tree_exits_1() {
    statetree()
        .args(["run", "fixtures/door.json", "--tree", "Gate"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("unknown tree 'Gate'"));
}

#[test]
fn run_malformed_event_exits_1() {
    statetree()
        .args(["run", "fixtures/door.json", "--event", "door.open"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected TICK:TAG"));
}

#[test]
fn run_file_with_unknown_key_exits_1() {
    let dir = TempDir::new().unwrap();
    let path = write_file(&dir, "run.toml", "tick_count = 4\n");
    statetree()
        .args(["run", "fixtures/door.json", "--config", path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid run file"));
}
