#![allow(deprecated)]
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;

fn fixture_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn fixture(name: &str) -> PathBuf {
    fixture_dir().join(format!("{name}.json"))
}

/// `goat check` on a fixture, isolated from any goat.toml around the repo.
fn check(name: &str) -> Command {
    let mut cmd = Command::cargo_bin("goat").unwrap();
    cmd.arg("check")
        .arg(fixture(name))
        .arg("--config")
        .arg(fixture_dir().join("goat.toml"))
        .arg("--no-color");
    cmd
}

#[test]
fn test_version() {
    Command::cargo_bin("goat")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"goat \d+\.\d+\.\d+").unwrap());
}

#[test]
fn test_version_long_includes_git_hash() {
    let output = Command::cargo_bin("goat")
        .unwrap()
        .arg("--version")
        .output()
        .unwrap();
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(
        stdout.contains('(') && stdout.contains(')'),
        "expected git hash in parens, got: {stdout}"
    );
}

#[test]
fn test_clean_program_exits_zero() {
    check("handoff")
        .assert()
        .code(0)
        .stdout(predicate::str::contains("No blocking bugs found"));
}

#[test]
fn test_leak_exits_one() {
    check("leak")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("BLOCK002"))
        .stdout(predicate::str::contains("main.go:3"));
}

#[test]
fn test_leak_below_severity_threshold_exits_zero() {
    check("leak")
        .args(["--severity-threshold", "critical"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("BLOCK002").not());
    check("leak")
        .args(["--severity-threshold", "error"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("BLOCK002"));
}

#[test]
fn test_double_lock_reports_deadlock() {
    check("double_lock")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("BLOCK001"))
        .stdout(predicate::str::contains("Lock"));
}

#[test]
fn test_send_on_closed_reports_panic() {
    check("send_on_closed")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("PANIC001"))
        .stdout(predicate::str::contains("BLOCK").not());
}

#[test]
fn test_json_report() {
    let output = check("leak").args(["--format", "json"]).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let entry = &report["entries"][0];
    assert_eq!(entry["entry"], "main.main");
    assert_eq!(entry["outcome"], "complete");
    assert_eq!(entry["blocks"][0]["classification"], "leak");
    assert_eq!(entry["blocks"][0]["blocked"][0]["operation"], "send");
    assert_eq!(report["summary"]["blocks"], 1);
}

#[test]
fn test_json_metrics_are_opt_in() {
    let output = check("leak")
        .args(["--format", "json", "--metrics"])
        .output()
        .unwrap();
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(report["entries"][0]["metrics"]["superlocations"].as_u64().unwrap() > 0);
}

#[test]
fn test_sarif_output() {
    let output = check("double_lock")
        .args(["--format", "sarif"])
        .output()
        .unwrap();
    let sarif: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(sarif["version"], "2.1.0");
    assert_eq!(sarif["runs"][0]["tool"]["driver"]["name"], "goat");
    assert_eq!(sarif["runs"][0]["results"][0]["ruleId"], "BLOCK001");
}

#[test]
fn test_unbounded_spawn_exits_two() {
    check("spawn_loop")
        .assert()
        .code(2)
        .stdout(predicate::str::contains("unbounded goroutine spawn"));
}

#[test]
fn test_malformed_input_exits_two() {
    check("dangling_operand")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("error:"));
}

#[test]
fn test_missing_input_exits_two() {
    check("does_not_exist").assert().code(2);
}

#[test]
fn test_unknown_policy_exits_two() {
    check("leak")
        .args(["--policy", "everything"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown fragment policy"));
}

#[test]
fn test_unknown_entry_exits_two() {
    check("leak").args(["--entry", "TestMissing"]).assert().code(2);
}

#[test]
fn test_explain_rule() {
    Command::cargo_bin("goat")
        .unwrap()
        .args(["explain", "block002"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Goroutine leak"));
}

#[test]
fn test_explain_unknown_rule() {
    Command::cargo_bin("goat")
        .unwrap()
        .args(["explain", "NIL001"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown rule"));
}

#[test]
fn test_init_creates_config_once() {
    let dir = tempfile::tempdir().unwrap();
    Command::cargo_bin("goat")
        .unwrap()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created goat.toml"));
    let written = std::fs::read_to_string(dir.path().join("goat.toml")).unwrap();
    assert!(written.contains("fragment_policy"));

    Command::cargo_bin("goat")
        .unwrap()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .code(2);
}

#[test]
fn test_config_is_discovered_next_to_input() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("leak.json");
    std::fs::copy(fixture("leak"), &input).unwrap();
    std::fs::write(dir.path().join("goat.toml"), "[output]\nformat = \"json\"\n").unwrap();
    let output = Command::cargo_bin("goat")
        .unwrap()
        .arg("check")
        .arg(&input)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["summary"]["blocks"], 1);
}
