//! CLI integration tests
//!
//! Tests the command-line interface using assert_cmd

use assert_cmd::Command;
use predicates::prelude::*;

fn node_cmd() -> Command {
    let mut cmd = Command::cargo_bin("llmesh-node").unwrap();
    // Keep a developer's own settings out of the results
    cmd.env_remove("LLMESH_CONFIG").env_remove("LLMESH_SIGNALING_URL");
    cmd
}

// ─────────────────────────────────────────────────────────────────
// Help and Version
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_help_flag() {
    node_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("LLMesh Node"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("chat"))
        .stdout(predicate::str::contains("probe"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_version_command() {
    node_cmd()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("llmesh-node"))
        .stdout(predicate::str::contains("Git Hash"))
        .stdout(predicate::str::contains("Target"));
}

#[test]
fn test_short_version_flag() {
    node_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("llmesh-node"));
}

// ─────────────────────────────────────────────────────────────────
// Probe
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_probe_prints_profile() {
    node_cmd()
        .args(["probe", "--budget-ms", "20"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Timeout profile"))
        .stdout(predicate::str::contains("CPUs"));
}

#[test]
fn test_probe_json() {
    let output = node_cmd()
        .args(["probe", "--budget-ms", "20", "--json"])
        .assert()
        .success();

    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let profile = parsed["profile"].as_str().unwrap();
    assert!(["fast", "standard", "constrained"].contains(&profile));
    assert!(parsed["device"]["cpuCount"].as_u64().unwrap() >= 1);
}

// ─────────────────────────────────────────────────────────────────
// Config Commands
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_config_show_default() {
    node_cmd()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[node]"))
        .stdout(predicate::str::contains("[signaling]"))
        .stdout(predicate::str::contains("[peer]"))
        .stdout(predicate::str::contains("[queue]"))
        .stdout(predicate::str::contains("[logging]"));
}

#[test]
fn test_config_validate_default() {
    node_cmd()
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"));
}

#[test]
fn test_config_validate_nonexistent_file() {
    node_cmd()
        .args(["config", "validate", "--config", "/nonexistent/path/node.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found").or(predicate::str::contains("Error")));
}

#[test]
fn test_config_init_help() {
    node_cmd()
        .args(["config", "init", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--path"))
        .stdout(predicate::str::contains("--force"));
}

// ─────────────────────────────────────────────────────────────────
// Run / Chat argument handling
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_run_help_lists_hosting_flags() {
    node_cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--host"))
        .stdout(predicate::str::contains("--no-host"));
}

#[test]
fn test_run_rejects_conflicting_hosting_flags() {
    node_cmd().args(["run", "--host", "--no-host"]).assert().failure();
}

#[test]
fn test_run_with_missing_config_fails() {
    node_cmd()
        .args(["run", "--config", "/nonexistent/node.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E100"));
}

#[test]
fn test_chat_requires_prompt() {
    node_cmd()
        .args(["chat", "--peer", "p", "--model", "m"])
        .assert()
        .failure();
}

#[test]
fn test_unknown_command() {
    node_cmd().arg("unknown-command").assert().failure();
}

#[test]
fn test_missing_subcommand() {
    node_cmd().assert().failure();
}
