//! Binary surface smoke tests

use assert_cmd::Command;
use predicates::prelude::*;

fn safever() -> Command {
    let mut cmd = Command::cargo_bin("safever").unwrap();
    // Keep test runs away from the user's real data directory
    cmd.env("PAI_DIR", std::env::temp_dir().join("safever-cli-tests"));
    cmd
}

#[test]
fn test_help() {
    safever()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Minimum Safe Version"));
}

#[test]
fn test_query_requires_name() {
    safever().arg("query").assert().failure();
}

#[test]
fn test_unknown_product_exits_one_with_error_line() {
    safever()
        .args(["query", "definitely-not-a-product"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::starts_with("Error: Unknown product"));
}

#[test]
fn test_os_component_query_is_offline() {
    // OS components never contact a source, so this works without network
    safever()
        .args(["query", "windows-powershell"])
        .assert()
        .success()
        .stdout(predicate::str::contains("N/A (OS Component)"))
        .stdout(predicate::str::contains("KEEP WINDOWS UPDATED"));
}

#[test]
fn test_eol_query_is_offline() {
    safever()
        .args(["query", "python2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("UNSUPPORTED"))
        .stdout(predicate::str::contains("END OF LIFE"));
}

#[test]
fn test_query_json_format() {
    let output = safever()
        .args(["query", "windows-powershell", "--format", "json"])
        .assert()
        .success();
    let stdout = String::from_utf8_lossy(&output.get_output().stdout).to_string();
    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(value["msv"], "N/A (OS Component)");
    assert_eq!(value["rating"]["rating"], "A2");
}

#[test]
fn test_check_with_inline_list() {
    safever()
        .args(["check", "windows-powershell,python2@2.7.18", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("NON_COMPLIANT"));
}
