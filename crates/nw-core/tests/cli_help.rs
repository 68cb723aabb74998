//! CLI surface smoke tests.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_help_lists_core_tunables() {
    let mut cmd = Command::cargo_bin("nodewatch").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--statistics-frequency"))
        .stdout(predicate::str::contains("--error-report-settle-time"))
        .stdout(predicate::str::contains("--administrator-email"))
        .stdout(predicate::str::contains("--plugins"))
        .stdout(predicate::str::contains("--standalone"));
}

#[test]
fn test_version() {
    let mut cmd = Command::cargo_bin("nodewatch").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("nodewatch"));
}

#[test]
fn test_unknown_flag_fails() {
    let mut cmd = Command::cargo_bin("nodewatch").unwrap();
    cmd.arg("--definitely-not-a-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--definitely-not-a-flag"));
}
