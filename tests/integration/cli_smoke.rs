use assert_cmd::Command;
use predicates::prelude::*;

use crate::common::{TestConfig, ECHO_CONFIG};

#[test]
fn version_prints() {
    Command::cargo_bin("logviewer")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("logviewer"));
}

#[test]
fn query_log_against_explicit_config() {
    let fixture = TestConfig::new(ECHO_CONFIG);
    Command::cargo_bin("logviewer")
        .unwrap()
        .env("HOME", fixture.dir.path())
        .env_remove("LOGVIEWER_CONFIG")
        .args(["-f"])
        .arg(&fixture.config_path)
        .args(["query", "log", "ctx1", "-n", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hi"));
}

#[test]
fn unknown_context_exits_nonzero() {
    let fixture = TestConfig::new(ECHO_CONFIG);
    Command::cargo_bin("logviewer")
        .unwrap()
        .env("HOME", fixture.dir.path())
        .env_remove("LOGVIEWER_CONFIG")
        .args(["-f"])
        .arg(&fixture.config_path)
        .args(["query", "log", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("CONTEXT_NOT_FOUND"));
}

#[test]
fn context_list_shows_contexts() {
    let fixture = TestConfig::new(ECHO_CONFIG);
    Command::cargo_bin("logviewer")
        .unwrap()
        .env("HOME", fixture.dir.path())
        .env_remove("LOGVIEWER_CONFIG")
        .args(["-f"])
        .arg(&fixture.config_path)
        .args(["context", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ctx1"));
}
