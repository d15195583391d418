//! Smoke tests -- verify the binary runs and the subcommands work end to end.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::json;

fn flakeradar() -> Command {
    let mut cmd = Command::cargo_bin("flakeradar").unwrap();
    cmd.env_remove("FLAKERADAR_CONFIG")
        .env_remove("FLAKERADAR_DB_PATH")
        .env_remove("OPENAI_API_KEY")
        .env("RUST_LOG", "warn");
    cmd
}

/// 20 executions of `checkout`, failing on every other run for the first 16.
fn write_flaky_batch(path: &Path) {
    let executions: Vec<_> = (0..20)
        .map(|i| {
            let failed = i % 2 == 1 && i < 16;
            json!({
                "full_name": "com.shop.CheckoutTest.testPay",
                "project": "shop",
                "status": if failed { "FAIL" } else { "PASS" },
                "timestamp": 1_700_000_000 + i * 600,
                "run_id": format!("build-{}", i),
                "failure_signature": if failed {
                    Some("java.sql.SQLTimeoutException: connection pool exhausted")
                } else {
                    None
                },
            })
        })
        .collect();
    std::fs::write(path, serde_json::to_string(&executions).unwrap()).unwrap();
}

#[test]
fn test_cli_help() {
    flakeradar()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Flaky test classification"));
}

#[test]
fn test_cli_version() {
    flakeradar()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("flakeradar"));
}

#[test]
fn test_subcommands_exist() {
    for sub in ["analyze", "offenders", "summary"] {
        flakeradar().args([sub, "--help"]).assert().success();
    }
}

#[test]
fn test_analyze_then_report() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("executions.json");
    let db = dir.path().join("history.db");
    write_flaky_batch(&input);

    flakeradar()
        .arg("analyze")
        .arg("--input")
        .arg(&input)
        .arg("--db")
        .arg(&db)
        .arg("--json")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"persisted\": true"))
        .stdout(predicate::str::contains("TRULY_FLAKY"))
        .stdout(predicate::str::contains("database_connectivity"));

    flakeradar()
        .args(["offenders", "--project", "shop", "--db"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("CheckoutTest.testPay"))
        .stdout(predicate::str::contains("OPEN"));

    flakeradar()
        .args(["summary", "--project", "shop", "--db"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("Open episodes:    1"))
        .stdout(predicate::str::contains("Recorded runs:    20"));
}

#[test]
fn test_analyze_table_output() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("executions.json");
    write_flaky_batch(&input);

    flakeradar()
        .arg("analyze")
        .arg("--input")
        .arg(&input)
        .arg("--db")
        .arg(dir.path().join("history.db"))
        .assert()
        .success()
        .stdout(predicate::str::contains("Flaky: 1"))
        .stdout(predicate::str::contains("Failure clusters:"));
}

#[test]
fn test_project_filter_can_empty_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("executions.json");
    write_flaky_batch(&input);

    flakeradar()
        .arg("analyze")
        .arg("--input")
        .arg(&input)
        .args(["--project", "other", "--json", "--db"])
        .arg(dir.path().join("history.db"))
        .assert()
        .success()
        .stdout(predicate::str::contains("\"tests\": []"));
}

#[test]
fn test_invalid_threshold_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("executions.json");
    write_flaky_batch(&input);

    flakeradar()
        .arg("analyze")
        .arg("--input")
        .arg(&input)
        .args(["--threshold", "1.5", "--db"])
        .arg(dir.path().join("history.db"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid configuration"));
}

#[test]
fn test_missing_input_fails() {
    let dir = tempfile::tempdir().unwrap();
    flakeradar()
        .args(["analyze", "--input"])
        .arg(dir.path().join("nope.json"))
        .arg("--db")
        .arg(dir.path().join("history.db"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read"));
}
