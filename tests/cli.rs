use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn testdeps() -> Command {
    let mut cmd = Command::cargo_bin("testdeps").unwrap();
    for var in [
        "TESTDEPS_CONFIG",
        "REUSE_ACROSS_RUNS",
        "DEBUG_TESTDEPS",
        "USE_EXTERNAL_ES",
        "USE_EXTERNAL_MONGO",
        "USE_EXTERNAL_PG",
        "ES_URL",
        "MONGO_URL",
        "PG_URL",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn test_validate_prints_effective_settings() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("testdeps.toml");
    std::fs::write(
        &path,
        r#"
[settings]
reuse_across_runs = false

[resources.relational]
image = "postgres:16"
"#,
    )
    .unwrap();

    testdeps()
        .arg("--config")
        .arg(&path)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Reuse across runs: false"))
        .stdout(predicate::str::contains("relational: postgres:16 as testdeps-relational"));
}

#[test]
fn test_validate_applies_environment() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("testdeps.toml");
    std::fs::write(&path, "").unwrap();

    testdeps()
        .env("TESTDEPS_CONFIG", &path)
        .env("USE_EXTERNAL_ES", "true")
        .env("ES_URL", "http://search.internal:9200")
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("search: external http://search.internal:9200"));
}

#[test]
fn test_validate_rejects_bad_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("testdeps.toml");
    std::fs::write(&path, "[settings]\nstartup_timeout_secs = \"soon\"\n").unwrap();

    testdeps()
        .arg("--config")
        .arg(&path)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_unknown_kind_is_rejected() {
    testdeps()
        .args(["status", "redis"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown kind"));
}
