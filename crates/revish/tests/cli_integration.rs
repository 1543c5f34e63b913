//! CLI integration tests
//!
//! Tests the revish binary using assert_cmd.

use assert_cmd::Command;
use predicates::prelude::*;

fn revish() -> Command {
    Command::cargo_bin("revish")
        .expect("Failed to locate revish binary - ensure it's built before running tests")
}

const DIRECTORY: &str = r#"[
  {
    "listening_address": "127.0.0.1:40000",
    "display_name": "alice@alicebox",
    "proxy_user": "ops"
  }
]"#;

#[test]
fn test_cli_help() {
    revish()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("revish"))
        .stdout(predicate::str::contains("Reverse shell tunnels over SSH"));
}

#[test]
fn test_cli_version() {
    revish()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("revish"));
}

#[test]
fn test_cli_server_help() {
    revish()
        .args(["server", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--no-shell"));
}

#[test]
fn test_cli_client_help() {
    revish()
        .args(["client", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--remote-port"));
}

#[test]
fn test_cli_requires_subcommand() {
    revish().assert().failure();
}

#[test]
fn test_cli_list_renders_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("directory.json");
    std::fs::write(&path, DIRECTORY).unwrap();

    revish()
        .args(["list", "--directory"])
        .arg(&path)
        .args(["-J", "home.example.com"])
        .assert()
        .success()
        .stdout(predicate::str::contains("alice@alicebox"))
        .stdout(predicate::str::contains(
            "ssh -J home.example.com -p 40000 ops@127.0.0.1",
        ));
}

#[test]
fn test_cli_list_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("directory.json");
    std::fs::write(&path, DIRECTORY).unwrap();

    revish()
        .args(["list", "--json", "--directory"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"listening_address\": \"127.0.0.1:40000\""));
}

#[test]
fn test_cli_list_empty_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("directory.json");
    std::fs::write(&path, "[]").unwrap();

    revish()
        .args(["list", "--directory"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("No reachable sessions"));
}

#[cfg(target_os = "linux")]
#[test]
fn test_cli_list_reads_default_server_directory() {
    let config_home = tempfile::tempdir().unwrap();
    let published = config_home.path().join("revish").join("directory.json");
    std::fs::create_dir_all(published.parent().unwrap()).unwrap();
    std::fs::write(&published, DIRECTORY).unwrap();

    revish()
        .env("XDG_CONFIG_HOME", config_home.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("alice@alicebox"));
}

#[test]
fn test_cli_list_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();

    revish()
        .args(["list", "--directory"])
        .arg(dir.path().join("absent.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read directory"));
}

#[test]
fn test_cli_server_without_password_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("server.toml");
    std::fs::write(
        &config,
        format!(
            "listen = \"127.0.0.1\"\nport = 0\nhost_key_path = {:?}\n",
            dir.path().join("host_key")
        ),
    )
    .unwrap();

    revish()
        .env_remove("REVISH_SERVICE_PASSWORD")
        .args(["server", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("service_password"));
}
