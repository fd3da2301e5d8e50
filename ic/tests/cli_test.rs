//! End-to-end tests for the `ic` binary
//!
//! Only commands that never launch a server are exercised here.

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn write_config(root: &Path, instances: &[&str]) -> PathBuf {
    let base = root.join("jboss").join("standalone");
    fs::create_dir_all(base.join("configuration")).unwrap();
    fs::write(base.join("configuration").join("standalone-full.xml"), "<server/>").unwrap();
    fs::create_dir_all(base.join("tmp")).unwrap();

    let mut yaml = format!(
        "paths:\n  jboss: {}\n  instances: {}\n  run: {}\n",
        root.join("jboss").display(),
        root.join("instances").display(),
        root.join("run").display(),
    );
    if instances.is_empty() {
        yaml.push_str("instances: []\n");
    } else {
        yaml.push_str("instances:\n");
    }
    for name in instances {
        yaml.push_str(&format!("- name: {}\n", name));
        fs::create_dir_all(root.join("instances").join(name)).unwrap();
    }

    let path = root.join("instancectl.yml");
    fs::write(&path, yaml).unwrap();
    path
}

fn ic(root: &Path, config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("ic").unwrap();
    cmd.env("XDG_DATA_HOME", root.join("data"))
        .env("NO_COLOR", "1")
        .env_remove("INSTANCECTL_CONFIG")
        .arg("--config")
        .arg(config);
    cmd
}

#[test]
fn test_version_flag() {
    Command::cargo_bin("ic").unwrap().arg("--version").assert().success();
}

#[test]
fn test_list_without_instances() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(temp_dir.path(), &[]);

    ic(temp_dir.path(), &config)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No instances configured"));
}

#[test]
fn test_list_json_reports_stopped_instance() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(temp_dir.path(), &["web1"]);

    ic(temp_dir.path(), &config)
        .args(["list", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"name\": \"web1\""))
        .stdout(predicate::str::contains("\"state\": \"stopped\""));
}

#[test]
fn test_status_of_missing_instance_is_reported_not_crashed() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(temp_dir.path(), &["web1"]);

    ic(temp_dir.path(), &config)
        .args(["status", "ghost"])
        .assert()
        .success()
        .stdout(predicate::str::contains("'ghost' does not exist"));
}

#[test]
fn test_add_then_list_text() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(temp_dir.path(), &[]);

    ic(temp_dir.path(), &config)
        .args(["add", "web1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Provisioned"));

    assert!(
        temp_dir
            .path()
            .join("instances/web1/configuration/standalone-full.xml")
            .is_file()
    );
    assert!(!temp_dir.path().join("instances/web1/tmp").exists());

    ic(temp_dir.path(), &config)
        .args(["list", "-f", "text"])
        .assert()
        .success()
        .stdout(predicate::str::contains("web1: stopped"));
}

#[test]
fn test_corrupt_state_file_fails() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(temp_dir.path(), &["web1"]);
    fs::create_dir_all(temp_dir.path().join("run")).unwrap();
    fs::write(temp_dir.path().join("run/instance-states.yaml"), "instances: 7\n").unwrap();

    ic(temp_dir.path(), &config)
        .args(["status", "web1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Corrupt state file"));
}

#[test]
fn test_unknown_config_key_fails() {
    let temp_dir = TempDir::new().unwrap();
    let config = temp_dir.path().join("instancectl.yml");
    fs::write(&config, "pathz:\n  jboss: /opt/jboss\n").unwrap();

    ic(temp_dir.path(), &config)
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load configuration"));
}
