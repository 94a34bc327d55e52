use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::io::Write;

fn echofs_ng() -> assert_cmd::Command {
    cargo_bin_cmd!("echofs-ng").into()
}

#[test]
fn help_works() {
    echofs_ng()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("PMEM-tier staging filesystem daemon"));
}

#[test]
fn missing_config_file_fails_with_message() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("does-not-exist.yaml");

    echofs_ng()
        .arg("--config-file")
        .arg(&config_path)
        .arg("--foreground")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn rejects_config_with_missing_daxfs() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("echofs.yaml");
    let mut f = std::fs::File::create(&config_path).unwrap();
    write!(
        f,
        r#"
global-settings:
  root-dir: {root}
  mount-dir: {root}/mnt
backends:
  - id: nvram0
    type: NVRAM-NVML
    capacity: 1G
"#,
        root = dir.path().display()
    )
    .unwrap();

    echofs_ng()
        .arg("--config-file")
        .arg(&config_path)
        .arg("--foreground")
        .assert()
        .failure()
        .stderr(predicate::str::contains("daxfs is required"));
}

#[test]
fn rejects_config_with_unsupported_backend_type() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("echofs.yaml");
    let mut f = std::fs::File::create(&config_path).unwrap();
    write!(
        f,
        r#"
global-settings:
  root-dir: {root}
  mount-dir: {root}/mnt
backends:
  - id: nvram0
    type: DRAM
    capacity: 1G
    daxfs: /dev/dax0.0
"#,
        root = dir.path().display()
    )
    .unwrap();

    echofs_ng()
        .arg("--config-file")
        .arg(&config_path)
        .arg("--foreground")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unsupported type"));
}
