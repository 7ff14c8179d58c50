//! CLI tests for the read-only `kdev` commands.
//!
//! Spawns the kdev binary and verifies output and exit codes.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use kdev::exit_codes;

fn kdev(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_kdev"))
        .arg("--root")
        .arg(root)
        .args(args)
        .output()
        .expect("kdev")
}

#[test]
fn plan_prints_default_layout() {
    let temp = tempfile::tempdir().expect("tempdir");

    let out = kdev(temp.path(), &["plan"]);

    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("boot mode: UEFI"));
    assert!(stdout.contains("/dev/vda1"));
    assert!(stdout.contains("/dev/vda2"));
    assert!(stdout.contains("mount order: / /boot/efi"));
}

#[test]
fn plan_without_root_partition_exits_with_invalid_config() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(
        temp.path().join("kdev.toml"),
        "[rootfs]\n\
         boot_mode = \"UEFI\"\n\
         partitions = [{ format = \"fat\", size_gb = 1, mount_point = \"/boot/efi\" }]\n",
    )
    .expect("write config");

    let out = kdev(temp.path(), &["plan"]);

    assert_eq!(out.status.code(), Some(exit_codes::INVALID_CONFIG));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("no partition is mounted at"));
}

#[test]
fn malformed_config_exits_with_invalid_config() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("kdev.toml"), "[rootfs\n").expect("write config");

    let out = kdev(temp.path(), &["plan"]);

    assert_eq!(out.status.code(), Some(exit_codes::INVALID_CONFIG));
}

#[test]
fn init_then_plan_uses_written_config() {
    let temp = tempfile::tempdir().expect("tempdir");

    let init = kdev(temp.path(), &["init"]);
    assert_eq!(init.status.code(), Some(exit_codes::OK));
    assert!(temp.path().join("kdev.toml").is_file());
    assert!(temp.path().join(".state").is_dir());

    let again = kdev(temp.path(), &["init"]);
    assert_eq!(again.status.code(), Some(exit_codes::FAILED));

    let plan = kdev(temp.path(), &["plan"]);
    assert_eq!(plan.status.code(), Some(exit_codes::OK));
}

#[test]
fn state_reports_and_resets_checkpoint() {
    let temp = tempfile::tempdir().expect("tempdir");

    let fresh = kdev(temp.path(), &["state"]);
    assert_eq!(String::from_utf8_lossy(&fresh.stdout).trim(), "NOT_INIT");

    let state_dir = temp.path().join(".state");
    fs::create_dir_all(&state_dir).expect("mkdir");
    fs::write(
        state_dir.join("kernel_state.json"),
        "{\n  \"state\": \"SRC_CONFIGURED\"\n}\n",
    )
    .expect("write state");

    let stored = kdev(temp.path(), &["state"]);
    assert_eq!(String::from_utf8_lossy(&stored.stdout).trim(), "SRC_CONFIGURED");

    let reset = kdev(temp.path(), &["state", "--reset"]);
    assert_eq!(reset.status.code(), Some(exit_codes::OK));
    assert_eq!(String::from_utf8_lossy(&reset.stdout).trim(), "NOT_INIT");
}
