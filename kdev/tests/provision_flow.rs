//! End-to-end provisioning with every external effect scripted.

use std::fs;

use kdev::core::types::BuildState;
use kdev::error::ProvisionError;
use kdev::provision::{Provisioner, RunOptions};
use kdev::test_support::{
    FakeArtifactSource, RecordingToolRunner, ScriptedConsole, ScriptedLauncher, TestWorkspace,
};

#[test]
fn first_run_installs_rootfs_builds_kernel_and_writes_scripts() {
    let ws = TestWorkspace::new().expect("workspace");
    let cfg = ws.config();
    let runner = RecordingToolRunner::new();
    let launcher = ScriptedLauncher::new(ScriptedConsole::new());
    let artifacts = FakeArtifactSource;
    let provisioner = Provisioner::new(&ws.paths, &cfg, &runner, &launcher, &artifacts);

    let state = provisioner.run(RunOptions::default()).expect("run");

    assert_eq!(state, BuildState::SrcBuilt);

    let commands = runner.commands();
    assert_eq!(
        commands[0],
        format!("qemu-img create -f qcow2 {} 22G", ws.paths.image_path.display())
    );
    assert!(commands.iter().any(|c| c.starts_with("git init")));
    assert!(commands.last().expect("commands").starts_with("bear --append"));

    let launched = launcher.launched();
    assert_eq!(launched.len(), 1);
    assert_eq!(launched[0].program, "qemu-system-x86_64");
    let iso = ws.paths.iso_path.display().to_string();
    assert!(launched[0].args.windows(2).any(|w| w[0] == "-cdrom" && w[1] == iso));
    assert!(launched[0].args.iter().any(|a| a.contains("OVMF_VARS.fd")));
    assert!(launcher.console().is_closed());

    assert!(ws.paths.image_path.exists());
    assert_eq!(fs::read(&ws.paths.ovmf_vars_path).expect("vars"), b"vars");
    let script = fs::read_to_string(&ws.paths.run_script_path).expect("run script");
    assert!(script.contains("root=/dev/vda2"));
    assert!(ws.paths.debug_script_path.exists());
    assert!(ws.paths.vscode_launch().exists());
}

#[test]
fn second_run_reuses_image_and_finished_kernel() {
    let ws = TestWorkspace::new().expect("workspace");
    let cfg = ws.config();
    let artifacts = FakeArtifactSource;

    let first_runner = RecordingToolRunner::new();
    let first_launcher = ScriptedLauncher::default();
    Provisioner::new(&ws.paths, &cfg, &first_runner, &first_launcher, &artifacts)
        .run(RunOptions::default())
        .expect("first run");

    let runner = RecordingToolRunner::new();
    let launcher = ScriptedLauncher::default();
    let state = Provisioner::new(&ws.paths, &cfg, &runner, &launcher, &artifacts)
        .run(RunOptions::default())
        .expect("second run");

    assert_eq!(state, BuildState::SrcBuilt);
    assert!(runner.commands().is_empty());
    assert!(launcher.launched().is_empty());
}

#[test]
fn rebuild_kernel_reruns_only_the_build() {
    let ws = TestWorkspace::new().expect("workspace");
    let cfg = ws.config();
    let artifacts = FakeArtifactSource;
    let skip_rootfs = RunOptions {
        force_skip_rootfs: true,
        ..RunOptions::default()
    };

    let first = RecordingToolRunner::new();
    let launcher = ScriptedLauncher::default();
    Provisioner::new(&ws.paths, &cfg, &first, &launcher, &artifacts)
        .run(skip_rootfs)
        .expect("first run");
    assert!(launcher.launched().is_empty());

    let runner = RecordingToolRunner::new();
    let opts = RunOptions {
        rebuild_kernel: true,
        ..skip_rootfs
    };
    Provisioner::new(&ws.paths, &cfg, &runner, &launcher, &artifacts)
        .run(opts)
        .expect("rebuild");

    let commands = runner.commands();
    assert_eq!(commands.len(), 1);
    assert!(commands[0].starts_with("bear --append"));
}

#[test]
fn invalid_layout_fails_before_any_side_effect() {
    let ws = TestWorkspace::new().expect("workspace");
    let mut cfg = ws.config();
    cfg.rootfs.partitions.retain(|p| !p.is_root());
    let runner = RecordingToolRunner::new();
    let launcher = ScriptedLauncher::default();
    let artifacts = FakeArtifactSource;

    let err = Provisioner::new(&ws.paths, &cfg, &runner, &launcher, &artifacts)
        .run(RunOptions::default())
        .expect_err("invalid layout");

    assert!(matches!(
        err.downcast_ref::<ProvisionError>(),
        Some(ProvisionError::Config(_))
    ));
    assert!(runner.commands().is_empty());
    assert!(launcher.launched().is_empty());
    assert!(!ws.paths.state_dir.exists());
}

#[test]
fn failed_install_leaves_kernel_untouched() {
    let ws = TestWorkspace::new().expect("workspace");
    let cfg = ws.config();
    let runner = RecordingToolRunner::new();
    let launcher = ScriptedLauncher::new(ScriptedConsole::failing_at("<EOF>"));
    let artifacts = FakeArtifactSource;

    let err = Provisioner::new(&ws.paths, &cfg, &runner, &launcher, &artifacts)
        .run(RunOptions::default())
        .expect_err("shutdown never completes");

    assert!(format!("{err:#}").contains("rootfs installation failed"));
    assert!(!ws.paths.image_path.exists());
    assert!(!runner.commands().iter().any(|c| c.starts_with("git")));
    assert!(!ws.paths.run_script_path.exists());
}
