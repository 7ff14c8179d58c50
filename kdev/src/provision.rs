//! End-to-end provisioning: installer media, rootfs image, kernel, scripts.
//!
//! The partition plan is derived and validated before any side effect, so a
//! bad `[rootfs]` section fails without touching the workspace.

use std::fs;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::partition::PartitionPlan;
use crate::core::types::{BootMode, BuildState};
use crate::install::{InstallSettings, Installer};
use crate::io::artifacts::{ArtifactSource, backup_iso};
use crate::io::config::KdevConfig;
use crate::io::console::Console;
use crate::io::image::{image_size_gb, prepare_firmware_vars, prepare_image};
use crate::io::init::KdevPaths;
use crate::io::process::ToolRunner;
use crate::io::state_store::BuildStateStore;
use crate::io::templates::write_launch_scripts;
use crate::io::vm::{ConsoleLauncher, UefiFirmware, VmSpec, installer_invocation, kvm_enabled};
use crate::kernel::KernelBuild;

/// Flags for `kdev run`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Reinstall the rootfs even when the image exists.
    pub rebuild_rootfs: bool,
    /// Never install the rootfs, even when the image is missing.
    pub force_skip_rootfs: bool,
    /// Roll a finished kernel back one stage and build again.
    pub rebuild_kernel: bool,
}

/// Wires the pipeline to its process, console and download seams.
pub struct Provisioner<'a, R, L, A>
where
    R: ToolRunner,
    L: ConsoleLauncher,
    A: ArtifactSource,
{
    paths: &'a KdevPaths,
    cfg: &'a KdevConfig,
    runner: &'a R,
    launcher: &'a L,
    artifacts: &'a A,
}

impl<'a, R, L, A> Provisioner<'a, R, L, A>
where
    R: ToolRunner,
    L: ConsoleLauncher,
    A: ArtifactSource,
{
    pub fn new(
        paths: &'a KdevPaths,
        cfg: &'a KdevConfig,
        runner: &'a R,
        launcher: &'a L,
        artifacts: &'a A,
    ) -> Self {
        Self {
            paths,
            cfg,
            runner,
            launcher,
            artifacts,
        }
    }

    /// rootfs (when needed), then the kernel, then the launch scripts.
    #[instrument(skip_all, fields(root = %self.paths.root.display()))]
    pub fn run(&self, opts: RunOptions) -> Result<BuildState> {
        let plan = self.cfg.partition_plan()?;

        if self.should_build_rootfs(opts) {
            self.build_rootfs(&plan)?;
        } else {
            info!(image = %self.paths.image_path.display(), "skipping rootfs");
        }

        let state = self.build_kernel(opts.rebuild_kernel)?;
        self.generate_scripts(&plan)?;
        info!(state = %state, "provisioning finished");
        Ok(state)
    }

    pub fn should_build_rootfs(&self, opts: RunOptions) -> bool {
        if opts.rebuild_rootfs {
            return true;
        }
        !opts.force_skip_rootfs && !self.paths.image_path.exists()
    }

    /// Fetch the ISO, create a blank image and run the unattended install.
    ///
    /// Any failure after the image is created removes it, so the next run
    /// starts over instead of treating a blank or half-installed disk as done.
    #[instrument(skip_all, fields(boot_mode = %plan.boot_mode()))]
    pub fn build_rootfs(&self, plan: &PartitionPlan) -> Result<()> {
        let rootfs = &self.cfg.rootfs;
        let paths = self.paths;

        fs::create_dir_all(&paths.state_dir)
            .with_context(|| format!("create directory {}", paths.state_dir.display()))?;
        self.artifacts
            .ensure_iso(&paths.iso_path)
            .context("acquire installer ISO")?;
        let boot_iso = if rootfs.backup_iso {
            backup_iso(&paths.iso_path, &paths.iso_backup_path).context("back up installer ISO")?;
            &paths.iso_backup_path
        } else {
            &paths.iso_path
        };

        prepare_image(
            self.runner,
            &paths.image_path,
            rootfs.image_format,
            image_size_gb(plan),
        )?;

        if let Err(err) = self.install_onto_image(plan, boot_iso) {
            discard_image(&paths.image_path);
            return Err(err).context("rootfs installation failed");
        }
        info!(image = %paths.image_path.display(), "rootfs ready");
        Ok(())
    }

    /// Boot the installer against the freshly created image and install.
    /// The console is closed whether or not the installation succeeded.
    fn install_onto_image(&self, plan: &PartitionPlan, boot_iso: &Path) -> Result<()> {
        let rootfs = &self.cfg.rootfs;
        let paths = self.paths;

        let firmware = match plan.boot_mode() {
            BootMode::Uefi => {
                prepare_firmware_vars(&self.cfg.qemu.ovmf_vars, &paths.ovmf_vars_path)?;
                Some(UefiFirmware {
                    code: self.cfg.qemu.ovmf_code.clone(),
                    vars: paths.ovmf_vars_path.clone(),
                })
            }
            BootMode::Bios => None,
        };
        let spec = VmSpec {
            image_path: paths.image_path.clone(),
            image_format: rootfs.image_format,
            iso_path: boot_iso.to_path_buf(),
            boot_mode: plan.boot_mode(),
            kvm: kvm_enabled(&self.cfg.qemu),
            smp: self.cfg.qemu.install_smp,
            memory_gb: self.cfg.qemu.install_memory_gb,
            firmware,
        };

        let settings = InstallSettings::from_config(rootfs, &self.cfg.console);
        let mut console = self
            .launcher
            .launch(&installer_invocation(&spec))
            .context("start installer VM")?;
        let installed = Installer::new(&mut console, plan, &settings).run();
        match console.close() {
            Ok(code) => info!(exit_code = ?code, "installer VM exited"),
            Err(err) => warn!(err = %err, "failed to close installer console"),
        }
        installed?;
        Ok(())
    }

    /// Resume the kernel pipeline from its checkpoint.
    pub fn build_kernel(&self, rebuild: bool) -> Result<BuildState> {
        let store = BuildStateStore::new(&self.paths.build_state_path);
        let kernel = KernelBuild::new(self.runner, &store, self.paths, &self.cfg.kernel);
        let state = if rebuild {
            kernel.rebuild()
        } else {
            kernel.dispatch()
        };
        state.context("kernel build failed")
    }

    pub fn generate_scripts(&self, plan: &PartitionPlan) -> Result<()> {
        write_launch_scripts(self.cfg, self.paths, plan, kvm_enabled(&self.cfg.qemu))
    }
}

fn discard_image(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => info!(path = %path.display(), "removed incomplete image"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(err = %err, path = %path.display(), "failed to remove incomplete image"),
    }
}

/// Remove the state directory and the rootfs image. Sources and the build
/// tree are left alone.
#[instrument(skip_all, fields(root = %paths.root.display()))]
pub fn distclean(paths: &KdevPaths) -> Result<()> {
    match fs::remove_dir_all(&paths.state_dir) {
        Ok(()) => info!(path = %paths.state_dir.display(), "removed"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("remove {}", paths.state_dir.display()));
        }
    }
    match fs::remove_file(&paths.image_path) {
        Ok(()) => info!(path = %paths.image_path.display(), "removed"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("remove {}", paths.image_path.display()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        FakeArtifactSource, RecordingToolRunner, ScriptedConsole, ScriptedLauncher, TestWorkspace,
    };

    #[test]
    fn rootfs_is_built_only_when_needed() {
        let ws = TestWorkspace::new().expect("workspace");
        let cfg = ws.config();
        let runner = RecordingToolRunner::new();
        let launcher = ScriptedLauncher::default();
        let artifacts = FakeArtifactSource;
        let p = Provisioner::new(&ws.paths, &cfg, &runner, &launcher, &artifacts);

        assert!(p.should_build_rootfs(RunOptions::default()));
        let skip = RunOptions {
            force_skip_rootfs: true,
            ..RunOptions::default()
        };
        assert!(!p.should_build_rootfs(skip));

        fs::write(&ws.paths.image_path, b"img").expect("write");
        assert!(!p.should_build_rootfs(RunOptions::default()));
        let rebuild = RunOptions {
            rebuild_rootfs: true,
            ..RunOptions::default()
        };
        assert!(p.should_build_rootfs(rebuild));
    }

    #[test]
    fn failed_install_removes_image_and_closes_console() {
        let ws = TestWorkspace::new().expect("workspace");
        let cfg = ws.config();
        let runner = RecordingToolRunner::new();
        let launcher = ScriptedLauncher::new(ScriptedConsole::failing_at("Arch Linux"));
        let artifacts = FakeArtifactSource;
        let p = Provisioner::new(&ws.paths, &cfg, &runner, &launcher, &artifacts);
        let plan = cfg.partition_plan().expect("plan");

        let err = p.build_rootfs(&plan).expect_err("install should fail");

        assert!(format!("{err:#}").contains("rootfs installation failed"));
        assert!(launcher.console().is_closed());
        assert!(runner.commands()[0].starts_with("qemu-img create"));
        assert!(!ws.paths.image_path.exists());
    }

    #[test]
    fn missing_firmware_vars_removes_image() {
        let ws = TestWorkspace::new().expect("workspace");
        let mut cfg = ws.config();
        cfg.qemu.ovmf_vars = ws.paths.root.join("missing").join("OVMF_VARS.fd");
        let runner = RecordingToolRunner::new();
        let launcher = ScriptedLauncher::default();
        let artifacts = FakeArtifactSource;
        let p = Provisioner::new(&ws.paths, &cfg, &runner, &launcher, &artifacts);
        let plan = cfg.partition_plan().expect("plan");

        p.build_rootfs(&plan).expect_err("vars copy should fail");

        assert!(launcher.launched().is_empty());
        assert!(!ws.paths.image_path.exists());
        assert!(p.should_build_rootfs(RunOptions::default()));
    }

    #[test]
    fn launch_failure_removes_image() {
        let ws = TestWorkspace::new().expect("workspace");
        let cfg = ws.config();
        let runner = RecordingToolRunner::new();
        let launcher = ScriptedLauncher::failing_to_launch();
        let artifacts = FakeArtifactSource;
        let p = Provisioner::new(&ws.paths, &cfg, &runner, &launcher, &artifacts);
        let plan = cfg.partition_plan().expect("plan");

        let err = p.build_rootfs(&plan).expect_err("launch should fail");

        assert!(format!("{err:#}").contains("start installer VM"));
        assert_eq!(launcher.launched().len(), 1);
        assert!(!ws.paths.image_path.exists());
        assert!(p.should_build_rootfs(RunOptions::default()));
    }

    #[test]
    fn backup_iso_is_the_boot_medium() {
        let ws = TestWorkspace::new().expect("workspace");
        let mut cfg = ws.config();
        cfg.rootfs.backup_iso = true;
        let runner = RecordingToolRunner::new();
        let launcher = ScriptedLauncher::default();
        let artifacts = FakeArtifactSource;
        let p = Provisioner::new(&ws.paths, &cfg, &runner, &launcher, &artifacts);
        let plan = cfg.partition_plan().expect("plan");

        p.build_rootfs(&plan).expect("rootfs");

        assert_eq!(fs::read(&ws.paths.iso_backup_path).expect("backup"), b"iso");
        let backup = ws.paths.iso_backup_path.display().to_string();
        assert!(launcher.launched()[0].args.contains(&backup));
    }

    #[test]
    fn distclean_removes_state_and_image() {
        let ws = TestWorkspace::new().expect("workspace");
        fs::create_dir_all(&ws.paths.state_dir).expect("mkdir");
        fs::write(&ws.paths.build_state_path, b"{}").expect("write");
        fs::write(&ws.paths.image_path, b"img").expect("write");

        distclean(&ws.paths).expect("distclean");
        distclean(&ws.paths).expect("second distclean");

        assert!(!ws.paths.state_dir.exists());
        assert!(!ws.paths.image_path.exists());
    }
}
