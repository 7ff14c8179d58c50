//! Workspace layout and `kdev init` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

use super::config::{KdevConfig, write_config};

/// All canonical paths of a kdev workspace rooted at `root`.
#[derive(Debug, Clone)]
pub struct KdevPaths {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub state_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub iso_path: PathBuf,
    pub iso_backup_path: PathBuf,
    pub qemu_log_path: PathBuf,
    pub build_state_path: PathBuf,
    pub ovmf_vars_path: PathBuf,
    pub image_path: PathBuf,
    pub src_dir: PathBuf,
    pub build_dir: PathBuf,
    pub run_script_path: PathBuf,
    pub debug_script_path: PathBuf,
}

impl KdevPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".state");
        let src_dir = root.join("linux");
        Self {
            root: root.clone(),
            config_path: root.join("kdev.toml"),
            state_dir: state_dir.clone(),
            gitignore_path: state_dir.join(".gitignore"),
            iso_path: state_dir.join("archlinux-x86_64.iso"),
            iso_backup_path: state_dir.join("archlinux-x86_64.iso.bak"),
            qemu_log_path: state_dir.join("qemu.log"),
            build_state_path: state_dir.join("kernel_state.json"),
            ovmf_vars_path: state_dir.join("OVMF_VARS.fd"),
            image_path: root.join("archlinux.img"),
            src_dir: src_dir.clone(),
            build_dir: root.join("linux-build"),
            run_script_path: root.join("run-qemu.sh"),
            debug_script_path: root.join("run-qemu-debug.sh"),
        }
    }

    /// Same layout, but with the config file taken from an explicit location.
    pub fn with_config(mut self, config_path: impl Into<PathBuf>) -> Self {
        self.config_path = config_path.into();
        self
    }

    /// Kconfig editing helper shipped inside the kernel tree.
    pub fn config_script(&self) -> PathBuf {
        self.src_dir.join("scripts").join("config")
    }

    /// Generated `.config` inside the out-of-tree build directory.
    pub fn kernel_config(&self) -> PathBuf {
        self.build_dir.join(".config")
    }

    pub fn bzimage(&self) -> PathBuf {
        self.build_dir
            .join("arch")
            .join("x86_64")
            .join("boot")
            .join("bzImage")
    }

    pub fn vmlinux(&self) -> PathBuf {
        self.build_dir.join("vmlinux")
    }

    pub fn compile_commands(&self) -> PathBuf {
        self.src_dir.join("compile_commands.json")
    }

    /// `rust-project.json` as emitted by `make rust-analyzer`.
    pub fn built_rust_project(&self) -> PathBuf {
        self.build_dir.join("rust-project.json")
    }

    /// `rust-project.json` where rust-analyzer looks for it.
    pub fn rust_project(&self) -> PathBuf {
        self.src_dir.join("rust-project.json")
    }

    pub fn vscode_launch(&self) -> PathBuf {
        self.src_dir.join(".vscode").join("launch.json")
    }
}

/// Options for `init_workspace`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing `kdev.toml`.
    pub force: bool,
}

/// Write a default `kdev.toml` and create `.state/` under `root`.
///
/// Fails if the config already exists unless `options.force` is set.
pub fn init_workspace(paths: &KdevPaths, options: &InitOptions) -> Result<()> {
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "kdev init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!("kdev init: .state exists but is not a directory"));
    }

    create_dir(&paths.state_dir)?;
    write_file(&paths.gitignore_path, STATE_GITIGNORE)?;
    write_config(&paths.config_path, &KdevConfig::default())?;
    info!(config = %paths.config_path.display(), "workspace initialized");
    Ok(())
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const STATE_GITIGNORE: &str = "*\n";
