//! Workspace configuration stored in `kdev.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::overlay::{KconfigOverlay, default_overlays};
use crate::core::partition::{self, PartitionPlan, PartitionSpec};
use crate::core::types::{BootMode, ImageFormat, PartitionFormat};
use crate::error::ProvisionError;

/// kdev configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to a
/// UEFI Arch Linux guest with a 1 GB EFI partition and a 20 GB root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct KdevConfig {
    pub rootfs: RootfsConfig,
    pub qemu: QemuConfig,
    pub iso: IsoConfig,
    pub kernel: KernelConfig,
    pub console: ConsoleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RootfsConfig {
    pub boot_mode: BootMode,
    pub image_format: ImageFormat,
    pub root_passwd: String,
    pub hostname: String,
    /// Zone name under `/usr/share/zoneinfo`.
    pub timezone: String,
    /// Entries appended to `/etc/locale.gen`.
    pub locales: Vec<String>,
    pub lang: String,
    /// Pacman mirror prepended to the live system's mirrorlist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror: Option<String>,
    /// Packages handed to `pacstrap`.
    pub packages: Vec<String>,
    /// Boot the installer from a copy of the ISO taken before each build.
    pub backup_iso: bool,
    pub partitions: Vec<PartitionSpec>,
}

impl Default for RootfsConfig {
    fn default() -> Self {
        Self {
            boot_mode: BootMode::Uefi,
            image_format: ImageFormat::Qcow2,
            root_passwd: "root".to_string(),
            hostname: "arch-qemu".to_string(),
            timezone: "UTC".to_string(),
            locales: vec!["en_US.UTF-8 UTF-8".to_string()],
            lang: "en_US.UTF-8".to_string(),
            mirror: None,
            packages: [
                "base",
                "base-devel",
                "linux",
                "linux-headers",
                "linux-firmware",
                "dhcpcd",
                "iwd",
                "vim",
                "bash-completion",
                // provides `resize` for the serial console
                "xterm",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            backup_iso: false,
            partitions: vec![
                PartitionSpec::new(PartitionFormat::Fat, 1, "/boot/efi"),
                PartitionSpec::new(PartitionFormat::Ext4, 20, "/"),
            ],
        }
    }
}

/// One `hostfwd` rule for the generated launch scripts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortForward {
    pub host: u16,
    pub guest: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QemuConfig {
    /// Force KVM on or off. Unset means "use it when `/dev/kvm` exists".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kvm: Option<bool>,
    /// vCPUs for the installer VM.
    pub install_smp: u32,
    pub install_memory_gb: u32,
    /// vCPUs for the generated launch scripts.
    pub run_smp: u32,
    pub run_memory_gb: u32,
    /// Read-only UEFI firmware code.
    pub ovmf_code: PathBuf,
    /// UEFI variable store template, copied per image.
    pub ovmf_vars: PathBuf,
    pub port_forwards: Vec<PortForward>,
}

impl Default for QemuConfig {
    fn default() -> Self {
        let mut port_forwards = vec![PortForward {
            host: 2222,
            guest: 22,
        }];
        port_forwards.extend((0..5).map(|i| PortForward {
            host: 18000 + i,
            guest: 8000 + i,
        }));
        Self {
            kvm: None,
            install_smp: 2,
            install_memory_gb: 4,
            run_smp: 1,
            run_memory_gb: 4,
            ovmf_code: PathBuf::from("/usr/share/edk2/x64/OVMF_CODE.4m.fd"),
            ovmf_vars: PathBuf::from("/usr/share/edk2/x64/OVMF_VARS.4m.fd"),
            port_forwards,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IsoConfig {
    pub url: String,
    /// Published `sha256sums.txt` listing the ISO.
    pub sha256_url: String,
}

impl Default for IsoConfig {
    fn default() -> Self {
        Self {
            url: "https://geo.mirror.pkgbuild.com/iso/latest/archlinux-x86_64.iso".to_string(),
            sha256_url: "https://geo.mirror.pkgbuild.com/iso/latest/sha256sums.txt".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KernelConfig {
    pub repo: String,
    /// Release fetched as tag `v<version>`.
    pub version: String,
    /// Build Rust-for-Linux support and emit `rust-project.json`.
    pub rust: bool,
    /// Override `make -j`. Unset means available CPUs minus one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<usize>,
    /// Extra environment for the build stage. Defaults to
    /// `KBUILD_CFLAGS=-fno-inline`.
    pub build_env: BTreeMap<String, String>,
    pub overlays: Vec<KconfigOverlay>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            repo: "https://git.kernel.org/pub/scm/linux/kernel/git/stable/linux.git".to_string(),
            version: "6.10".to_string(),
            rust: false,
            jobs: None,
            build_env: BTreeMap::from([(
                "KBUILD_CFLAGS".to_string(),
                "-fno-inline".to_string(),
            )]),
            overlays: default_overlays(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Bound for ordinary prompt waits.
    pub default_timeout_secs: u64,
    /// Bound for the live system to come up after the boot menu.
    pub boot_timeout_secs: u64,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30,
            boot_timeout_secs: 300,
        }
    }
}

impl KdevConfig {
    /// Check invariants that must hold before any side effect.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        let invalid = |msg: &str| Err(ProvisionError::Config(msg.to_string()));

        if self.rootfs.root_passwd.is_empty() {
            return invalid("rootfs.root_passwd must not be empty");
        }
        if self.rootfs.hostname.trim().is_empty() {
            return invalid("rootfs.hostname must not be empty");
        }
        if self.rootfs.packages.is_empty() {
            return invalid("rootfs.packages must list at least one package");
        }
        if self.qemu.install_smp == 0 || self.qemu.run_smp == 0 {
            return invalid("qemu smp values must be > 0");
        }
        if self.qemu.install_memory_gb == 0 || self.qemu.run_memory_gb == 0 {
            return invalid("qemu memory values must be > 0");
        }
        if self.kernel.version.trim().is_empty() {
            return invalid("kernel.version must not be empty");
        }
        if self.kernel.repo.trim().is_empty() {
            return invalid("kernel.repo must not be empty");
        }
        if self.kernel.jobs == Some(0) {
            return invalid("kernel.jobs must be > 0");
        }
        if self.console.default_timeout_secs == 0 || self.console.boot_timeout_secs == 0 {
            return invalid("console timeouts must be > 0");
        }
        self.partition_plan()?;
        Ok(())
    }

    /// Validated partition plan for the configured boot mode.
    pub fn partition_plan(&self) -> Result<PartitionPlan, ProvisionError> {
        partition::parse(&self.rootfs.partitions, self.rootfs.boot_mode)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `KdevConfig::default()`.
pub fn load_config(path: &Path) -> Result<KdevConfig> {
    if !path.exists() {
        let cfg = KdevConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: KdevConfig = toml::from_str(&contents)
        .map_err(|e| ProvisionError::Config(format!("parse {}: {e}", path.display())))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &KdevConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::overlay::OverlayValue;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, KdevConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("kdev.toml");
        let mut cfg = KdevConfig::default();
        cfg.qemu.kvm = Some(false);
        cfg.kernel.jobs = Some(4);
        cfg.rootfs.mirror = Some("https://mirror.example/$repo/os/$arch".to_string());
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("kdev.toml");
        fs::write(
            &path,
            r#"
[rootfs]
boot_mode = "BIOS"
partitions = [{ format = "ext4", size_gb = 8, mount_point = "/" }]

[kernel]
version = "6.12"
overlays = [{ key = "CONFIG_LOCALVERSION", kind = "string", value = "-dev" }]
"#,
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.rootfs.boot_mode, BootMode::Bios);
        assert_eq!(cfg.rootfs.hostname, "arch-qemu");
        assert_eq!(cfg.kernel.version, "6.12");
        assert_eq!(
            cfg.kernel.overlays[0].value,
            OverlayValue::Str {
                value: "-dev".to_string()
            }
        );
        assert_eq!(cfg.qemu, QemuConfig::default());
    }

    #[test]
    fn invalid_partition_layout_is_a_config_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("kdev.toml");
        fs::write(
            &path,
            r#"
[rootfs]
partitions = [{ format = "ext4", size_gb = 8, mount_point = "/" }]
"#,
        )
        .expect("write");

        let err = load_config(&path).expect_err("UEFI without fat");
        let typed = err.downcast_ref::<ProvisionError>().expect("typed error");
        assert!(matches!(typed, ProvisionError::Config(_)));
    }

    #[test]
    fn kernel_build_disables_inlining_by_default() {
        let kernel = KernelConfig::default();
        assert_eq!(
            kernel.build_env.get("KBUILD_CFLAGS").map(String::as_str),
            Some("-fno-inline")
        );
    }

    #[test]
    fn zero_smp_is_rejected() {
        let mut cfg = KdevConfig::default();
        cfg.qemu.install_smp = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_port_forwards_cover_ssh_and_dev_ports() {
        let forwards = QemuConfig::default().port_forwards;
        assert_eq!(forwards[0], PortForward { host: 2222, guest: 22 });
        assert_eq!(forwards.len(), 6);
        assert_eq!(forwards[5], PortForward { host: 18004, guest: 8004 });
    }
}
