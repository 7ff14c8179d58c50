//! QEMU command construction and the installer VM launcher.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::core::partition::disk_interface;
use crate::core::types::{BootMode, ImageFormat};
use crate::error::Result;
use crate::io::config::QemuConfig;
use crate::io::console::{Console, ConsoleSession, TeeSink};
use crate::io::process::ToolInvocation;

pub const QEMU_BINARY: &str = "qemu-system-x86_64";

/// UEFI firmware pair: shared read-only code plus a per-image vars store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UefiFirmware {
    pub code: PathBuf,
    pub vars: PathBuf,
}

/// Everything needed to describe the installer VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub image_path: PathBuf,
    pub image_format: ImageFormat,
    pub iso_path: PathBuf,
    pub boot_mode: BootMode,
    pub kvm: bool,
    pub smp: u32,
    pub memory_gb: u32,
    /// Required when `boot_mode` is UEFI.
    pub firmware: Option<UefiFirmware>,
}

/// Whether to pass KVM flags: the configured choice, else `/dev/kvm` presence.
pub fn kvm_enabled(cfg: &QemuConfig) -> bool {
    cfg.kvm.unwrap_or_else(kvm_available)
}

pub fn kvm_available() -> bool {
    cfg!(target_os = "linux") && Path::new("/dev/kvm").exists()
}

pub fn kvm_args() -> Vec<String> {
    vec![
        "-cpu".to_string(),
        "host".to_string(),
        "-accel".to_string(),
        "kvm".to_string(),
    ]
}

/// `-drive` value for the rootfs image under the given boot mode.
pub fn drive_arg(image_path: &Path, format: ImageFormat, boot_mode: BootMode) -> String {
    format!(
        "file={},format={},if={}",
        image_path.display(),
        format.as_str(),
        disk_interface(boot_mode)
    )
}

/// pflash drives for UEFI firmware. The code image is mapped read-only.
pub fn firmware_args(firmware: &UefiFirmware) -> Vec<String> {
    vec![
        "-drive".to_string(),
        format!(
            "if=pflash,format=raw,readonly=on,file={}",
            firmware.code.display()
        ),
        "-drive".to_string(),
        format!("if=pflash,format=raw,file={}", firmware.vars.display()),
    ]
}

/// Full argument vector for booting the installer ISO against the image.
pub fn installer_args(spec: &VmSpec) -> Vec<String> {
    let mut args = Vec::new();
    if spec.kvm {
        args.extend(kvm_args());
    }
    args.extend([
        "-smp".to_string(),
        spec.smp.to_string(),
        "-m".to_string(),
        format!("{}G", spec.memory_gb),
        "-drive".to_string(),
        drive_arg(&spec.image_path, spec.image_format, spec.boot_mode),
        "-cdrom".to_string(),
        spec.iso_path.display().to_string(),
        "-boot".to_string(),
        "order=d".to_string(),
        "-nographic".to_string(),
    ]);
    if spec.boot_mode == BootMode::Uefi {
        if let Some(firmware) = &spec.firmware {
            args.extend(firmware_args(firmware));
        }
    }
    args
}

pub fn installer_invocation(spec: &VmSpec) -> ToolInvocation {
    ToolInvocation::new(QEMU_BINARY).args(installer_args(spec))
}

/// Starts an interactive console for a VM invocation.
pub trait ConsoleLauncher {
    type Console: Console;

    fn launch(&self, invocation: &ToolInvocation) -> Result<Self::Console>;
}

/// Launches real QEMU, mirroring its console to stdout and a log file.
#[derive(Debug, Clone)]
pub struct QemuLauncher {
    log_path: PathBuf,
}

impl QemuLauncher {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
        }
    }
}

impl ConsoleLauncher for QemuLauncher {
    type Console = ConsoleSession;

    fn launch(&self, invocation: &ToolInvocation) -> Result<ConsoleSession> {
        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = File::create(&self.log_path)?;
        let sink = TeeSink::new(vec![Box::new(io::stdout()), Box::new(log)]);
        info!(command = %invocation, log = %self.log_path.display(), "starting installer VM");
        debug!(args = ?invocation.args, "qemu arguments");
        ConsoleSession::spawn(invocation.to_command(), Box::new(sink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(boot_mode: BootMode, kvm: bool) -> VmSpec {
        VmSpec {
            image_path: PathBuf::from("archlinux.img"),
            image_format: ImageFormat::Qcow2,
            iso_path: PathBuf::from(".state/archlinux-x86_64.iso"),
            boot_mode,
            kvm,
            smp: 2,
            memory_gb: 4,
            firmware: Some(UefiFirmware {
                code: PathBuf::from("/fw/OVMF_CODE.fd"),
                vars: PathBuf::from(".state/OVMF_VARS.fd"),
            }),
        }
    }

    #[test]
    fn uefi_installer_uses_virtio_and_pflash() {
        let args = installer_args(&spec(BootMode::Uefi, true)).join(" ");
        assert_eq!(
            args,
            "-cpu host -accel kvm -smp 2 -m 4G \
             -drive file=archlinux.img,format=qcow2,if=virtio \
             -cdrom .state/archlinux-x86_64.iso -boot order=d -nographic \
             -drive if=pflash,format=raw,readonly=on,file=/fw/OVMF_CODE.fd \
             -drive if=pflash,format=raw,file=.state/OVMF_VARS.fd"
        );
    }

    #[test]
    fn bios_installer_uses_ide_and_no_firmware() {
        let args = installer_args(&spec(BootMode::Bios, false));
        assert!(!args.iter().any(|a| a.contains("pflash")));
        assert!(!args.iter().any(|a| a == "-accel"));
        assert!(args.contains(&"file=archlinux.img,format=qcow2,if=ide".to_string()));
    }

    #[test]
    fn configured_kvm_overrides_detection() {
        let cfg = QemuConfig {
            kvm: Some(false),
            ..QemuConfig::default()
        };
        assert!(!kvm_enabled(&cfg));
    }
}
