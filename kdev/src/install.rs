//! Unattended Arch Linux installation over the installer VM's serial console.
//!
//! The sequence is one-shot: phases run in a fixed order, and any failed
//! wait aborts the whole installation. There is no mid-sequence resume. The
//! caller recovers by recreating the disk image and starting over.
//!
//! Every step waits for a prompt and then types one line. Prompts are matched
//! with regexes that include the live system's `archiso` host name so
//! ordinary command output is not mistaken for a prompt.

use tracing::{info, instrument};

use crate::core::partition::{PartitionPlan, PlannedPartition, disk_device};
use crate::core::types::BootMode;
use crate::error::Result;
use crate::io::config::{ConsoleConfig, RootfsConfig};
use crate::io::console::{Console, WaitTimeout};

/// Live ISO root shell, e.g. `root@archiso ~ #`.
pub const SHELL_PROMPT: &str = r"root.*@archiso.*~.*#";
/// Shell inside `arch-chroot /mnt`: `[root@archiso /]#`.
pub const CHROOT_PROMPT: &str = r"\[root@archiso /\]#";
const FDISK_PROMPT: &str = r"Command \(m for help\):";
/// Printed by `grub-install` only when it succeeded.
pub const GRUB_INSTALLED: &str = r"Installation finished\. No error reported\.";
/// GPT type alias fdisk uses for a BIOS boot partition.
const BIOS_BOOT_TYPE: &str = "4";
const SERIAL_CONSOLE_ARG: &str = "console=ttyS0,38400";

/// Guest-side settings for one installation.
#[derive(Debug, Clone)]
pub struct InstallSettings {
    pub root_passwd: String,
    pub hostname: String,
    pub timezone: String,
    pub locales: Vec<String>,
    pub lang: String,
    pub mirror: Option<String>,
    pub packages: Vec<String>,
    /// Bound for ordinary prompt waits.
    pub prompt_timeout: WaitTimeout,
    /// Bound for boot and power-off.
    pub boot_timeout: WaitTimeout,
}

impl InstallSettings {
    pub fn from_config(rootfs: &RootfsConfig, console: &ConsoleConfig) -> Self {
        Self {
            root_passwd: rootfs.root_passwd.clone(),
            hostname: rootfs.hostname.clone(),
            timezone: rootfs.timezone.clone(),
            locales: rootfs.locales.clone(),
            lang: rootfs.lang.clone(),
            mirror: rootfs.mirror.clone(),
            packages: rootfs.packages.clone(),
            prompt_timeout: WaitTimeout::secs(console.default_timeout_secs),
            boot_timeout: WaitTimeout::secs(console.boot_timeout_secs),
        }
    }
}

/// Drives a [`Console`] through the installation phases.
pub struct Installer<'a, C: Console + ?Sized> {
    console: &'a mut C,
    plan: &'a PartitionPlan,
    settings: &'a InstallSettings,
}

impl<'a, C: Console + ?Sized> Installer<'a, C> {
    pub fn new(console: &'a mut C, plan: &'a PartitionPlan, settings: &'a InstallSettings) -> Self {
        Self {
            console,
            plan,
            settings,
        }
    }

    /// Run every phase in order, stopping at the first failure.
    #[instrument(skip_all, fields(boot_mode = %self.plan.boot_mode()))]
    pub fn run(&mut self) -> Result<()> {
        self.boot_to_console()?;
        self.pre_install()?;
        self.install_base_system()?;
        self.change_root()?;
        self.configure_system()?;
        self.shutdown()?;
        info!("installation finished");
        Ok(())
    }

    /// Get from the ISO boot menu to a logged-in root shell on the serial
    /// console.
    #[instrument(skip_all)]
    pub fn boot_to_console(&mut self) -> Result<()> {
        let boot = self.settings.boot_timeout;
        match self.plan.boot_mode() {
            BootMode::Bios => {
                self.console.await_pattern("Automatic boot in", boot)?;
                self.console.send("\t")?;
                self.console.run_command(
                    "initrd=/arch/boot/x86_64/initramfs-linux.img",
                    &format!(" {SERIAL_CONSOLE_ARG}"),
                    boot,
                )?;
            }
            BootMode::Uefi => {
                self.console.await_pattern(r"Boot in.*s", boot)?;
                self.console.send("e")?;
                self.console.await_pattern("archisobasedir", boot)?;
                self.console.send(&format!("{SERIAL_CONSOLE_ARG} "))?;
                self.console.send("\n")?;
            }
        }

        self.console.await_pattern(r"Started.*OpenSSH Daemon", boot)?;
        self.console.await_pattern("Arch Linux", boot)?;
        self.console.run_command("login", "root", boot)?;
        self.shell("")?;
        info!("logged in on serial console");
        Ok(())
    }

    /// Diagnostics, then partition, format and mount the target disk.
    #[instrument(skip_all)]
    pub fn pre_install(&mut self) -> Result<()> {
        self.shell("systemctl stop reflector.service")?;
        self.shell("cat /sys/firmware/efi/fw_platform_size")?;
        self.shell("timedatectl")?;

        self.partition_disk()?;
        self.format_partitions()?;
        self.mount_partitions()?;
        Ok(())
    }

    fn partition_disk(&mut self) -> Result<()> {
        let plan = self.plan;
        let disk = disk_device(plan.boot_mode());
        let timeout = self.settings.prompt_timeout;
        info!(disk, partitions = plan.partitions().len(), "partitioning");

        self.shell(&format!("fdisk {disk}"))?;
        self.console.run_command(FDISK_PROMPT, "g", timeout)?;
        for entry in plan.partitions() {
            let n = entry.number;
            self.console.run_command(FDISK_PROMPT, "n", timeout)?;
            self.console.run_command(
                &format!(r"Partition number \({n}-\d+, default {n}\):"),
                "",
                timeout,
            )?;
            self.console
                .run_command(r"First sector \(.*, default \d+\):", "", timeout)?;
            self.console.run_command(
                "Last sector",
                &format!("+{}G", entry.spec.size_gb),
                timeout,
            )?;
        }
        if plan.boot_mode() == BootMode::Bios {
            self.add_bios_boot_partition()?;
        }
        self.console.run_command(FDISK_PROMPT, "w", timeout)?;
        Ok(())
    }

    /// GRUB for i386-pc needs somewhere to embed its core image on a GPT
    /// disk. A 1 MiB partition after the declared ones leaves their numbers
    /// unchanged; it lives in the image's headroom.
    fn add_bios_boot_partition(&mut self) -> Result<()> {
        let timeout = self.settings.prompt_timeout;
        let n = self.plan.partitions().len() + 1;
        info!(number = n, "adding BIOS boot partition");

        self.console.run_command(FDISK_PROMPT, "n", timeout)?;
        self.console.run_command(
            &format!(r"Partition number \({n}-\d+, default {n}\):"),
            "",
            timeout,
        )?;
        self.console
            .run_command(r"First sector \(.*, default \d+\):", "", timeout)?;
        self.console.run_command("Last sector", "+1M", timeout)?;

        self.console.run_command(FDISK_PROMPT, "t", timeout)?;
        self.console.run_command(
            &format!(r"Partition number \(.*default {n}\):"),
            "",
            timeout,
        )?;
        self.console
            .run_command("Partition type or alias", BIOS_BOOT_TYPE, timeout)
    }

    fn format_partitions(&mut self) -> Result<()> {
        let plan = self.plan;
        for entry in plan.partitions() {
            let device = plan.device_path(entry);
            self.shell(&format!("{} {device}", entry.spec.format.mkfs_command()))?;
        }
        self.shell(&format!("fdisk -l {}", disk_device(plan.boot_mode())))
    }

    fn mount_partitions(&mut self) -> Result<()> {
        let plan = self.plan;
        for entry in plan.mount_order() {
            let target = mount_target(entry);
            if !entry.spec.is_root() {
                // "/mnt" itself ships with the ISO
                self.shell(&format!("mkdir -p {target}"))?;
            }
            let device = plan.device_path(entry);
            self.shell(&format!("mount {device} {target}"))?;
        }
        Ok(())
    }

    /// Point pacman at the configured mirror and pacstrap the new root.
    #[instrument(skip_all)]
    pub fn install_base_system(&mut self) -> Result<()> {
        let settings = self.settings;
        if let Some(mirror) = &settings.mirror {
            self.shell(&format!(
                "sed -i '1i Server = {mirror}' /etc/pacman.d/mirrorlist"
            ))?;
            self.shell("head -n 2 /etc/pacman.d/mirrorlist")?;
        }

        info!(packages = settings.packages.len(), "running pacstrap");
        self.shell(&format!("pacstrap -K /mnt {}", settings.packages.join(" ")))?;
        // package download time is unpredictable
        self.console
            .run_command(SHELL_PROMPT, "", WaitTimeout::Unbounded)?;

        self.shell("genfstab -U /mnt >> /mnt/etc/fstab")
    }

    #[instrument(skip_all)]
    pub fn change_root(&mut self) -> Result<()> {
        self.shell("arch-chroot /mnt")
    }

    /// Clock, locale, network identity, root password and bootloader.
    #[instrument(skip_all)]
    pub fn configure_system(&mut self) -> Result<()> {
        let settings = self.settings;

        self.chroot(&format!(
            "ln -sf /usr/share/zoneinfo/{} /etc/localtime",
            settings.timezone
        ))?;
        self.chroot("hwclock --systohc")?;

        for locale in &settings.locales {
            self.chroot(&format!("echo {locale} >> /etc/locale.gen"))?;
        }
        self.chroot("locale-gen")?;
        self.chroot(&format!("echo LANG={} > /etc/locale.conf", settings.lang))?;

        let host = &settings.hostname;
        self.chroot(&format!("echo {host} > /etc/hostname"))?;
        self.chroot(&format!(
            "echo -e '127.0.0.1  localhost\\n::1  localhost\\n127.0.1.1   {host}' >> /etc/hosts"
        ))?;

        self.set_root_password()?;
        self.install_bootloader()
    }

    fn set_root_password(&mut self) -> Result<()> {
        let settings = self.settings;
        let timeout = settings.prompt_timeout;
        let passwd = settings.root_passwd.as_str();
        self.chroot("passwd root")?;
        self.console.run_command("New password:", passwd, timeout)?;
        self.console
            .run_command("Retype new password:", passwd, timeout)?;
        self.chroot("")
    }

    fn install_bootloader(&mut self) -> Result<()> {
        let plan = self.plan;
        let timeout = self.settings.prompt_timeout;
        let boot_mode = plan.boot_mode();

        let packages = match boot_mode {
            BootMode::Uefi => "grub efibootmgr",
            BootMode::Bios => "grub",
        };
        self.chroot(&format!("pacman -Sy --noconfirm {packages}"))?;
        self.console
            .run_command(CHROOT_PROMPT, "", WaitTimeout::Unbounded)?;

        let install = match (boot_mode, plan.efi()) {
            (BootMode::Uefi, Some(efi)) => {
                let device = plan.device_path(efi);
                let mount_point = &efi.spec.mount_point;
                info!(device = %device, mount_point = %mount_point, "verifying EFI mount");
                self.chroot(&format!("findmnt -n -o SOURCE {mount_point}"))?;
                self.console
                    .await_pattern(&regex::escape(&device), timeout)?;
                format!(
                    "grub-install --target=x86_64-efi --efi-directory={mount_point} --bootloader-id=GRUB"
                )
            }
            _ => format!("grub-install --target=i386-pc {}", disk_device(boot_mode)),
        };
        self.chroot(&install)?;
        // the chroot prompt returns even when grub-install fails
        self.console.await_pattern(GRUB_INSTALLED, timeout)?;

        self.chroot("grub-mkconfig -o /boot/grub/grub.cfg")
    }

    /// Leave the chroot, unmount and power off; waits for the console to end.
    #[instrument(skip_all)]
    pub fn shutdown(&mut self) -> Result<()> {
        self.chroot("exit")?;
        self.shell("umount -R /mnt")?;
        self.shell("shutdown -h now")?;
        self.console.await_eof(self.settings.boot_timeout)
    }

    fn shell(&mut self, line: &str) -> Result<()> {
        self.console
            .run_command(SHELL_PROMPT, line, self.settings.prompt_timeout)
    }

    fn chroot(&mut self, line: &str) -> Result<()> {
        self.console
            .run_command(CHROOT_PROMPT, line, self.settings.prompt_timeout)
    }
}

/// Where a partition is mounted inside the live system.
pub fn mount_target(entry: &PlannedPartition) -> String {
    if entry.spec.is_root() {
        "/mnt".to_string()
    } else {
        format!("/mnt{}", entry.spec.mount_point)
    }
}
