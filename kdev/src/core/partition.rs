//! Partition planning: validation and derivation over the declared layout.
//!
//! The plan keeps two orders. Creation order (declaration order) drives
//! partitioning and formatting; mount order (ascending path depth, stable)
//! drives mounting so a parent directory is mounted before anything nested
//! beneath it.

use serde::{Deserialize, Serialize};

use crate::core::types::{BootMode, PartitionFormat};
use crate::error::{ProvisionError, Result};

/// One declared partition, as written in `kdev.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub format: PartitionFormat,
    pub size_gb: u32,
    pub mount_point: String,
}

impl PartitionSpec {
    pub fn new(format: PartitionFormat, size_gb: u32, mount_point: &str) -> Self {
        Self {
            format,
            size_gb,
            mount_point: mount_point.to_string(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.mount_point == "/"
    }
}

/// A declared partition paired with its 1-based partition number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPartition {
    pub number: u32,
    pub spec: PartitionSpec,
}

/// Validated partition layout for one boot mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    boot_mode: BootMode,
    partitions: Vec<PlannedPartition>,
    mount_order: Vec<PlannedPartition>,
}

impl PartitionPlan {
    pub fn boot_mode(&self) -> BootMode {
        self.boot_mode
    }

    /// Partitions in creation (declaration) order.
    pub fn partitions(&self) -> &[PlannedPartition] {
        &self.partitions
    }

    /// Partitions sorted by ascending mount depth.
    pub fn mount_order(&self) -> &[PlannedPartition] {
        &self.mount_order
    }

    pub fn root(&self) -> &PlannedPartition {
        // Exactly one root exists and it is the only depth-0 mount point.
        &self.mount_order[0]
    }

    /// The FAT partition holding firmware boot data, if the layout has one.
    pub fn efi(&self) -> Option<&PlannedPartition> {
        self.partitions
            .iter()
            .find(|p| p.spec.format == PartitionFormat::Fat)
    }

    pub fn device_path(&self, entry: &PlannedPartition) -> String {
        derive_device_path(entry, self.boot_mode)
    }

    pub fn total_size_gb(&self) -> u64 {
        self.partitions.iter().map(|p| u64::from(p.spec.size_gb)).sum()
    }
}

/// Validate the declared layout and derive partition numbers and mount order.
pub fn parse(raw_specs: &[PartitionSpec], boot_mode: BootMode) -> Result<PartitionPlan> {
    for spec in raw_specs {
        validate_mount_point(&spec.mount_point)?;
        if spec.size_gb == 0 {
            return Err(ProvisionError::Config(format!(
                "partition mounted at {:?} must have size_gb > 0",
                spec.mount_point
            )));
        }
    }

    for (idx, spec) in raw_specs.iter().enumerate() {
        if raw_specs[..idx]
            .iter()
            .any(|prev| prev.mount_point == spec.mount_point)
        {
            return Err(ProvisionError::Config(format!(
                "mount point {:?} is declared more than once",
                spec.mount_point
            )));
        }
    }

    let roots = raw_specs.iter().filter(|s| s.is_root()).count();
    match roots {
        1 => {}
        0 => {
            return Err(ProvisionError::Config(
                "no partition is mounted at \"/\"".to_string(),
            ));
        }
        n => {
            return Err(ProvisionError::Config(format!(
                "{n} partitions are mounted at \"/\", expected exactly one"
            )));
        }
    }

    if boot_mode == BootMode::Uefi {
        let fats = raw_specs
            .iter()
            .filter(|s| s.format == PartitionFormat::Fat)
            .count();
        match fats {
            1 => {}
            0 => {
                return Err(ProvisionError::Config(
                    "UEFI boot requires a fat partition, none declared".to_string(),
                ));
            }
            n => {
                return Err(ProvisionError::Config(format!(
                    "UEFI boot requires exactly one fat partition, {n} declared"
                )));
            }
        }
    }

    let partitions: Vec<PlannedPartition> = raw_specs
        .iter()
        .zip(1u32..)
        .map(|(spec, number)| PlannedPartition {
            number,
            spec: spec.clone(),
        })
        .collect();

    let mut mount_order = partitions.clone();
    // `sort_by_key` is stable: equal depths keep declaration order.
    mount_order.sort_by_key(|p| mount_depth(&p.spec.mount_point));

    Ok(PartitionPlan {
        boot_mode,
        partitions,
        mount_order,
    })
}

/// Number of path components below `/` ("/" = 0, "/boot/efi" = 2).
pub fn mount_depth(mount_point: &str) -> usize {
    mount_point.split('/').filter(|c| !c.is_empty()).count()
}

/// Whole-disk device node the installer sees for the target image.
pub fn disk_device(boot_mode: BootMode) -> &'static str {
    match boot_mode {
        BootMode::Uefi => "/dev/vda",
        BootMode::Bios => "/dev/sda",
    }
}

/// QEMU `if=` drive interface matching [`disk_device`].
pub fn disk_interface(boot_mode: BootMode) -> &'static str {
    match boot_mode {
        BootMode::Uefi => "virtio",
        BootMode::Bios => "ide",
    }
}

/// Device node for a planned partition under the given boot mode.
///
/// Used by both the installer and the generated launch scripts.
pub fn derive_device_path(entry: &PlannedPartition, boot_mode: BootMode) -> String {
    format!("{}{}", disk_device(boot_mode), entry.number)
}

fn validate_mount_point(mount_point: &str) -> Result<()> {
    if !mount_point.starts_with('/') {
        return Err(ProvisionError::Config(format!(
            "mount point {mount_point:?} must be an absolute path"
        )));
    }
    if mount_point == "/" {
        return Ok(());
    }
    let components: Vec<&str> = mount_point[1..].split('/').collect();
    if components
        .iter()
        .any(|c| c.is_empty() || *c == "." || *c == "..")
    {
        return Err(ProvisionError::Config(format!(
            "mount point {mount_point:?} must be a normalized path"
        )));
    }
    Ok(())
}
