//! Shared deterministic types for provisioning core logic.
//!
//! These types define stable contracts between the planner, the installer and
//! the build pipeline. They should not depend on external state or I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Firmware boot mode of the installer VM (and of the image it produces).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BootMode {
    #[serde(rename = "UEFI", alias = "uefi")]
    Uefi,
    #[serde(rename = "BIOS", alias = "bios")]
    Bios,
}

impl fmt::Display for BootMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootMode::Uefi => f.write_str("UEFI"),
            BootMode::Bios => f.write_str("BIOS"),
        }
    }
}

/// Filesystem a declared partition is formatted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionFormat {
    Fat,
    Ext4,
}

impl PartitionFormat {
    /// Shell command (without the device argument) that formats a partition.
    pub fn mkfs_command(&self) -> &'static str {
        match self {
            PartitionFormat::Fat => "mkfs.fat -F 32",
            PartitionFormat::Ext4 => "mkfs.ext4 -F",
        }
    }
}

impl fmt::Display for PartitionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionFormat::Fat => f.pad("fat"),
            PartitionFormat::Ext4 => f.pad("ext4"),
        }
    }
}

/// On-disk format of the rootfs image file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Qcow2,
    Raw,
}

impl ImageFormat {
    /// Value for `qemu-img -f` and the QEMU `format=` drive option.
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Raw => "raw",
        }
    }
}

/// Persisted checkpoint of the kernel build pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildState {
    #[default]
    NotInit,
    SrcCloned,
    SrcConfigured,
    SrcBuilt,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::NotInit => "NOT_INIT",
            BuildState::SrcCloned => "SRC_CLONED",
            BuildState::SrcConfigured => "SRC_CONFIGURED",
            BuildState::SrcBuilt => "SRC_BUILT",
        }
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
