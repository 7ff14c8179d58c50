//! Rootfs disk image and firmware store preparation.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::core::partition::PartitionPlan;
use crate::core::types::ImageFormat;
use crate::io::process::{ToolInvocation, ToolRunner};

const QEMU_IMG_TIMEOUT: Duration = Duration::from_secs(120);

/// Image size: every partition plus 1 GB of headroom for the partition table
/// and alignment.
pub fn image_size_gb(plan: &PartitionPlan) -> u64 {
    plan.total_size_gb() + 1
}

/// Delete any existing image and create a fresh, empty one.
#[instrument(skip_all, fields(path = %path.display(), format = format.as_str(), size_gb = size_gb))]
pub fn prepare_image<R: ToolRunner>(
    runner: &R,
    path: &Path,
    format: ImageFormat,
    size_gb: u64,
) -> Result<()> {
    if path.exists() {
        info!("removing existing image");
        fs::remove_file(path).with_context(|| format!("remove image {}", path.display()))?;
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let inv = ToolInvocation::new("qemu-img")
        .args(["create", "-f", format.as_str()])
        .arg(path.display().to_string())
        .arg(format!("{size_gb}G"))
        .timeout(QEMU_IMG_TIMEOUT);
    runner.run(&inv)?;
    info!("image created");
    Ok(())
}

/// Give the new image its own writable copy of the UEFI variable store.
pub fn prepare_firmware_vars(template: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::copy(template, dest).with_context(|| {
        format!(
            "copy UEFI vars {} -> {}",
            template.display(),
            dest.display()
        )
    })?;
    Ok(())
}
