//! Sizing and partitioning the target disk.
//!
//! The target gets two partitions: an ext3 data partition and a swap
//! partition taking the rest. The command strings below are what the
//! bootstrap OS expects and must not change shape.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use super::host::{LocalHost, args};
use super::models::{DiskLayout, SwapDevice};
use super::remote::{RemoteSession, run_checked};
use crate::error::{MigrationError, Result};

const MEGABYTE: u64 = 1024 * 1024;

pub struct TargetDisk {
    host: Arc<dyn LocalHost>,
    target_mount: PathBuf,
}

impl TargetDisk {
    pub fn new(host: Arc<dyn LocalHost>, target_mount: impl Into<PathBuf>) -> Self {
        Self {
            host,
            target_mount: target_mount.into(),
        }
    }

    /// Return the first candidate that is a block device on the target.
    pub async fn find(&self, session: &dyn RemoteSession, candidates: &[String]) -> Result<String> {
        for disk in candidates {
            let output = session.run(&format!("test -b {}", disk)).await?;
            if output.succeeded() {
                info!(disk = %disk, "Found target hard drive");
                return Ok(disk.clone());
            }
        }
        Err(MigrationError::Sizing(
            "Could not locate a hard drive on the target.".to_string(),
        ))
    }

    /// Work out the total size of `disk` and how much of it becomes swap.
    pub async fn determine_layout(
        &self,
        session: &dyn RemoteSession,
        swap_devices: &[SwapDevice],
        disk: &str,
    ) -> Result<DiskLayout> {
        info!("Determining partition sizes");

        let command = format!("blockdev --getsize64 {}", disk);
        let output = run_checked(session, &command).await?;
        let total_bytes = first_number(&output.stdout).ok_or_else(|| {
            MigrationError::Sizing(format!(
                "Could not read size of {} from `{}`: {:?}",
                disk, command, output.stdout
            ))
        })?;
        let total_megabytes = total_bytes / MEGABYTE;

        let mut swap_megabytes = 0;
        for device in swap_devices {
            let path = self.resolve(device).await?;
            match self.local_size(&path).await {
                Some(bytes) => swap_megabytes += bytes / MEGABYTE,
                // The device has gone missing, so just ignore it.
                None => warn!(device = %device, "Could not size swap device, ignoring it"),
            }
        }

        if swap_megabytes == 0 {
            return Err(MigrationError::Sizing(
                "No swap devices found, so swap size could not be determined.".to_string(),
            ));
        }

        let layout = DiskLayout::compute(total_megabytes, swap_megabytes);
        info!(
            total_mb = layout.total_megabytes,
            swap_mb = layout.swap_megabytes,
            "{} MB disk, {} MB reserved for swap",
            layout.total_megabytes,
            layout.swap_megabytes
        );
        Ok(layout)
    }

    /// Turn a `UUID=`/`LABEL=` reference into a device path.
    async fn resolve(&self, device: &SwapDevice) -> Result<String> {
        if !device.is_reference() {
            return Ok(device.as_str().to_string());
        }

        let output = self
            .host
            .run("findfs", &args([device.as_str()]))
            .await
            .map_err(|e| MigrationError::Sizing(format!("Failed to run findfs: {}", e)))?;

        let path = output.stdout.trim();
        if output.succeeded() && !path.is_empty() {
            Ok(path.to_string())
        } else {
            Err(MigrationError::Sizing(format!(
                "Swap device {} not found",
                device
            )))
        }
    }

    async fn local_size(&self, device: &str) -> Option<u64> {
        let output = self
            .host
            .run("blockdev", &args(["--getsize64", device]))
            .await
            .ok()?;
        if !output.succeeded() {
            return None;
        }
        first_number(&output.stdout)
    }

    /// Partition, format and mount the target disk, retrying once after
    /// cleaning the target up.
    pub async fn partition(
        &self,
        session: &dyn RemoteSession,
        layout: &DiskLayout,
        disk: &str,
    ) -> Result<()> {
        info!(disk = %disk, "Partitioning disks");

        let commands = PartitionCommands::new(disk, layout, &self.target_mount);

        // Only a nonzero exit is retried; a broken channel is fatal as is.
        match commands.run(session).await {
            Ok(()) => {}
            Err(first @ MigrationError::RemoteCommand { .. }) => {
                warn!(error = %first, "Partitioning failed, retrying");
                cleanup_target(session, &self.target_mount).await;

                commands.run(session).await.map_err(|second| match second {
                    MigrationError::RemoteCommand { .. } => {
                        MigrationError::Partition(second.to_string())
                    }
                    other => other,
                })?;
            }
            Err(other) => return Err(other),
        }

        info!("Partitioning done");
        Ok(())
    }
}

/// The fixed command sequence that lays out the target disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionCommands {
    pub sfdisk: String,
    pub format_and_mount: String,
}

impl PartitionCommands {
    pub fn new(disk: &str, layout: &DiskLayout, target_mount: &Path) -> Self {
        let target = target_mount.display();
        let sfdisk = format!(
            "sfdisk -uM {} <<EOF\n0,{},83\n,,82\nEOF\n",
            disk,
            layout.data_megabytes()
        );
        let format_and_mount = [
            format!("mkfs.ext3 {}1", disk),
            format!("mkswap {}2", disk),
            format!("mkdir -p {}", target),
            format!("mount {}1 {}", disk, target),
        ]
        .join(" && ");

        Self {
            sfdisk,
            format_and_mount,
        }
    }

    async fn run(&self, session: &dyn RemoteSession) -> Result<()> {
        run_checked(session, &self.sfdisk).await?;
        run_checked(session, &self.format_and_mount).await?;
        Ok(())
    }
}

/// The command that unmounts and removes the target mount point.
pub fn cleanup_command(target_mount: &Path) -> String {
    let target = target_mount.display();
    format!("umount {} ; rmdir {}", target, target)
}

/// Make the target look untouched. Failures are logged only, since there
/// may simply be nothing mounted.
///
/// Returns whether the remote command succeeded.
pub async fn cleanup_target(session: &dyn RemoteSession, target_mount: &Path) -> bool {
    match run_checked(session, &cleanup_command(target_mount)).await {
        Ok(_) => true,
        Err(e) => {
            warn!(error = %e, "Target cleanup reported a problem");
            false
        }
    }
}

fn first_number(output: &str) -> Option<u64> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse().ok())
}
