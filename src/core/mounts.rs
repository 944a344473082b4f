//! Mounting the source machine's filesystems under one local root.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::fstab;
use super::host::{LocalHost, args};
use super::models::{DeviceTable, FilesystemEntry};
use super::state::MigrationTracker;
use crate::error::{MigrationError, MountError, Result};

#[derive(Debug, Clone)]
pub struct UnmountPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for UnmountPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

pub struct SourceMounts {
    host: Arc<dyn LocalHost>,
    root: PathBuf,
    unmount: UnmountPolicy,
}

impl SourceMounts {
    pub fn new(host: Arc<dyn LocalHost>, root: impl Into<PathBuf>, unmount: UnmountPolicy) -> Self {
        Self {
            host,
            root: root.into(),
            unmount,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Mount the source root device, read its device table (unless `table`
    /// is given) and mount every other listed filesystem beneath the root.
    ///
    /// Each successful mount is recorded in `tracker` as it happens. Only a
    /// root failure is returned; other entries that fail are skipped.
    pub async fn mount_all(
        &self,
        root_device: &str,
        table: Option<&str>,
        tracker: &MigrationTracker,
    ) -> Result<DeviceTable> {
        info!(device = %root_device, root = %self.root.display(), "Mounting root filesystem");

        if !self.host.is_dir(&self.root) {
            self.host.create_dir(&self.root).map_err(|e| MountError::Root {
                device: root_device.to_string(),
                mount_point: self.root.clone(),
                reason: format!("cannot create mount root: {}", e),
            })?;
        }

        let root_entry = FilesystemEntry::new(root_device, "/");
        self.mount(&root_entry).await.map_err(|reason| MountError::Root {
            device: root_device.to_string(),
            mount_point: self.root.clone(),
            reason,
        })?;
        tracker.record_mount(root_entry).await;

        let table = match table {
            Some(text) => fstab::parse(text),
            None => fstab::parse(&self.read_table()?),
        };

        info!("Mounting filesystems to copy");
        for entry in table.filesystems.iter().filter(|e| !e.is_root()) {
            match self.mount_entry(entry).await {
                Ok(()) => tracker.record_mount(entry.clone()).await,
                Err(e) => warn!(error = %e, "Continuing without this filesystem"),
            }
        }

        Ok(table)
    }

    fn read_table(&self) -> Result<String> {
        let path = self.root.join("etc").join("fstab");
        self.host.read_to_string(&path).map_err(|e| {
            MigrationError::DeviceTable(format!(
                "Error reading {} to find filesystems: {}",
                path.display(),
                e
            ))
        })
    }

    /// Mount one non-root entry at its translated path.
    pub async fn mount_entry(&self, entry: &FilesystemEntry) -> std::result::Result<(), MountError> {
        self.mount(entry)
            .await
            .map_err(|reason| MountError::Filesystem {
                device: entry.device.clone(),
                mount_point: entry.path_under(&self.root),
                reason,
            })
    }

    async fn mount(&self, entry: &FilesystemEntry) -> std::result::Result<(), String> {
        let target = entry.path_under(&self.root);
        debug!(device = %entry.device, target = %target.display(), "Mounting");

        let target = target.to_string_lossy();
        let output = self
            .host
            .run("mount", &args([entry.device.as_str(), target.as_ref()]))
            .await
            .map_err(|e| e.to_string())?;

        if output.succeeded() {
            Ok(())
        } else {
            Err(format!(
                "mount exited with {}: {}",
                output.status_text(),
                output.stderr.trim()
            ))
        }
    }

    /// Unmount `entries` in reverse order, retrying busy mounts.
    ///
    /// Paths that are not mounted are skipped. Every entry is attempted even
    /// when an earlier one fails; the failures are reported together.
    pub async fn unmount_all(&self, entries: &[FilesystemEntry]) -> Result<()> {
        let mut failed = Vec::new();

        for entry in entries.iter().rev() {
            let target = entry.path_under(&self.root);

            match self.host.is_mount_point(&target) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(target = %target.display(), "Not mounted, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(target = %target.display(), error = %e, "Could not check mount state, trying anyway");
                }
            }

            if !self.unmount_with_retries(&target).await {
                warn!(target = %target.display(), "Error unmounting");
                failed.push(target);
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(MigrationError::Unmount { failed })
        }
    }

    async fn unmount_with_retries(&self, target: &Path) -> bool {
        for attempt in 1..=self.unmount.attempts {
            match self.host.run("umount", &args([target.to_string_lossy()])).await {
                Ok(output) if output.succeeded() => {
                    debug!(target = %target.display(), attempt, "Unmounted");
                    return true;
                }
                Ok(output) => {
                    debug!(target = %target.display(), attempt, stderr = %output.stderr.trim(), "umount failed");
                }
                Err(e) => {
                    debug!(target = %target.display(), attempt, error = %e, "umount failed to run");
                }
            }

            if attempt < self.unmount.attempts {
                self.host.pause(self.unmount.delay).await;
            }
        }
        false
    }
}
