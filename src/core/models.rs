use std::fmt;
use std::path::{Path, PathBuf};

/// Swap is capped at this fraction (in percent) of the target disk.
const SWAP_CAP_PERCENT: u64 = 10;

/// A regular filesystem listed in the source device table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemEntry {
    /// Device path, or a `UUID=`/`LABEL=` reference.
    pub device: String,
    pub mount_point: String,
}

impl FilesystemEntry {
    pub fn new(device: impl Into<String>, mount_point: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            mount_point: mount_point.into(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.mount_point == "/"
    }

    /// Where this entry lives once the source root is mounted at `root`.
    pub fn path_under(&self, root: &Path) -> PathBuf {
        let relative = self.mount_point.trim_start_matches('/');
        if relative.is_empty() {
            root.to_path_buf()
        } else {
            root.join(relative)
        }
    }
}

/// A swap device reference from the device table. Sized, never mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapDevice(pub String);

impl SwapDevice {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `UUID=` and `LABEL=` references need resolving before they can be queried.
    pub fn is_reference(&self) -> bool {
        self.0.starts_with("UUID=") || self.0.starts_with("LABEL=")
    }
}

impl fmt::Display for SwapDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parsed contents of a device table, in source order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceTable {
    pub filesystems: Vec<FilesystemEntry>,
    pub swap_devices: Vec<SwapDevice>,
}

/// Size split for the target disk, in whole megabytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskLayout {
    pub total_megabytes: u64,
    pub swap_megabytes: u64,
}

impl DiskLayout {
    /// Swap is the smaller of what the source had and 10% of the target.
    pub fn compute(total_megabytes: u64, source_swap_megabytes: u64) -> Self {
        let cap = total_megabytes * SWAP_CAP_PERCENT / 100;
        Self {
            total_megabytes,
            swap_megabytes: source_swap_megabytes.min(cap),
        }
    }

    pub fn data_megabytes(&self) -> u64 {
        self.total_megabytes - self.swap_megabytes
    }
}

/// Exit status and captured output of one finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal or the channel dropped.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success() -> Self {
        Self {
            status: Some(0),
            ..Default::default()
        }
    }

    pub fn with_stdout(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == Some(0)
    }

    pub fn status_text(&self) -> String {
        match self.status {
            Some(code) => code.to_string(),
            None => "terminated".to_string(),
        }
    }
}

/// Where a migration run has got to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Connected,
    SourceMounted,
    Sized,
    Partitioned,
    Transferred,
    FixedUp,
    ShutDown,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Connected => "connected",
            Self::SourceMounted => "source-mounted",
            Self::Sized => "sized",
            Self::Partitioned => "partitioned",
            Self::Transferred => "transferred",
            Self::FixedUp => "fixed-up",
            Self::ShutDown => "shut-down",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
