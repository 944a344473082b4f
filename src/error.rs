use std::path::PathBuf;

use thiserror::Error;

/// Failure while mounting part of the source machine.
///
/// The two variants carry different weight: a root failure aborts the run,
/// a filesystem failure is logged and the entry is skipped.
#[derive(Error, Debug)]
pub enum MountError {
    #[error("Error mounting root device {device} on {mount_point}: {reason}")]
    Root {
        device: String,
        mount_point: PathBuf,
        reason: String,
    },

    #[error("Could not mount {device} on {mount_point}: {reason}")]
    Filesystem {
        device: String,
        mount_point: PathBuf,
        reason: String,
    },
}

/// Error types for a migration run
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Mount(#[from] MountError),

    #[error("{0}")]
    DeviceTable(String),

    #[error("Sizing error: {0}")]
    Sizing(String),

    #[error("Partitioning failed: {0}")]
    Partition(String),

    #[error("Error using rsync to transfer files: {0}")]
    Transfer(String),

    #[error("Fix scripts failed: {0}")]
    Fixup(String),

    #[error("Error unmounting {}", display_paths(.failed))]
    Unmount { failed: Vec<PathBuf> },

    #[error(
        "Modules matching instance kernel {kernel} not present on source OS. \
         If your kernel does not use modules, you may want the --skip-kernel-check option."
    )]
    KernelMismatch { kernel: String },

    #[error(
        "Remote command returned nonzero exit status: {command}\nstatus: {status}\nstdout:\n{stdout}\nstderr:\n{stderr}"
    )]
    RemoteCommand {
        command: String,
        status: String,
        stdout: String,
        stderr: String,
    },

    #[error("Unexpected failure: {0}")]
    Unexpected(String),

    #[error("Interrupted")]
    Interrupted,
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias for migration operations
pub type Result<T> = std::result::Result<T, MigrationError>;
