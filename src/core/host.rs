use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use super::models::CommandOutput;

/// The machine the migration runs on: local commands and filesystem checks.
///
/// Production code uses `LinuxHost`; tests and `--simulation` use
/// `SimulatedHost`, which records commands instead of running them.
#[async_trait]
pub trait LocalHost: Send + Sync {
    /// Run a program to completion and capture its output.
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;

    /// Whether the process may mount filesystems.
    fn is_privileged(&self) -> bool;

    fn is_block_device(&self, path: &Path) -> std::io::Result<bool>;

    fn is_regular_file(&self, path: &Path) -> bool;

    fn exists(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;

    fn create_dir(&self, path: &Path) -> std::io::Result<()>;

    fn read_to_string(&self, path: &Path) -> std::io::Result<String>;

    /// Whether `path` is currently a mount point.
    fn is_mount_point(&self, path: &Path) -> std::io::Result<bool>;

    /// Pause between retries.
    async fn pause(&self, duration: Duration);
}

/// Convenience for building an argument vector from string slices.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items.into_iter().map(|s| s.as_ref().to_string()).collect()
}
