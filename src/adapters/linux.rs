use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::unistd::Uid;
use tokio::process::Command;

use crate::core::host::LocalHost;
use crate::core::models::CommandOutput;

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// The real machine the transfer OS is running on.
pub struct LinuxHost;

#[async_trait]
impl LocalHost for LinuxHost {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn is_privileged(&self) -> bool {
        Uid::effective().is_root()
    }

    fn is_block_device(&self, path: &Path) -> std::io::Result<bool> {
        Ok(std::fs::metadata(path)?.file_type().is_block_device())
    }

    fn is_regular_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn create_dir(&self, path: &Path) -> std::io::Result<()> {
        std::fs::create_dir(path)
    }

    fn read_to_string(&self, path: &Path) -> std::io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn is_mount_point(&self, path: &Path) -> std::io::Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        let mount_info = std::fs::read_to_string(MOUNTINFO)?;
        let path = path.canonicalize()?;
        Ok(mount_points(&mount_info).iter().any(|m| *m == path))
    }

    async fn pause(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Mount points listed in `/proc/self/mountinfo` content.
///
/// Malformed lines are skipped.
pub fn mount_points(mount_info: &str) -> Vec<PathBuf> {
    mount_info
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape_mount_field(field)))
        .collect()
}

/// Undo the kernel's octal escaping (`\040` for space and friends).
fn unescape_mount_field(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'\\' && index + 3 < bytes.len() {
            let octal = std::str::from_utf8(&bytes[index + 1..index + 4]).unwrap_or("");
            if let Ok(num) = u8::from_str_radix(octal, 8) {
                output.push(num);
                index += 4;
                continue;
            }
        }
        output.push(bytes[index]);
        index += 1;
    }

    String::from_utf8_lossy(&output).into_owned()
}
