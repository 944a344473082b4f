use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::core::transfer_engine::{TransferEngine, TransferRequest};
use crate::error::{MigrationError, Result};
use crate::logging::LogThrottle;

/// Archive, hard links, ACLs, xattrs, sparse files, compression.
const RSYNC_FLAGS: &str = "-aHAXSz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub bytes_copied: u64,
    pub percentage: u8,
}

pub struct RsyncEngine {
    progress_interval: Duration,
}

impl Default for RsyncEngine {
    fn default() -> Self {
        Self {
            progress_interval: Duration::from_secs(5),
        }
    }
}

impl RsyncEngine {
    pub fn command_args(request: &TransferRequest) -> Vec<String> {
        vec![
            RSYNC_FLAGS.to_string(),
            "--info=progress2".to_string(),
            "-e".to_string(),
            request.transport.clone(),
            request.source_contents(),
            request.destination.clone(),
        ]
    }
}

fn progress_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // "  12,345,678   45%  10.2MB/s    0:01:02"
    PATTERN.get_or_init(|| Regex::new(r"^\s*([\d,]+)\s+(\d+)%").expect("valid progress regex"))
}

/// Parse one `--info=progress2` status line.
pub fn parse_progress(line: &str) -> Option<Progress> {
    let captures = progress_pattern().captures(line)?;
    let bytes_copied = captures.get(1)?.as_str().replace(',', "").parse().ok()?;
    let percentage = captures.get(2)?.as_str().parse().ok()?;
    Some(Progress {
        bytes_copied,
        percentage,
    })
}

#[async_trait]
impl TransferEngine for RsyncEngine {
    async fn transfer(&self, request: &TransferRequest) -> Result<()> {
        info!(
            source = %request.source.display(),
            destination = %request.destination,
            "Transferring files. This will take a while..."
        );

        let args = Self::command_args(request);
        debug!(args = ?args, "Spawning rsync");

        let mut child = Command::new("rsync")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| MigrationError::Transfer(format!("failed to spawn rsync: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MigrationError::Transfer("rsync stdout unavailable".to_string()))?;
        let stderr = child.stderr.take();

        let stderr_task = tokio::spawn(async move {
            let mut collected = String::new();
            if let Some(mut stderr) = stderr {
                if let Err(e) = stderr.read_to_string(&mut collected).await {
                    debug!(error = %e, "Failed to read rsync stderr");
                }
            }
            collected
        });

        let throttle = LogThrottle::new(self.progress_interval);
        let mut reader = BufReader::new(stdout);
        let mut line_buffer = Vec::new();
        let mut byte_buffer = [0u8; 1];
        let mut last = None;

        // progress2 rewrites its line with '\r', so split on both.
        while let Ok(n) = reader.read(&mut byte_buffer).await {
            if n == 0 {
                break;
            }

            let b = byte_buffer[0];
            if b != b'\r' && b != b'\n' {
                line_buffer.push(b);
                continue;
            }
            if line_buffer.is_empty() {
                continue;
            }

            let line = String::from_utf8_lossy(&line_buffer);
            if let Some(progress) = parse_progress(&line) {
                last = Some(progress);
                if throttle.should_log() {
                    info!(
                        bytes_copied = progress.bytes_copied,
                        percentage = progress.percentage,
                        "Transfer progress"
                    );
                }
            }
            line_buffer.clear();
        }

        let status = child
            .wait()
            .await
            .map_err(|e| MigrationError::Transfer(format!("failed to wait for rsync: {}", e)))?;
        let stderr = stderr_task.await.unwrap_or_default();

        if status.success() {
            if let Some(progress) = last {
                info!(bytes_copied = progress.bytes_copied, "Transfer complete");
            }
            Ok(())
        } else {
            Err(MigrationError::Transfer(format!(
                "rsync exited with {}: {}",
                status,
                stderr.trim()
            )))
        }
    }
}
