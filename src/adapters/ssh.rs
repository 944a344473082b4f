//! OpenSSH-backed remote sessions.
//!
//! Connecting starts one control master for the run; every command and the
//! rsync transfer are multiplexed over it, and closing the session stops it.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::{AppConfig, HostKeyPolicy};
use crate::core::models::CommandOutput;
use crate::core::remote::{RemoteConnector, RemoteSession};
use crate::error::{MigrationError, Result};

/// `ssh` exits with this status when the connection itself failed.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Options shared by every `ssh` invocation of one session.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub key_file: PathBuf,
    pub host_key_policy: HostKeyPolicy,
    pub known_hosts: PathBuf,
    pub connect_timeout_secs: u64,
    pub control_path: PathBuf,
}

impl SshOptions {
    pub fn args(&self) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.key_file.display().to_string(),
            "-o".to_string(),
            "IdentitiesOnly=yes".to_string(),
            "-o".to_string(),
            "PasswordAuthentication=no".to_string(),
            "-o".to_string(),
            format!(
                "StrictHostKeyChecking={}",
                self.host_key_policy.strict_host_key_checking()
            ),
            "-o".to_string(),
            format!("UserKnownHostsFile={}", self.known_hosts.display()),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
        ]
    }

    /// The full `ssh ...` command line, quoted for rsync's `-e`.
    pub fn command_line(&self) -> String {
        std::iter::once("ssh".to_string())
            .chain(self.args().into_iter().map(|arg| quote(&arg)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn quote(arg: &str) -> String {
    if arg.chars().any(|c| c.is_whitespace() || c == '\'' || c == '"') {
        format!("'{}'", arg.replace('\'', r"'\''"))
    } else {
        arg.to_string()
    }
}

pub struct SshConnector {
    host_key_policy: HostKeyPolicy,
    known_hosts: PathBuf,
    connect_timeout_secs: u64,
    poll_interval: Duration,
    slow_command: Duration,
}

impl SshConnector {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            host_key_policy: config.host_key_policy,
            known_hosts: config.known_hosts.clone(),
            connect_timeout_secs: config.connect_timeout_secs,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            slow_command: Duration::from_secs(config.slow_command_secs),
        }
    }

    async fn check_key(&self, key_file: &Path) -> Result<()> {
        info!(key = %key_file.display(), "Loading SSH key");

        let output = Command::new("ssh-keygen")
            .args(["-y", "-P", "", "-f"])
            .arg(key_file)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| MigrationError::Connection(format!("Failed to run ssh-keygen: {}", e)))?;

        if !output.status.success() {
            return Err(MigrationError::Connection(format!(
                "Key file {} is missing, invalid or encrypted",
                key_file.display()
            )));
        }

        Ok(())
    }

    fn ensure_known_hosts_dir(&self) -> Result<()> {
        if let Some(dir) = self.known_hosts.parent() {
            std::fs::create_dir_all(dir).map_err(|e| {
                MigrationError::Connection(format!(
                    "Unexpected error editing known_hosts file: {}. Please make sure that {} exists and is writable",
                    e,
                    self.known_hosts.display()
                ))
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn connect(
        &self,
        host: &str,
        user: &str,
        key_file: &Path,
    ) -> Result<Arc<dyn RemoteSession>> {
        self.check_key(key_file).await?;
        self.ensure_known_hosts_dir()?;

        let options = SshOptions {
            key_file: key_file.to_path_buf(),
            host_key_policy: self.host_key_policy,
            known_hosts: self.known_hosts.clone(),
            connect_timeout_secs: self.connect_timeout_secs,
            control_path: std::env::temp_dir().join(format!("p2v-{}-%C", std::process::id())),
        };
        let destination = format!("{}@{}", user, host);

        info!(host = %host, user = %user, "Connecting to instance");

        // The master backgrounds itself once authenticated. Host key prompts
        // go to the controlling terminal, so stderr stays attached.
        let status = Command::new("ssh")
            .args(options.args())
            .args(["-M", "-f", "-N", "-o", "ControlPersist=yes"])
            .arg(&destination)
            .stdin(Stdio::inherit())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| MigrationError::Connection(format!("Failed to run ssh: {}", e)))?;

        if !status.success() {
            return Err(MigrationError::Connection(format!(
                "Problem connecting to instance {}: ssh exited with {}",
                host, status
            )));
        }

        info!(host = %host, "Connected");

        Ok(Arc::new(SshSession {
            host: host.to_string(),
            user: user.to_string(),
            destination,
            options,
            poll_interval: self.poll_interval,
            slow_command: self.slow_command,
        }))
    }
}

pub struct SshSession {
    host: String,
    user: String,
    destination: String,
    options: SshOptions,
    poll_interval: Duration,
    slow_command: Duration,
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn run(&self, command: &str) -> Result<CommandOutput> {
        let mut child = Command::new("ssh")
            .args(self.options.args())
            .args(["-o", "ControlMaster=no", "-T"])
            .arg(&self.destination)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| MigrationError::Connection(format!("Failed to spawn ssh: {}", e)))?;

        // Drain both pipes while polling so a chatty command cannot stall.
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let finished = wait_for_exit(&mut child, self.poll_interval, self.slow_command).await?;
        debug!(
            command = %command,
            status = ?finished.status.code(),
            slow = finished.slow,
            "Remote command finished"
        );

        let stdout = collect(stdout).await;
        let stderr = collect(stderr).await;

        interpret(&self.host, command, finished.status, stdout, stderr)
    }

    async fn close(&self) {
        let result = Command::new("ssh")
            .args(self.options.args())
            .args(["-O", "exit"])
            .arg(&self.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match result {
            Ok(status) if status.success() => debug!(host = %self.host, "Closed SSH control master"),
            Ok(status) => debug!(host = %self.host, %status, "SSH control master already gone"),
            Err(e) => warn!(host = %self.host, error = %e, "Failed to close SSH control master"),
        }
    }

    fn transport_command(&self) -> String {
        self.options.command_line()
    }

    fn host(&self) -> String {
        self.host.clone()
    }

    fn user(&self) -> String {
        self.user.clone()
    }
}

/// How a polled `ssh` child ended.
#[derive(Debug)]
struct Finished {
    status: ExitStatus,
    /// Whether the slow-command notice was given while waiting.
    slow: bool,
}

/// Poll `child` until it exits. Once it has run longer than `slow_command`
/// the user is told, once, and told again when it completes.
async fn wait_for_exit(
    child: &mut Child,
    poll_interval: Duration,
    slow_command: Duration,
) -> Result<Finished> {
    let start = Instant::now();
    let mut slow = false;

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => {
                return Err(MigrationError::Connection(format!(
                    "Failed to wait for remote command: {}",
                    e
                )));
            }
        }

        if !slow && start.elapsed() > slow_command {
            slow = true;
            info!(
                "The current command is taking a while to complete. Please make sure the \
                 instance is still pingable. If so, try waiting another few minutes."
            );
        }

        tokio::time::sleep(poll_interval).await;
    };

    if slow {
        info!("The command has completed.");
    }

    Ok(Finished { status, slow })
}

/// Turn the exit of `ssh` into command output. Exit status 255 belongs to
/// ssh itself, so it means the connection went away.
fn interpret(
    host: &str,
    command: &str,
    status: ExitStatus,
    stdout: String,
    stderr: String,
) -> Result<CommandOutput> {
    if status.code() == Some(SSH_CONNECTION_FAILURE) {
        return Err(MigrationError::Connection(format!(
            "Lost connection to {} while running `{}`: {}",
            host,
            command,
            stderr.trim()
        )));
    }

    Ok(CommandOutput {
        status: status.code(),
        stdout,
        stderr,
    })
}

fn drain<R>(mut pipe: R) -> tokio::task::JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            debug!(error = %e, "Failed to read command output");
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

async fn collect(handle: Option<tokio::task::JoinHandle<String>>) -> String {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(policy: HostKeyPolicy) -> SshOptions {
        SshOptions {
            key_file: PathBuf::from("/root/.ssh/id_dsa"),
            host_key_policy: policy,
            known_hosts: PathBuf::from("/root/.ssh/known_hosts"),
            connect_timeout_secs: 30,
            control_path: PathBuf::from("/tmp/p2v-1-%C"),
        }
    }

    #[test]
    fn args_carry_key_and_host_key_policy() {
        let args = options(HostKeyPolicy::TrustStore).args();
        assert_eq!(args[0], "-i");
        assert_eq!(args[1], "/root/.ssh/id_dsa");
        assert!(args.contains(&"StrictHostKeyChecking=yes".to_string()));
        assert!(args.contains(&"UserKnownHostsFile=/root/.ssh/known_hosts".to_string()));
        assert!(args.contains(&"ControlPath=/tmp/p2v-1-%C".to_string()));
        assert!(!args.iter().any(|a| a.ends_with("=no") && a.starts_with("StrictHostKeyChecking")));
    }

    #[test]
    fn command_line_quotes_paths_with_spaces() {
        let mut opts = options(HostKeyPolicy::Ask);
        opts.key_file = PathBuf::from("/root/my keys/id_dsa");
        let line = opts.command_line();
        assert!(line.starts_with("ssh -i '/root/my keys/id_dsa' "));
        assert!(line.contains("StrictHostKeyChecking=ask"));
    }

    #[test]
    fn quote_escapes_single_quotes() {
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote("plain"), "plain");
    }

    fn shell(script: &str) -> Child {
        Command::new("sh")
            .args(["-c", script])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn slow_command_gives_notice_and_keeps_status() {
        let mut child = shell("sleep 0.2; exit 3");

        let finished = wait_for_exit(
            &mut child,
            Duration::from_millis(10),
            Duration::from_millis(50),
        )
        .await
        .unwrap();

        assert!(finished.slow);
        assert_eq!(finished.status.code(), Some(3));
    }

    #[tokio::test]
    async fn quick_command_gives_no_notice() {
        let mut child = shell("exit 0");

        let finished = wait_for_exit(&mut child, Duration::from_millis(10), Duration::from_secs(5))
            .await
            .unwrap();

        assert!(!finished.slow);
        assert!(finished.status.success());
    }

    #[tokio::test]
    async fn ssh_exit_255_is_a_lost_connection() {
        let mut child = shell("exit 255");
        let finished = wait_for_exit(&mut child, Duration::from_millis(10), Duration::from_secs(5))
            .await
            .unwrap();

        let result = interpret(
            "vm1.example.org",
            "sync",
            finished.status,
            String::new(),
            "Connection reset by peer\n".to_string(),
        );

        match result {
            Err(MigrationError::Connection(message)) => {
                assert!(message.contains("vm1.example.org"));
                assert!(message.contains("Connection reset by peer"));
            }
            other => panic!("expected a connection error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn remote_failure_is_returned_as_output() {
        let mut child = shell("exit 3");
        let finished = wait_for_exit(&mut child, Duration::from_millis(10), Duration::from_secs(5))
            .await
            .unwrap();

        let output = interpret("vm1", "false", finished.status, "out".to_string(), "err".to_string())
            .unwrap();

        assert_eq!(output.status, Some(3));
        assert!(!output.succeeded());
        assert_eq!(output.stdout, "out");
    }

    struct BrokenPipe;

    impl tokio::io::AsyncRead for BrokenPipe {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe)))
        }
    }

    #[tokio::test]
    async fn drain_survives_read_errors() {
        let output = drain(BrokenPipe).await.unwrap();
        assert_eq!(output, "");
    }
}
