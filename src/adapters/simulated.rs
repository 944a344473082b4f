//! Simulated host and target.
//!
//! Every command is recorded and answered from a script of prefix rules;
//! commands no rule matches succeed with empty output. Used by the test
//! suite and by `--simulation` rehearsals.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::core::host::LocalHost;
use crate::core::models::CommandOutput;
use crate::core::remote::{RemoteConnector, RemoteSession};
use crate::error::{MigrationError, Result};

/// A scripted answer: command output, or a broken channel.
pub type Reply = std::result::Result<CommandOutput, String>;

struct Rule {
    prefix: String,
    replies: VecDeque<Reply>,
}

/// Prefix rules; the most recently added matching rule answers. A rule's
/// replies are used in order and the last one repeats.
#[derive(Default)]
struct Script {
    rules: Vec<Rule>,
}

impl Script {
    fn add(&mut self, prefix: &str, replies: Vec<Reply>) {
        self.rules.push(Rule {
            prefix: prefix.to_string(),
            replies: replies.into(),
        });
    }

    fn reply(&mut self, command: &str) -> Reply {
        let Some(rule) = self
            .rules
            .iter_mut()
            .rev()
            .find(|r| command.starts_with(&r.prefix))
        else {
            return Ok(CommandOutput::success());
        };

        if rule.replies.len() > 1 {
            rule.replies.pop_front().unwrap_or_else(|| Ok(CommandOutput::success()))
        } else {
            rule.replies
                .front()
                .cloned()
                .unwrap_or_else(|| Ok(CommandOutput::success()))
        }
    }
}

/// In-memory stand-in for the transfer OS.
pub struct SimulatedHost {
    privileged: AtomicBool,
    commands: Mutex<Vec<String>>,
    script: Mutex<Script>,
    mounted: Mutex<Vec<PathBuf>>,
    files: Mutex<HashMap<PathBuf, String>>,
    dirs: Mutex<HashSet<PathBuf>>,
    read_only_dirs: Mutex<HashSet<PathBuf>>,
    block_devices: Mutex<HashSet<PathBuf>>,
    pauses: AtomicUsize,
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHost {
    pub fn new() -> Self {
        Self {
            privileged: AtomicBool::new(true),
            commands: Mutex::new(Vec::new()),
            script: Mutex::new(Script::default()),
            mounted: Mutex::new(Vec::new()),
            files: Mutex::new(HashMap::new()),
            dirs: Mutex::new(HashSet::new()),
            read_only_dirs: Mutex::new(HashSet::new()),
            block_devices: Mutex::new(HashSet::new()),
            pauses: AtomicUsize::new(0),
        }
    }

    pub fn set_privileged(&self, privileged: bool) {
        self.privileged.store(privileged, Ordering::Relaxed);
    }

    pub fn add_block_device(&self, path: impl Into<PathBuf>) {
        self.block_devices.lock().unwrap().insert(path.into());
    }

    pub fn add_file(&self, path: impl Into<PathBuf>, content: impl Into<String>) {
        self.files.lock().unwrap().insert(path.into(), content.into());
    }

    pub fn add_dir(&self, path: impl Into<PathBuf>) {
        self.dirs.lock().unwrap().insert(path.into());
    }

    /// Make directory creation at `path` fail.
    pub fn deny_dir(&self, path: impl Into<PathBuf>) {
        self.read_only_dirs.lock().unwrap().insert(path.into());
    }

    /// Answer commands starting with `prefix` with `replies`, in order.
    pub fn script(&self, prefix: &str, replies: Vec<Reply>) {
        self.script.lock().unwrap().add(prefix, replies);
    }

    /// Every command run so far, as `program arg arg...`.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Currently mounted paths, in mount order.
    pub fn mounted(&self) -> Vec<PathBuf> {
        self.mounted.lock().unwrap().clone()
    }

    pub fn pause_count(&self) -> usize {
        self.pauses.load(Ordering::Relaxed)
    }

    fn track_mounts(&self, program: &str, args: &[String]) {
        let mut mounted = self.mounted.lock().unwrap();
        match (program, args) {
            ("mount", [_, target]) => mounted.push(PathBuf::from(target)),
            ("umount", [target]) => {
                let target = PathBuf::from(target);
                if let Some(pos) = mounted.iter().rposition(|m| *m == target) {
                    mounted.remove(pos);
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl LocalHost for SimulatedHost {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        let line = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        self.commands.lock().unwrap().push(line.clone());

        let reply = self.script.lock().unwrap().reply(&line);
        let output = reply.map_err(std::io::Error::other)?;

        if output.succeeded() {
            self.track_mounts(program, args);
        }

        Ok(output)
    }

    fn is_privileged(&self) -> bool {
        self.privileged.load(Ordering::Relaxed)
    }

    fn is_block_device(&self, path: &Path) -> std::io::Result<bool> {
        if self.block_devices.lock().unwrap().contains(path) {
            return Ok(true);
        }
        if self.exists(path) {
            return Ok(false);
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{}: No such file or directory", path.display()),
        ))
    }

    fn is_regular_file(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path)
            || self.dirs.lock().unwrap().contains(path)
            || self.block_devices.lock().unwrap().contains(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.dirs.lock().unwrap().contains(path)
    }

    fn create_dir(&self, path: &Path) -> std::io::Result<()> {
        if self.read_only_dirs.lock().unwrap().contains(path) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "Permission denied",
            ));
        }
        self.add_dir(path);
        Ok(())
    }

    fn read_to_string(&self, path: &Path) -> std::io::Result<String> {
        self.files.lock().unwrap().get(path).cloned().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{}: No such file or directory", path.display()),
            )
        })
    }

    fn is_mount_point(&self, path: &Path) -> std::io::Result<bool> {
        Ok(self.mounted.lock().unwrap().iter().any(|m| m == path))
    }

    async fn pause(&self, _duration: Duration) {
        self.pauses.fetch_add(1, Ordering::Relaxed);
    }
}

/// Hands out one shared `SimulatedSession`.
pub struct SimulatedConnector {
    session: Arc<SimulatedSession>,
    refusal: Mutex<Option<String>>,
    attempts: AtomicUsize,
}

impl SimulatedConnector {
    pub fn new(session: Arc<SimulatedSession>) -> Self {
        Self {
            session,
            refusal: Mutex::new(None),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Make every connection attempt fail with `reason`.
    pub fn refuse(&self, reason: impl Into<String>) {
        *self.refusal.lock().unwrap() = Some(reason.into());
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RemoteConnector for SimulatedConnector {
    async fn connect(
        &self,
        host: &str,
        user: &str,
        _key_file: &Path,
    ) -> Result<Arc<dyn RemoteSession>> {
        self.attempts.fetch_add(1, Ordering::Relaxed);

        if let Some(reason) = self.refusal.lock().unwrap().clone() {
            return Err(MigrationError::Connection(format!(
                "Problem connecting to instance {}: {}",
                host, reason
            )));
        }

        self.session.set_identity(host, user);
        Ok(self.session.clone())
    }
}

/// A scripted target instance.
pub struct SimulatedSession {
    host: Mutex<String>,
    user: Mutex<String>,
    commands: Mutex<Vec<String>>,
    script: Mutex<Script>,
    closed: AtomicBool,
}

impl Default for SimulatedSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedSession {
    pub fn new() -> Self {
        Self {
            host: Mutex::new("simulated".to_string()),
            user: Mutex::new("root".to_string()),
            commands: Mutex::new(Vec::new()),
            script: Mutex::new(Script::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn script(&self, prefix: &str, replies: Vec<Reply>) {
        self.script.lock().unwrap().add(prefix, replies);
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn set_identity(&self, host: &str, user: &str) {
        *self.host.lock().unwrap() = host.to_string();
        *self.user.lock().unwrap() = user.to_string();
    }
}

#[async_trait]
impl RemoteSession for SimulatedSession {
    async fn run(&self, command: &str) -> Result<CommandOutput> {
        self.commands.lock().unwrap().push(command.to_string());
        let reply = self.script.lock().unwrap().reply(command);
        reply.map_err(MigrationError::Connection)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    fn transport_command(&self) -> String {
        "ssh -o ControlPath=simulated".to_string()
    }

    fn host(&self) -> String {
        self.host.lock().unwrap().clone()
    }

    fn user(&self) -> String {
        self.user.lock().unwrap().clone()
    }
}

/// Seed simulated adapters with a small but complete source machine and
/// target, so a rehearsal run walks every stage.
pub fn rehearsal(
    root_device: &str,
    key_file: &Path,
    source_mount: &Path,
) -> (Arc<SimulatedHost>, Arc<SimulatedSession>) {
    let host = Arc::new(SimulatedHost::new());
    host.add_block_device(root_device);
    host.add_file(key_file, "");
    host.add_dir(source_mount);
    host.add_file(
        source_mount.join("etc/fstab"),
        format!(
            "# simulated source\n{} / ext3 errors=remount-ro 0 1\n/dev/sda5 none swap sw 0 0\n",
            root_device
        ),
    );
    host.script(
        "blockdev --getsize64 /dev/sda5",
        vec![Ok(CommandOutput::with_stdout("1073741824\n"))],
    );
    host.add_dir(source_mount.join("lib/modules/simulated"));

    let session = Arc::new(SimulatedSession::new());
    session.script("uname -r", vec![Ok(CommandOutput::with_stdout("simulated\n"))]);
    session.script(
        "blockdev --getsize64",
        vec![Ok(CommandOutput::with_stdout("21474836480\n"))],
    );

    info!("Simulation mode: no commands will be run on this machine or the target");
    (host, session)
}
