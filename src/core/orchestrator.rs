//! Drives one migration from validation to shutdown and guarantees cleanup.
//!
//! The run itself executes in its own task. Whatever happens to it (an
//! error, a panic, or an interrupt) the orchestrator then unmounts the
//! source filesystems, removes the target mount point and closes the
//! session, in that order.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, error, info, warn};

use super::disk::{TargetDisk, cleanup_command};
use super::models::Stage;
use super::mounts::{SourceMounts, UnmountPolicy};
use super::postprocess;
use super::remote::run_checked;
use super::state::MigrationTracker;
use super::transfer_engine::TransferRequest;
use crate::context::AppContext;
use crate::error::{MigrationError, Result};

/// What to migrate and where to.
#[derive(Debug, Clone)]
pub struct MigrationRequest {
    pub root_device: String,
    pub host: String,
    pub key_file: PathBuf,
    pub skip_kernel_check: bool,
    /// Device table contents to use instead of the source's `/etc/fstab`.
    pub fstab: Option<String>,
}

fn hostname_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[-a-zA-Z0-9.]+$").expect("valid hostname regex"))
}

pub fn is_valid_hostname(host: &str) -> bool {
    hostname_pattern().is_match(host)
}

pub struct Orchestrator {
    ctx: AppContext,
    tracker: MigrationTracker,
}

impl Orchestrator {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            ctx,
            tracker: MigrationTracker::new(),
        }
    }

    pub fn tracker(&self) -> &MigrationTracker {
        &self.tracker
    }

    /// Run the migration to completion, then clean up.
    pub async fn run(&self, request: MigrationRequest) -> Result<()> {
        self.run_until(request, std::future::pending()).await
    }

    /// Like `run`, but abandons the migration when `interrupt` resolves.
    /// Cleanup still runs in that case.
    pub async fn run_until<F>(&self, request: MigrationRequest, interrupt: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let mut guard = CleanupGuard::new();

        let run = Run {
            ctx: self.ctx.clone(),
            tracker: self.tracker.clone(),
            request,
        };
        let mut handle = tokio::spawn(async move { run.drive().await });

        let finished = tokio::select! {
            joined = &mut handle => Some(joined),
            _ = interrupt => None,
        };

        let outcome = match finished {
            Some(joined) => joined,
            None => {
                warn!("Interrupted, abandoning migration");
                handle.abort();
                match handle.await {
                    Ok(result) => Ok(result),
                    Err(e) if e.is_cancelled() => Ok(Err(MigrationError::Interrupted)),
                    Err(e) => Err(e),
                }
            }
        };

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Migration task panicked");
                Err(MigrationError::Unexpected(e.to_string()))
            }
        };

        if let Err(e) = &result {
            let stage = self.tracker.stage().await;
            error!(error = %e, stage = %stage, "Migration failed");
            self.tracker.advance(Stage::Failed).await;
        }

        guard.cleanup(&self.ctx, &self.tracker).await;
        result
    }
}

/// Runs cleanup exactly once per migration. Dropping it armed means the
/// orchestrator future itself was cancelled before cleanup could run.
struct CleanupGuard {
    armed: bool,
}

impl CleanupGuard {
    fn new() -> Self {
        Self { armed: true }
    }

    async fn cleanup(&mut self, ctx: &AppContext, tracker: &MigrationTracker) {
        if !self.armed {
            return;
        }
        self.armed = false;

        info!("Cleaning up");
        let config = &ctx.config;

        let mounted = tracker.take_mounted().await;
        if !mounted.is_empty() {
            let mounts = SourceMounts::new(ctx.host.clone(), &config.source_mount, unmount_policy(ctx));
            if let Err(e) = mounts.unmount_all(&mounted).await {
                warn!(error = %e, "Source filesystems left mounted");
            }
        }

        if let Some(session) = tracker.session().await {
            let command = cleanup_command(&config.target_mount);
            match run_checked(session.as_ref(), &command).await {
                Ok(_) => debug!("Target mount point removed"),
                Err(e) if tracker.target_touched().await => {
                    warn!(error = %e, "Target cleanup reported a problem")
                }
                Err(e) => debug!(error = %e, "Nothing to clean up on target"),
            }
            session.close().await;
        }

        info!("Cleanup done");
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!("Migration dropped before cleanup; source filesystems may still be mounted");
        }
    }
}

fn unmount_policy(ctx: &AppContext) -> UnmountPolicy {
    UnmountPolicy {
        attempts: ctx.config.unmount_attempts.max(1),
        delay: Duration::from_millis(ctx.config.unmount_retry_delay_ms),
    }
}

/// The migration steps, owned so they can run on their own task.
struct Run {
    ctx: AppContext,
    tracker: MigrationTracker,
    request: MigrationRequest,
}

impl Run {
    async fn drive(self) -> Result<()> {
        let config = self.ctx.config.clone();
        let request = &self.request;

        self.validate()?;

        let session = self
            .ctx
            .connector
            .connect(&request.host, &config.user, &request.key_file)
            .await?;
        self.tracker.set_session(session.clone()).await;
        self.tracker.advance(Stage::Connected).await;

        let mounts = SourceMounts::new(
            self.ctx.host.clone(),
            &config.source_mount,
            unmount_policy(&self.ctx),
        );
        let table = mounts
            .mount_all(&request.root_device, request.fstab.as_deref(), &self.tracker)
            .await?;
        self.tracker.advance(Stage::SourceMounted).await;

        let target = TargetDisk::new(self.ctx.host.clone(), &config.target_mount);
        let disk = target.find(session.as_ref(), &config.target_disks).await?;

        if request.skip_kernel_check {
            info!("Skipping kernel compatibility check");
        } else {
            postprocess::verify_kernel(self.ctx.host.as_ref(), session.as_ref(), mounts.root()).await?;
        }

        let layout = target
            .determine_layout(session.as_ref(), &table.swap_devices, &disk)
            .await?;
        self.tracker.advance(Stage::Sized).await;

        self.tracker.mark_target_touched().await;
        target.partition(session.as_ref(), &layout, &disk).await?;
        self.tracker.advance(Stage::Partitioned).await;

        let transfer = TransferRequest::new(
            mounts.root(),
            &session.user(),
            &session.host(),
            &config.target_mount,
            session.transport_command(),
        );
        self.ctx.engine.transfer(&transfer).await?;
        self.tracker.advance(Stage::Transferred).await;

        postprocess::run_fixups(session.as_ref(), &config.fixes_command).await?;
        self.tracker.advance(Stage::FixedUp).await;

        postprocess::shutdown(session.as_ref()).await?;
        self.tracker.advance(Stage::ShutDown).await;

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let host = self.ctx.host.as_ref();
        let request = &self.request;

        if !host.is_privileged() {
            return Err(MigrationError::Validation("Must be run as root".to_string()));
        }

        let root_device = Path::new(&request.root_device);
        match host.is_block_device(root_device) {
            Ok(true) => {}
            Ok(false) => {
                return Err(MigrationError::Validation(format!(
                    "{} is not a block device",
                    request.root_device
                )));
            }
            Err(e) => {
                return Err(MigrationError::Validation(format!(
                    "Cannot access root device {}: {}",
                    request.root_device, e
                )));
            }
        }

        if !is_valid_hostname(&request.host) {
            return Err(MigrationError::Validation(format!(
                "Invalid target hostname: {}",
                request.host
            )));
        }

        if !host.is_regular_file(&request.key_file) {
            return Err(MigrationError::Validation(format!(
                "Private key {} is not a regular file",
                request.key_file.display()
            )));
        }

        Ok(())
    }
}
