//! Steps run on the target around and after the copy.

use std::path::Path;

use tracing::{info, warn};

use super::host::LocalHost;
use super::remote::{RemoteSession, run_checked};
use crate::error::{MigrationError, Result};

pub const KERNEL_RELEASE_COMMAND: &str = "uname -r";
pub const POWEROFF_COMMAND: &str = "poweroff";

/// Check that the source OS has modules for the kernel the target boots.
///
/// The bootstrap OS runs the same kernel the instance will boot, so its
/// release must name a directory under `<source_root>/lib/modules`.
pub async fn verify_kernel(
    host: &dyn LocalHost,
    session: &dyn RemoteSession,
    source_root: &Path,
) -> Result<()> {
    info!("Checking kernel compatibility...");

    let output = run_checked(session, KERNEL_RELEASE_COMMAND).await?;
    let kernel = output.stdout.trim().to_string();

    if !kernel.is_empty() && host.exists(&source_root.join("lib").join("modules").join(&kernel)) {
        info!(kernel = %kernel, "Kernel matches");
        Ok(())
    } else {
        info!(kernel = %kernel, "Kernel does not match");
        Err(MigrationError::KernelMismatch { kernel })
    }
}

/// Run the target's post-transfer fix scripts.
pub async fn run_fixups(session: &dyn RemoteSession, command: &str) -> Result<()> {
    info!("Running fix scripts...");
    run_checked(session, command)
        .await
        .map_err(|e| match e {
            MigrationError::RemoteCommand { status, stderr, .. } => MigrationError::Fixup(format!(
                "`{}` exited with {}: {}",
                command,
                status,
                stderr.trim()
            )),
            other => other,
        })?;
    info!("Fix scripts done");
    Ok(())
}

/// Power the target off. The channel may drop before an exit status
/// arrives; that counts as success.
pub async fn shutdown(session: &dyn RemoteSession) -> Result<()> {
    info!("Transfer complete! Shutting down the instance...");
    match run_checked(session, POWEROFF_COMMAND).await {
        Ok(_) => {}
        Err(MigrationError::Connection(reason)) => {
            warn!(reason = %reason, "Connection dropped during poweroff");
        }
        Err(e) => return Err(e),
    }
    info!("Shutdown issued");
    Ok(())
}
