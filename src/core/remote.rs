//! Remote command sessions to the target instance.
//!
//! A `RemoteSession` is one authenticated channel to a single host. Commands
//! are shell strings; `run` blocks the caller until the remote process exits.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::models::CommandOutput;
use crate::error::{MigrationError, Result};

/// Opens sessions. Kept separate from the session so the orchestrator can be
/// driven against simulated targets.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Authenticate to `host` as `user` with the private key at `key_file`.
    ///
    /// Fails with `MigrationError::Connection`.
    async fn connect(
        &self,
        host: &str,
        user: &str,
        key_file: &Path,
    ) -> Result<Arc<dyn RemoteSession>>;
}

#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run a shell command remotely and wait for it to finish.
    ///
    /// A nonzero exit is not an error here; only a broken channel is
    /// (`MigrationError::Connection`).
    async fn run(&self, command: &str) -> Result<CommandOutput>;

    /// Tear the channel down. Never fails; problems are logged.
    async fn close(&self);

    /// Extra arguments for a bulk copy tool to reuse this channel, as the
    /// value of rsync's `-e` option.
    fn transport_command(&self) -> String;

    fn host(&self) -> String;

    fn user(&self) -> String;
}

/// Run a remote command, turning a nonzero exit into
/// `MigrationError::RemoteCommand`.
pub async fn run_checked(session: &dyn RemoteSession, command: &str) -> Result<CommandOutput> {
    debug!(command = %command, "Running remote command");
    let output = session.run(command).await?;

    if output.succeeded() {
        Ok(output)
    } else {
        Err(MigrationError::RemoteCommand {
            command: command.to_string(),
            status: output.status_text(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}
